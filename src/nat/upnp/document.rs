//! SOAP document helpers shared by the request encoder and the response model.
//!
//! Lookups match on the element's local name so that `u:NewReservedPort`,
//! `m:NewReservedPort` and an unprefixed `NewReservedPort` are the same field.
//! Gateways disagree on letter case too, so the comparison ignores it.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::str::FromStr;

use xml::escape::escape_str_pcdata;
use xmltree::{Element, XMLNode};

use crate::nat::error::{ControlFault, NatError, NatResult};

const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SOAP_ENCODING: &str = "http://schemas.xmlsoap.org/soap/encoding/";

/// Raw text kept in diagnostics is capped at this many characters
const MAX_RAW_TEXT: usize = 256;

/// Parse a response body into its root element
pub fn parse(bytes: &[u8]) -> NatResult<Element> {
    Element::parse(bytes).map_err(|e| {
        tracing::debug!("Unparsable control document: {}", e);
        NatError::malformed("<document>", truncated(&String::from_utf8_lossy(bytes)))
    })
}

/// Direct child elements, skipping text, comments and processing instructions
pub fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(child) => Some(child),
        _ => None,
    })
}

/// First direct child whose local name is `tag`
pub fn child_element<'a>(element: &'a Element, tag: &str) -> Option<&'a Element> {
    child_elements(element).find(|child| child.name.eq_ignore_ascii_case(tag))
}

/// Text of the first direct child named `tag`, or `None` when absent or blank
pub fn child_element_text(element: &Element, tag: &str) -> Option<String> {
    let text = child_element(element, tag)?.get_text()?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Text of the first direct child named `tag`, or `default` when absent or blank
pub fn child_element_value(element: &Element, tag: &str, default: &str) -> String {
    child_element_text(element, tag).unwrap_or_else(|| default.to_string())
}

/// Base-10 integer value of the child named `tag`
///
/// `Ok(None)` means the field was omitted. Text that is present but does not
/// parse as `T` (including values out of `T`'s range) is a `MalformedResponse`.
pub fn child_element_value_as_int<T: FromStr>(element: &Element, tag: &str) -> NatResult<Option<T>> {
    match child_element_text(element, tag) {
        None => Ok(None),
        Some(text) => text
            .parse::<T>()
            .map(Some)
            .map_err(|_| NatError::malformed(tag, truncated(&text))),
    }
}

/// Like [`child_element_value_as_int`] for fields the response cannot omit
pub fn required_int<T: FromStr>(element: &Element, tag: &str) -> NatResult<T> {
    child_element_value_as_int(element, tag)?.ok_or_else(|| NatError::malformed(tag, ""))
}

/// `Body` element of a SOAP envelope
pub fn body(envelope: &Element) -> NatResult<&Element> {
    if envelope.name.eq_ignore_ascii_case("Body") {
        return Ok(envelope);
    }
    child_element(envelope, "Body").ok_or_else(|| NatError::malformed("Body", ""))
}

/// The fault carried by the envelope, if the gateway reported one
pub fn find_fault(envelope: &Element) -> Option<ControlFault> {
    let fault = child_element(body(envelope).ok()?, "Fault")?;

    let upnp_error = child_element(fault, "detail").and_then(|d| child_element(d, "UPnPError"));
    let error_code = upnp_error
        .and_then(|e| child_element_text(e, "errorCode"))
        .and_then(|code| code.parse::<u16>().ok());
    let error_description = upnp_error.and_then(|e| child_element_text(e, "errorDescription"));

    Some(ControlFault {
        fault_code: child_element_value(fault, "faultcode", "s:Client"),
        fault_string: child_element_value(fault, "faultstring", "UPnPError"),
        error_code,
        error_description,
    })
}

/// Escape text for use as element content
pub fn escape(text: &str) -> Cow<'_, str> {
    escape_str_pcdata(text)
}

/// Render a SOAP 1.1 envelope invoking `action` in `service_type`
///
/// Arguments are emitted in the given order.
pub fn envelope(action: &str, service_type: &str, arguments: &[(&str, String)]) -> String {
    let mut doc = String::with_capacity(384 + arguments.len() * 48);
    doc.push_str(r#"<?xml version="1.0"?>"#);
    doc.push_str("\r\n");
    let _ = write!(
        doc,
        r#"<s:Envelope xmlns:s="{}" s:encodingStyle="{}"><s:Body><u:{} xmlns:u="{}">"#,
        SOAP_ENVELOPE_NS,
        SOAP_ENCODING,
        action,
        escape(service_type),
    );
    for (name, value) in arguments {
        let _ = write!(doc, "<{0}>{1}</{0}>", name, escape(value));
    }
    let _ = write!(doc, "</u:{}></s:Body></s:Envelope>\r\n", action);
    doc
}

fn truncated(text: &str) -> String {
    text.chars().take(MAX_RAW_TEXT).collect()
}
