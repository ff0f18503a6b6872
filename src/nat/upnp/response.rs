//! Typed control responses.
//!
//! Each type is built by a pure parse from the raw response bytes. Faults are
//! checked first and surface as [`NatError::Fault`]; required fields that are
//! missing or fail to coerce surface as [`NatError::MalformedResponse`].

use std::net::Ipv4Addr;

use xmltree::Element;

use crate::nat::error::{NatError, NatResult};
use crate::nat::upnp::{document, Action};
use crate::nat::Protocol;

/// Locate the `<Action>Response` element, failing on faults
pub fn decode_response(action: Action, body: &[u8]) -> NatResult<Element> {
    let envelope = document::parse(body)?;

    if let Some(fault) = document::find_fault(&envelope) {
        return Err(NatError::Fault(fault));
    }

    let response_name = action.response_name();
    let soap_body = document::body(&envelope)?;
    document::child_element(soap_body, &response_name)
        .cloned()
        .ok_or_else(|| NatError::malformed(response_name, ""))
}

/// Success check for actions whose response carries no arguments
///
/// Only a fault counts as failure. Gateways answer `AddPortMapping` and
/// `DeletePortMapping` with an empty response element, an empty `Body` or no
/// document at all.
pub fn expect_empty_response(body: &[u8]) -> NatResult<()> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    let envelope = document::parse(body)?;
    match document::find_fault(&envelope) {
        Some(fault) => Err(NatError::Fault(fault)),
        None => Ok(()),
    }
}

/// Response of `AddAnyPortMapping`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddAnyPortMappingResponse {
    /// Port the gateway actually mapped
    pub new_reserved_port: u16,
}

impl AddAnyPortMappingResponse {
    /// Parse a raw response body
    pub fn parse(body: &[u8]) -> NatResult<Self> {
        let response = decode_response(Action::AddAnyPortMapping, body)?;
        Self::from_element(&response)
    }

    /// Read the arguments of an already located response element
    pub fn from_element(response: &Element) -> NatResult<Self> {
        Ok(Self {
            new_reserved_port: document::required_int(response, "NewReservedPort")?,
        })
    }
}

/// Response of `GetExternalIPAddress`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalIpResponse {
    /// WAN-side IPv4 address of the gateway
    pub external_ip: Ipv4Addr,
}

impl ExternalIpResponse {
    /// Parse a raw response body
    pub fn parse(body: &[u8]) -> NatResult<Self> {
        let response = decode_response(Action::GetExternalIPAddress, body)?;
        let text = document::child_element_text(&response, "NewExternalIPAddress")
            .ok_or_else(|| NatError::malformed("NewExternalIPAddress", ""))?;
        let external_ip = text
            .parse()
            .map_err(|_| NatError::malformed("NewExternalIPAddress", text.clone()))?;
        Ok(Self { external_ip })
    }
}

/// One row of the gateway's mapping table (`GetGenericPortMappingEntry`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingEntry {
    /// Empty means any remote host
    pub remote_host: String,
    /// External port of the mapping
    pub external_port: u16,
    /// Mapped protocol
    pub protocol: Protocol,
    /// Port on the internal client
    pub internal_port: u16,
    /// LAN host the mapping points at, as reported
    pub internal_client: String,
    /// Whether the gateway forwards traffic for the entry
    pub enabled: bool,
    /// `NewPortMappingDescription`
    pub description: String,
    /// Remaining lease in seconds; 0 is indefinite
    pub lease_duration: u32,
}

impl PortMappingEntry {
    /// Parse a raw response body
    pub fn parse(body: &[u8]) -> NatResult<Self> {
        let response = decode_response(Action::GetGenericPortMappingEntry, body)?;

        let protocol_text = document::child_element_value(&response, "NewProtocol", "");
        let protocol = protocol_text
            .parse()
            .map_err(|_| NatError::malformed("NewProtocol", protocol_text.clone()))?;

        let enabled_text = document::child_element_value(&response, "NewEnabled", "1");
        let enabled = match enabled_text.as_str() {
            "1" | "true" => true,
            "0" | "false" => false,
            _ => return Err(NatError::malformed("NewEnabled", enabled_text)),
        };

        Ok(Self {
            remote_host: document::child_element_value(&response, "NewRemoteHost", ""),
            external_port: document::required_int(&response, "NewExternalPort")?,
            protocol,
            internal_port: document::required_int(&response, "NewInternalPort")?,
            internal_client: document::child_element_value(&response, "NewInternalClient", ""),
            enabled,
            description: document::child_element_value(&response, "NewPortMappingDescription", ""),
            lease_duration: document::child_element_value_as_int(&response, "NewLeaseDuration")?
                .unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(inner: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>{}</s:Body></s:Envelope>"#,
            inner
        )
        .into_bytes()
    }

    fn add_any(port_xml: &str) -> Vec<u8> {
        envelope(&format!(
            r#"<u:AddAnyPortMappingResponse xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:2">{}</u:AddAnyPortMappingResponse>"#,
            port_xml
        ))
    }

    #[test]
    fn test_reserved_port_boundaries() {
        for port in [0u16, 1, 6667, 45000, 65535] {
            let body = add_any(&format!("<NewReservedPort>{}</NewReservedPort>", port));
            assert_eq!(
                AddAnyPortMappingResponse::parse(&body).unwrap().new_reserved_port,
                port
            );
        }
    }

    #[test]
    fn test_reserved_port_missing() {
        match AddAnyPortMappingResponse::parse(&add_any("")) {
            Err(NatError::MalformedResponse { field, .. }) => assert_eq!(field, "NewReservedPort"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reserved_port_not_numeric() {
        match AddAnyPortMappingResponse::parse(&add_any("<NewReservedPort>abc</NewReservedPort>")) {
            Err(NatError::MalformedResponse { field, raw }) => {
                assert_eq!(field, "NewReservedPort");
                assert_eq!(raw, "abc");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reserved_port_out_of_range() {
        for text in ["65536", "-1", "4294967296"] {
            let body = add_any(&format!("<NewReservedPort>{}</NewReservedPort>", text));
            match AddAnyPortMappingResponse::parse(&body) {
                Err(NatError::MalformedResponse { raw, .. }) => assert_eq!(raw, text),
                other => panic!("unexpected {:?} for {}", other, text),
            }
        }
    }

    #[test]
    fn test_fault_is_surfaced() {
        let body = envelope(
            r#"<s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring>
            <detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>606</errorCode>
            <errorDescription>Action not authorized</errorDescription></UPnPError></detail></s:Fault>"#,
        );
        match AddAnyPortMappingResponse::parse(&body) {
            Err(NatError::Fault(fault)) => {
                assert_eq!(fault.error_code, Some(606));
                assert!(!fault.is_conflict());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wrong_response_element() {
        let body = envelope(r#"<u:AddPortMappingResponse xmlns:u="urn:x"/>"#);
        match AddAnyPortMappingResponse::parse(&body) {
            Err(NatError::MalformedResponse { field, .. }) => {
                assert_eq!(field, "AddAnyPortMappingResponse")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(expect_empty_response(&body).is_ok());
    }

    #[test]
    fn test_empty_response_only_fails_on_fault() {
        assert!(expect_empty_response(b"").is_ok());
        assert!(expect_empty_response(b"\r\n").is_ok());
        assert!(expect_empty_response(&envelope("")).is_ok());
        assert!(expect_empty_response(&envelope("<u:AddPortMappingResponse xmlns:u=\"urn:x\"></u:AddPortMappingResponse>")).is_ok());

        let fault = envelope(
            r#"<s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring>
            <detail><UPnPError><errorCode>718</errorCode></UPnPError></detail></s:Fault>"#,
        );
        match expect_empty_response(&fault) {
            Err(NatError::Fault(fault)) => assert!(fault.is_conflict()),
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            expect_empty_response(b"<not xml"),
            Err(NatError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_external_ip() {
        let body = envelope(
            r#"<u:GetExternalIPAddressResponse xmlns:u="urn:x"><NewExternalIPAddress>203.0.113.7</NewExternalIPAddress></u:GetExternalIPAddressResponse>"#,
        );
        assert_eq!(
            ExternalIpResponse::parse(&body).unwrap().external_ip,
            Ipv4Addr::new(203, 0, 113, 7)
        );

        let body = envelope(
            r#"<u:GetExternalIPAddressResponse xmlns:u="urn:x"><NewExternalIPAddress>not-an-ip</NewExternalIPAddress></u:GetExternalIPAddressResponse>"#,
        );
        assert!(matches!(
            ExternalIpResponse::parse(&body),
            Err(NatError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_generic_entry() {
        let body = envelope(
            r#"<u:GetGenericPortMappingEntryResponse xmlns:u="urn:x">
            <NewRemoteHost></NewRemoteHost><NewExternalPort>45000</NewExternalPort>
            <NewProtocol>TCP</NewProtocol><NewInternalPort>6668</NewInternalPort>
            <NewInternalClient>192.168.1.20</NewInternalClient><NewEnabled>1</NewEnabled>
            <NewPortMappingDescription>dcc</NewPortMappingDescription><NewLeaseDuration>540</NewLeaseDuration>
            </u:GetGenericPortMappingEntryResponse>"#,
        );
        let entry = PortMappingEntry::parse(&body).unwrap();
        assert_eq!(entry.external_port, 45000);
        assert_eq!(entry.internal_port, 6668);
        assert_eq!(entry.protocol, Protocol::TCP);
        assert!(entry.enabled);
        assert_eq!(entry.lease_duration, 540);
        assert_eq!(entry.remote_host, "");
    }
}
