//! Control request encoding.
//!
//! Every constructor validates its arguments before anything is rendered, so
//! an `InvalidRequest` never costs a network round trip.

use std::net::Ipv4Addr;

use crate::nat::error::{NatError, NatResult};
use crate::nat::upnp::{document, Action};
use crate::nat::Protocol;

/// Parameters of an `AddPortMapping` / `AddAnyPortMapping` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingRequest {
    /// Mapped protocol
    pub protocol: Protocol,
    /// Port on the internal client, never 0
    pub internal_port: u16,
    /// LAN host the mapping points at
    pub internal_client: Ipv4Addr,
    /// `None` asks the gateway to pick any free port
    pub external_port: Option<u16>,
    /// Seconds; 0 requests an indefinite lease
    pub lease_duration: u32,
    /// `NewPortMappingDescription`
    pub description: String,
    /// Whether the gateway should forward traffic right away
    pub enabled: bool,
}

impl PortMappingRequest {
    /// Reject values no gateway accepts
    pub fn validate(&self) -> NatResult<()> {
        if self.internal_port == 0 {
            return Err(NatError::InvalidRequest("internal port must be non-zero".into()));
        }
        if self.external_port == Some(0) {
            return Err(NatError::InvalidRequest(
                "external port must be within 1-65535, leave it unset for any port".into(),
            ));
        }
        if self.internal_client.is_unspecified() || self.internal_client.is_broadcast() {
            return Err(NatError::InvalidRequest(format!(
                "internal client {} is not a host address",
                self.internal_client
            )));
        }
        Ok(())
    }
}

/// Encoded control request ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    /// Action invoked
    pub action: Action,
    /// Service type used as the action namespace
    pub service_type: String,
    /// Arguments in wire order
    pub arguments: Vec<(&'static str, String)>,
}

impl ControlRequest {
    fn new(action: Action, service_type: &str, arguments: Vec<(&'static str, String)>) -> Self {
        Self {
            action,
            service_type: service_type.to_string(),
            arguments,
        }
    }

    /// `AddPortMapping` for a concrete external port
    ///
    /// With no external port in the request the internal port is asked for.
    pub fn add_port_mapping(service_type: &str, request: &PortMappingRequest) -> NatResult<Self> {
        request.validate()?;
        let external_port = request.external_port.unwrap_or(request.internal_port);
        Ok(Self::new(
            Action::AddPortMapping,
            service_type,
            mapping_arguments(request, external_port),
        ))
    }

    /// `AddAnyPortMapping`; the requested external port is only a hint
    pub fn add_any_port_mapping(service_type: &str, request: &PortMappingRequest) -> NatResult<Self> {
        request.validate()?;
        let hint = request.external_port.unwrap_or(request.internal_port);
        Ok(Self::new(
            Action::AddAnyPortMapping,
            service_type,
            mapping_arguments(request, hint),
        ))
    }

    /// `DeletePortMapping` for a mapping on any remote host
    pub fn delete_port_mapping(service_type: &str, protocol: Protocol, external_port: u16) -> NatResult<Self> {
        if external_port == 0 {
            return Err(NatError::InvalidRequest("external port must be within 1-65535".into()));
        }
        Ok(Self::new(
            Action::DeletePortMapping,
            service_type,
            vec![
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", external_port.to_string()),
                ("NewProtocol", protocol.as_str().to_string()),
            ],
        ))
    }

    /// `GetExternalIPAddress`
    pub fn get_external_ip_address(service_type: &str) -> Self {
        Self::new(Action::GetExternalIPAddress, service_type, Vec::new())
    }

    /// One row of the gateway's mapping table
    pub fn get_generic_port_mapping_entry(service_type: &str, index: u16) -> Self {
        Self::new(
            Action::GetGenericPortMappingEntry,
            service_type,
            vec![("NewPortMappingIndex", index.to_string())],
        )
    }

    /// Value of the `SOAPAction` header, quotes included
    pub fn soap_action(&self) -> String {
        format!("\"{}#{}\"", self.service_type, self.action.name())
    }

    /// Request body
    pub fn to_soap_body(&self) -> String {
        document::envelope(self.action.name(), &self.service_type, &self.arguments)
    }

    /// Value of a named argument, for logging and tests
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments
            .iter()
            .find(|(arg, _)| *arg == name)
            .map(|(_, value)| value.as_str())
    }
}

fn mapping_arguments(request: &PortMappingRequest, external_port: u16) -> Vec<(&'static str, String)> {
    vec![
        ("NewRemoteHost", String::new()),
        ("NewExternalPort", external_port.to_string()),
        ("NewProtocol", request.protocol.as_str().to_string()),
        ("NewInternalPort", request.internal_port.to_string()),
        ("NewInternalClient", request.internal_client.to_string()),
        ("NewEnabled", encode_bool(request.enabled).to_string()),
        ("NewPortMappingDescription", request.description.clone()),
        ("NewLeaseDuration", request.lease_duration.to_string()),
    ]
}

fn encode_bool(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::upnp::WAN_IP_CONNECTION_V2;

    fn request() -> PortMappingRequest {
        PortMappingRequest {
            protocol: Protocol::TCP,
            internal_port: 6667,
            internal_client: Ipv4Addr::new(192, 168, 1, 20),
            external_port: Some(6667),
            lease_duration: 600,
            description: "dcc".to_string(),
            enabled: true,
        }
    }

    #[test]
    fn test_add_port_mapping_argument_order() {
        let req = ControlRequest::add_port_mapping(WAN_IP_CONNECTION_V2, &request()).unwrap();
        let names: Vec<_> = req.arguments.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            [
                "NewRemoteHost",
                "NewExternalPort",
                "NewProtocol",
                "NewInternalPort",
                "NewInternalClient",
                "NewEnabled",
                "NewPortMappingDescription",
                "NewLeaseDuration",
            ]
        );
        assert_eq!(req.argument("NewEnabled"), Some("1"));
        assert_eq!(req.argument("NewLeaseDuration"), Some("600"));
        assert_eq!(req.argument("NewInternalClient"), Some("192.168.1.20"));
        assert_eq!(
            req.soap_action(),
            "\"urn:schemas-upnp-org:service:WANIPConnection:2#AddPortMapping\""
        );
    }

    #[test]
    fn test_disabled_mapping_encodes_zero() {
        let mut r = request();
        r.enabled = false;
        let req = ControlRequest::add_port_mapping(WAN_IP_CONNECTION_V2, &r).unwrap();
        assert_eq!(req.argument("NewEnabled"), Some("0"));
    }

    #[test]
    fn test_any_port_uses_internal_port_as_hint() {
        let mut r = request();
        r.external_port = None;
        r.internal_port = 6668;
        let req = ControlRequest::add_any_port_mapping(WAN_IP_CONNECTION_V2, &r).unwrap();
        assert_eq!(req.action, Action::AddAnyPortMapping);
        assert_eq!(req.argument("NewExternalPort"), Some("6668"));
    }

    #[test]
    fn test_invalid_requests_are_rejected() {
        let mut r = request();
        r.internal_port = 0;
        assert!(matches!(
            ControlRequest::add_port_mapping(WAN_IP_CONNECTION_V2, &r),
            Err(NatError::InvalidRequest(_))
        ));

        let mut r = request();
        r.external_port = Some(0);
        assert!(matches!(
            ControlRequest::add_any_port_mapping(WAN_IP_CONNECTION_V2, &r),
            Err(NatError::InvalidRequest(_))
        ));

        let mut r = request();
        r.internal_client = Ipv4Addr::UNSPECIFIED;
        assert!(r.validate().is_err());

        assert!(ControlRequest::delete_port_mapping(WAN_IP_CONNECTION_V2, Protocol::UDP, 0).is_err());
    }

    #[test]
    fn test_delete_and_query_requests() {
        let req = ControlRequest::delete_port_mapping(WAN_IP_CONNECTION_V2, Protocol::UDP, 45000).unwrap();
        assert_eq!(req.argument("NewExternalPort"), Some("45000"));
        assert_eq!(req.argument("NewProtocol"), Some("UDP"));
        assert_eq!(req.argument("NewRemoteHost"), Some(""));

        let req = ControlRequest::get_external_ip_address(WAN_IP_CONNECTION_V2);
        assert!(req.arguments.is_empty());
        assert!(req.to_soap_body().contains("<u:GetExternalIPAddress "));

        let req = ControlRequest::get_generic_port_mapping_entry(WAN_IP_CONNECTION_V2, 3);
        assert_eq!(req.argument("NewPortMappingIndex"), Some("3"));
    }
}
