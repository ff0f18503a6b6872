//! UPnP IGD control layer: endpoint description, SOAP documents and transport.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use url::Url;

use crate::nat::error::{NatError, NatResult};

pub mod document;
pub mod request;
pub mod response;
pub mod transport;

pub use self::request::{ControlRequest, PortMappingRequest};
pub use self::response::{AddAnyPortMappingResponse, ExternalIpResponse, PortMappingEntry};
pub use self::transport::{ControlTransport, HttpTransport};

/// WANIPConnection service of IGD v1 gateways
pub const WAN_IP_CONNECTION_V1: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// WANIPConnection service of IGD v2 gateways
pub const WAN_IP_CONNECTION_V2: &str = "urn:schemas-upnp-org:service:WANIPConnection:2";

/// Control actions issued by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Add a mapping for a concrete external port
    AddPortMapping,
    /// Add a mapping on any free port the gateway picks (IGD v2)
    AddAnyPortMapping,
    /// Remove a mapping
    DeletePortMapping,
    /// Query the WAN address
    GetExternalIPAddress,
    /// Read one row of the mapping table
    GetGenericPortMappingEntry,
}

impl Action {
    /// Action name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Action::AddPortMapping => "AddPortMapping",
            Action::AddAnyPortMapping => "AddAnyPortMapping",
            Action::DeletePortMapping => "DeletePortMapping",
            Action::GetExternalIPAddress => "GetExternalIPAddress",
            Action::GetGenericPortMappingEntry => "GetGenericPortMappingEntry",
        }
    }

    /// Local name of the element wrapping the action's response arguments
    pub fn response_name(&self) -> String {
        format!("{}Response", self.name())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where control requests for one gateway service are sent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GatewayEndpoint {
    /// Gateway HTTP address
    pub addr: SocketAddr,

    /// Control path of the WAN connection service
    pub control_path: String,

    /// Service type used as the action namespace
    pub service_type: String,
}

impl GatewayEndpoint {
    /// Endpoint for an IGD v2 WANIPConnection service
    pub fn new(addr: SocketAddr, control_path: impl Into<String>) -> Self {
        let mut control_path = control_path.into();
        if !control_path.starts_with('/') {
            control_path.insert(0, '/');
        }

        Self {
            addr,
            control_path,
            service_type: WAN_IP_CONNECTION_V2.to_string(),
        }
    }

    /// Override the service type reported by discovery
    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    /// Build an endpoint from the absolute control URL found during discovery
    pub fn from_control_url(control_url: &str, service_type: &str) -> NatResult<Self> {
        let url = Url::parse(control_url).map_err(|e| {
            NatError::Configuration(format!("invalid control URL {}: {}", control_url, e))
        })?;

        if url.scheme() != "http" {
            return Err(NatError::Configuration(format!(
                "unsupported control URL scheme {}",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| NatError::Configuration(format!("control URL {} has no host", control_url)))?;
        let ip: IpAddr = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| {
                NatError::Configuration(format!("control URL host {} is not an IP address", host))
            })?;
        let port = url.port_or_known_default().unwrap_or(80);

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self::new(SocketAddr::new(ip, port), path).with_service_type(service_type))
    }

    /// Absolute control URL
    pub fn control_url(&self) -> String {
        format!("http://{}{}", self.addr, self.control_path)
    }

    /// IGD v2 services implement `AddAnyPortMapping`
    pub fn supports_add_any(&self) -> bool {
        self.service_type.contains("WANIPConnection:2")
    }
}

impl fmt::Display for GatewayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.control_url(), self.service_type)
    }
}

/// Local IPv4 address the gateway can reach us on
///
/// Prefers the interface whose subnet contains the gateway and falls back to
/// the source address the OS would route through. No packet is sent.
pub fn local_ip_for_gateway(gateway: IpAddr) -> NatResult<Ipv4Addr> {
    let gateway_v4 = match gateway {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => return Err(NatError::NoLocalAddress(gateway)),
    };

    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        for iface in interfaces {
            if iface.is_loopback() {
                continue;
            }
            if let if_addrs::IfAddr::V4(v4) = &iface.addr {
                let mask = u32::from(v4.netmask);
                if u32::from(v4.ip) & mask == u32::from(gateway_v4) & mask {
                    tracing::debug!("Using interface {} ({}) for gateway {}", iface.name, v4.ip, gateway);
                    return Ok(v4.ip);
                }
            }
        }
    }

    let socket = std::net::UdpSocket::bind("0.0.0.0:0").map_err(|_| NatError::NoLocalAddress(gateway))?;
    socket
        .connect(SocketAddr::new(gateway, 1900))
        .map_err(|_| NatError::NoLocalAddress(gateway))?;
    match socket.local_addr().map(|addr| addr.ip()) {
        Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => Ok(ip),
        _ => Err(NatError::NoLocalAddress(gateway)),
    }
}
