//! NAT traversal through UPnP Internet Gateway Devices.
//!
//! The [`lease::LeaseManager`] owns every port mapping this process holds on a
//! gateway. It talks to the gateway through the [`upnp`] control layer:
//! requests are encoded by [`upnp::request`], exchanged by a
//! [`upnp::ControlTransport`] and decoded by [`upnp::response`].

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod lease;
pub mod upnp;

use self::error::NatError;

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol
    TCP,
    /// User Datagram Protocol
    UDP,
}

impl Protocol {
    /// Value of the `NewProtocol` argument
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::TCP => "TCP",
            Protocol::UDP => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = NatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::TCP),
            "UDP" => Ok(Protocol::UDP),
            other => Err(NatError::InvalidRequest(format!(
                "unsupported protocol {:?}, expected TCP or UDP",
                other
            ))),
        }
    }
}

/// Lease manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Upper bound for a single control exchange in milliseconds
    pub request_timeout_ms: u64,

    /// Attempts for the initial request when the transport fails
    pub request_attempts: u32,

    /// Fixed delay between transport retries in milliseconds
    pub retry_delay_ms: u64,

    /// Attempts per renewal before the mapping is presumed lost
    pub renewal_attempts: u32,

    /// Renew at least this many seconds before the gateway's lease runs out
    pub renewal_margin_secs: u64,

    /// Floor for the renewal delay on very short leases, in seconds
    pub min_renewal_interval_secs: u64,

    /// `NewPortMappingDescription` sent with every mapping
    pub description: String,

    /// Retry once on another external port when the requested one is taken
    pub allow_any_port_fallback: bool,

    /// Retry with an indefinite lease when the gateway only supports those
    pub permanent_lease_fallback: bool,

    /// Address announced as `NewInternalClient`; detected when unset
    pub internal_client: Option<Ipv4Addr>,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            request_attempts: 3,
            retry_delay_ms: 500,
            renewal_attempts: 3,
            renewal_margin_secs: 30,
            min_renewal_interval_secs: 1,
            description: "dcc-portmap".to_string(),
            allow_any_port_fallback: true,
            permanent_lease_fallback: true,
            internal_client: None,
            event_capacity: 64,
        }
    }
}

impl LeaseConfig {
    /// Timeout applied to every control exchange
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Pause between transport retries
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// How long before lease expiry a renewal must be sent
    pub fn renewal_margin(&self) -> Duration {
        Duration::from_secs(self.renewal_margin_secs)
    }

    /// Shortest delay between a grant and its renewal
    pub fn min_renewal_interval(&self) -> Duration {
        Duration::from_secs(self.min_renewal_interval_secs)
    }

    /// Reject settings the lease manager cannot operate with
    pub fn validate(&self) -> Result<(), NatError> {
        if self.request_timeout_ms == 0 {
            return Err(NatError::Configuration("request_timeout_ms must be positive".into()));
        }
        if self.request_attempts == 0 || self.renewal_attempts == 0 {
            return Err(NatError::Configuration("attempt counts must be at least 1".into()));
        }
        if self.min_renewal_interval_secs == 0 {
            return Err(NatError::Configuration(
                "min_renewal_interval_secs must be positive".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(NatError::Configuration("event_capacity must be at least 1".into()));
        }
        Ok(())
    }
}
