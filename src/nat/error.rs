//! Errors raised while mapping ports on a gateway.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::nat::Protocol;

/// Error types for port mapping operations
#[derive(Debug, Clone, Error)]
pub enum NatError {
    /// A required field was absent, or present but not coercible to its type
    #[error("Malformed response: field {field} has invalid value {raw:?}")]
    MalformedResponse {
        /// Element the value was expected in
        field: String,
        /// Offending text, empty when the element was missing
        raw: String,
    },

    /// Caller supplied an out-of-range or contradictory parameter
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The control request never produced a response document
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The gateway answered with a SOAP fault
    #[error("Gateway fault: {0}")]
    Fault(#[from] ControlFault),

    /// A previously active mapping lost its lease after exhausted renewals
    #[error("Mapping {protocol} {internal_port} -> {external_port} expired: {cause}")]
    Expired {
        /// Port on the internal client
        internal_port: u16,
        /// External port that was lost
        external_port: u16,
        /// Mapped protocol
        protocol: Protocol,
        /// Failure of the last renewal attempt
        #[source]
        cause: Box<NatError>,
    },

    /// The in-flight request was cancelled by its caller
    #[error("Mapping request cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No local IPv4 address could reach the gateway
    #[error("No local IPv4 address routes to gateway {0}")]
    NoLocalAddress(std::net::IpAddr),
}

impl NatError {
    pub(crate) fn malformed(field: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::MalformedResponse {
            field: field.into(),
            raw: raw.into(),
        }
    }

    /// UPnP error code carried by a gateway fault, if any
    pub fn upnp_error_code(&self) -> Option<UpnpErrorCode> {
        match self {
            Self::Fault(fault) => fault.upnp_error_code(),
            _ => None,
        }
    }

    /// Whether the error is worth another attempt with identical arguments
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Outcome classification for a control exchange that did not yield a document
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response within the allotted time
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The gateway refused or reset the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// HTTP status other than success or a SOAP fault carrier
    #[error("Unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    /// Any other I/O failure while exchanging the request
    #[error("I/O error: {0}")]
    Io(String),
}

/// SOAP fault reported by the gateway instead of a normal response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFault {
    /// `faultcode`, usually `s:Client`
    pub fault_code: String,

    /// `faultstring`, usually `UPnPError`
    pub fault_string: String,

    /// `detail/UPnPError/errorCode`
    pub error_code: Option<u16>,

    /// `detail/UPnPError/errorDescription`
    pub error_description: Option<String>,
}

impl ControlFault {
    /// Known UPnP error code, if the fault carried one
    pub fn upnp_error_code(&self) -> Option<UpnpErrorCode> {
        self.error_code.and_then(UpnpErrorCode::from_code)
    }

    /// The requested external port is already mapped to someone else
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.upnp_error_code(),
            Some(UpnpErrorCode::ConflictInMappingEntry)
        )
    }
}

impl fmt::Display for ControlFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.fault_code, self.fault_string)?;
        match (self.error_code, &self.error_description) {
            (Some(code), Some(desc)) => write!(f, " ({}: {})", code, desc),
            (Some(code), None) => write!(f, " ({})", code),
            (None, Some(desc)) => write!(f, " ({})", desc),
            (None, None) => Ok(()),
        }
    }
}

impl std::error::Error for ControlFault {}

/// UPnP error codes from the IGD control protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum UpnpErrorCode {
    /// Invalid action
    InvalidAction = 401,

    /// Invalid args
    InvalidArgs = 402,

    /// Action failed
    ActionFailed = 501,

    /// Argument value invalid
    ArgumentValueInvalid = 600,

    /// Argument value out of range
    ArgumentValueOutOfRange = 601,

    /// Optional action not implemented
    OptionalActionNotImplemented = 602,

    /// Action not authorized
    ActionNotAuthorized = 606,

    /// Index past the end of the mapping table
    SpecifiedArrayIndexInvalid = 713,

    /// Port mapping not found
    NoSuchEntryInArray = 714,

    /// Wild card not permitted in source IP
    WildCardNotPermittedInSrcIp = 715,

    /// Wild card not permitted in external port
    WildCardNotPermittedInExtPort = 716,

    /// Port mapping conflict
    ConflictInMappingEntry = 718,

    /// Same port values required
    SamePortValuesRequired = 724,

    /// Only permanent lease supported
    OnlyPermanentLeasesSupported = 725,

    /// Remote host only supports wildcard
    RemoteHostOnlySupportsWildcard = 726,

    /// External port only supports wildcard
    ExternalPortOnlySupportsWildcard = 727,

    /// No port maps available
    NoPortMapsAvailable = 728,

    /// Conflict with other mechanism
    ConflictWithOtherMechanism = 729,
}

impl fmt::Display for UpnpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAction => write!(f, "Invalid Action"),
            Self::InvalidArgs => write!(f, "Invalid Arguments"),
            Self::ActionFailed => write!(f, "Action Failed"),
            Self::ArgumentValueInvalid => write!(f, "Argument Value Invalid"),
            Self::ArgumentValueOutOfRange => write!(f, "Argument Value Out of Range"),
            Self::OptionalActionNotImplemented => write!(f, "Optional Action Not Implemented"),
            Self::ActionNotAuthorized => write!(f, "Action Not Authorized"),
            Self::SpecifiedArrayIndexInvalid => write!(f, "Specified Array Index Invalid"),
            Self::NoSuchEntryInArray => write!(f, "No Such Entry in Array"),
            Self::WildCardNotPermittedInSrcIp => write!(f, "Wildcard Not Permitted in Source IP"),
            Self::WildCardNotPermittedInExtPort => write!(f, "Wildcard Not Permitted in External Port"),
            Self::ConflictInMappingEntry => write!(f, "Conflict in Mapping Entry"),
            Self::SamePortValuesRequired => write!(f, "Same Port Values Required"),
            Self::OnlyPermanentLeasesSupported => write!(f, "Only Permanent Leases Supported"),
            Self::RemoteHostOnlySupportsWildcard => write!(f, "Remote Host Only Supports Wildcard"),
            Self::ExternalPortOnlySupportsWildcard => write!(f, "External Port Only Supports Wildcard"),
            Self::NoPortMapsAvailable => write!(f, "No Port Maps Available"),
            Self::ConflictWithOtherMechanism => write!(f, "Conflict with Other Mechanism"),
        }
    }
}

impl UpnpErrorCode {
    /// Convert from u16 error code
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            401 => Some(Self::InvalidAction),
            402 => Some(Self::InvalidArgs),
            501 => Some(Self::ActionFailed),
            600 => Some(Self::ArgumentValueInvalid),
            601 => Some(Self::ArgumentValueOutOfRange),
            602 => Some(Self::OptionalActionNotImplemented),
            606 => Some(Self::ActionNotAuthorized),
            713 => Some(Self::SpecifiedArrayIndexInvalid),
            714 => Some(Self::NoSuchEntryInArray),
            715 => Some(Self::WildCardNotPermittedInSrcIp),
            716 => Some(Self::WildCardNotPermittedInExtPort),
            718 => Some(Self::ConflictInMappingEntry),
            724 => Some(Self::SamePortValuesRequired),
            725 => Some(Self::OnlyPermanentLeasesSupported),
            726 => Some(Self::RemoteHostOnlySupportsWildcard),
            727 => Some(Self::ExternalPortOnlySupportsWildcard),
            728 => Some(Self::NoPortMapsAvailable),
            729 => Some(Self::ConflictWithOtherMechanism),
            _ => None,
        }
    }

    /// Marks the end of a `GetGenericPortMappingEntry` walk
    pub fn ends_table_walk(&self) -> bool {
        matches!(
            self,
            Self::SpecifiedArrayIndexInvalid | Self::NoSuchEntryInArray | Self::InvalidArgs
        )
    }
}

/// Result type for port mapping operations
pub type NatResult<T> = Result<T, NatError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(code: Option<u16>) -> ControlFault {
        ControlFault {
            fault_code: "s:Client".to_string(),
            fault_string: "UPnPError".to_string(),
            error_code: code,
            error_description: None,
        }
    }

    #[test]
    fn test_conflict_detection() {
        assert!(fault(Some(718)).is_conflict());
        assert!(!fault(Some(606)).is_conflict());
        assert!(!fault(None).is_conflict());
    }

    #[test]
    fn test_only_transport_errors_retry() {
        assert!(NatError::Transport(TransportError::Timeout(Duration::from_secs(1))).is_retriable());
        assert!(!NatError::Fault(fault(Some(718))).is_retriable());
        assert!(!NatError::malformed("NewReservedPort", "abc").is_retriable());
        assert!(!NatError::InvalidRequest("port 0".into()).is_retriable());
    }

    #[test]
    fn test_fault_display_includes_upnp_detail() {
        let mut f = fault(Some(718));
        f.error_description = Some("ConflictInMappingEntry".to_string());
        assert_eq!(
            f.to_string(),
            "s:Client UPnPError (718: ConflictInMappingEntry)"
        );
    }

    #[test]
    fn test_expired_keeps_renewal_cause() {
        let cause = NatError::Transport(TransportError::Timeout(Duration::from_secs(5)));
        let expired = NatError::Expired {
            internal_port: 6668,
            external_port: 45000,
            protocol: Protocol::TCP,
            cause: Box::new(cause.clone()),
        };

        assert!(!expired.is_retriable());
        assert_eq!(
            expired.to_string(),
            "Mapping TCP 6668 -> 45000 expired: Transport failure: Operation timed out after 5s"
        );
        let source = std::error::Error::source(&expired).map(|e| e.to_string());
        assert_eq!(source, Some(cause.to_string()));
    }

    #[test]
    fn test_unknown_code_maps_to_none() {
        assert_eq!(UpnpErrorCode::from_code(999), None);
        assert_eq!(
            UpnpErrorCode::from_code(725),
            Some(UpnpErrorCode::OnlyPermanentLeasesSupported)
        );
    }
}
