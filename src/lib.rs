//! DCC port mapping library (lib.rs)
//!
//! UPnP Internet Gateway Device client that reserves external ports for
//! direct chat connections and file transfers, keeps the leases alive for as
//! long as the owning session needs them, and releases them afterwards.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod nat;

// Re-export main types
pub use nat::lease::{
    ActiveMapping, LeaseManager, LeaseStats, MappingEvent, MappingKey, MappingRequest,
    MappingState, SessionId,
};
pub use nat::upnp::{ControlTransport, GatewayEndpoint, HttpTransport};
pub use nat::{LeaseConfig, Protocol};

// Re-export error types
pub use nat::error::{ControlFault, NatError, NatResult, TransportError, UpnpErrorCode};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error)
///
/// # Example
/// ```
/// dcc_portmap::init_logging("info");
/// ```
///
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Reduce verbosity of some dependencies
    for directive in ["reqwest=warn", "hyper=warn", "hyper_util=warn", "tokio=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .try_init();
}
