//! Control request transport.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, trace};

use crate::nat::error::{NatError, NatResult, TransportError};
use crate::nat::upnp::{ControlRequest, GatewayEndpoint};

/// Sends encoded control requests to a gateway
///
/// A response document is returned as-is even when it carries a SOAP fault;
/// interpreting faults is left to the caller.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Deliver `request` and return the raw response document
    async fn send(
        &self,
        endpoint: &GatewayEndpoint,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;
}

/// SOAP-over-HTTP transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Client without proxies or pooled connections
    pub fn new() -> NatResult<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .pool_max_idle_per_host(0)
            .user_agent(concat!("dcc-portmap/", env!("CARGO_PKG_VERSION"), " UPnP/1.1"))
            .build()
            .map_err(|e| NatError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ControlTransport for HttpTransport {
    async fn send(
        &self,
        endpoint: &GatewayEndpoint,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let url = endpoint.control_url();
        let started = Instant::now();
        debug!("Sending {} to {}", request.action, url);

        let exchange = async {
            let response = self
                .client
                .post(&url)
                .header(CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
                .header(CONNECTION, "close")
                .header("SOAPAction", request.soap_action())
                .body(request.to_soap_body())
                .timeout(timeout)
                .send()
                .await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => return Err(TransportError::Timeout(timeout)),
            Ok(Err(e)) => return Err(classify(e, timeout)),
            Ok(Ok(exchange)) => exchange,
        };

        trace!(
            "{} answered {} with {} bytes in {:?}",
            url,
            status,
            body.len(),
            started.elapsed()
        );

        // Faults travel as 500 responses carrying an envelope
        if status.is_success() || (status == StatusCode::INTERNAL_SERVER_ERROR && !body.is_empty()) {
            Ok(body)
        } else {
            Err(TransportError::UnexpectedStatus(status.as_u16()))
        }
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else if error.is_connect() {
        TransportError::ConnectionRefused(error.to_string())
    } else {
        TransportError::Io(error.to_string())
    }
}
