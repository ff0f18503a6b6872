//! Test utilities: an in-memory gateway speaking the control protocol

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use dcc_portmap::nat::upnp::{Action, ControlRequest};
use dcc_portmap::{ControlTransport, GatewayEndpoint, LeaseConfig, LeaseManager, TransportError};

pub type Reply = Result<Bytes, TransportError>;

/// A request as the gateway saw it
#[derive(Debug, Clone)]
pub struct Sent {
    pub at: Instant,
    pub request: ControlRequest,
}

/// Gateway answering from a script, then behaving like a healthy router
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Reply>>,
    sent: Mutex<Vec<Sent>>,
    delay: Duration,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    /// Every exchange takes `delay` before the reply is produced
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            delay,
        })
    }

    /// Queue the reply for the next unscripted exchange
    pub fn push(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.sent.lock().iter().map(|s| s.request.action).collect()
    }

    fn default_reply(request: &ControlRequest) -> Reply {
        match request.action {
            Action::AddAnyPortMapping => {
                let hint = request.argument("NewExternalPort").unwrap_or("0");
                Ok(add_any_ok(hint.parse().unwrap()))
            }
            Action::GetExternalIPAddress => Ok(external_ip_ok(Ipv4Addr::new(203, 0, 113, 1))),
            Action::GetGenericPortMappingEntry => Ok(fault(713, "SpecifiedArrayIndexInvalid")),
            action => Ok(empty_ok(action)),
        }
    }
}

#[async_trait]
impl ControlTransport for ScriptedGateway {
    async fn send(
        &self,
        _endpoint: &GatewayEndpoint,
        request: &ControlRequest,
        _timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        self.sent.lock().push(Sent {
            at: Instant::now(),
            request: request.clone(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| Self::default_reply(request))
    }
}

pub fn endpoint() -> GatewayEndpoint {
    GatewayEndpoint::new("192.168.1.1:5000".parse().unwrap(), "/ctl/IPConn")
}

pub fn manager(gateway: Arc<ScriptedGateway>) -> LeaseManager {
    manager_with(gateway, endpoint(), LeaseConfig::default())
}

pub fn manager_with(gateway: Arc<ScriptedGateway>, endpoint: GatewayEndpoint, config: LeaseConfig) -> LeaseManager {
    LeaseManager::with_transport(endpoint, gateway, Ipv4Addr::new(192, 168, 1, 20), config).unwrap()
}

pub fn envelope(inner: &str) -> Bytes {
    Bytes::from(format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body>{}</s:Body></s:Envelope>"#,
        inner
    ))
}

pub fn empty_ok(action: Action) -> Bytes {
    envelope(&format!(
        r#"<u:{} xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:2"></u:{}>"#,
        action.response_name(),
        action.response_name()
    ))
}

pub fn add_any_ok(port: u16) -> Bytes {
    add_any_raw(&port.to_string())
}

pub fn add_any_raw(text: &str) -> Bytes {
    envelope(&format!(
        r#"<u:AddAnyPortMappingResponse xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:2"><NewReservedPort>{}</NewReservedPort></u:AddAnyPortMappingResponse>"#,
        text
    ))
}

pub fn external_ip_ok(ip: Ipv4Addr) -> Bytes {
    envelope(&format!(
        r#"<u:GetExternalIPAddressResponse xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:2"><NewExternalIPAddress>{}</NewExternalIPAddress></u:GetExternalIPAddressResponse>"#,
        ip
    ))
}

pub fn generic_entry_ok(external_port: u16, internal_port: u16, description: &str) -> Bytes {
    envelope(&format!(
        r#"<u:GetGenericPortMappingEntryResponse xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:2">
<NewRemoteHost></NewRemoteHost><NewExternalPort>{}</NewExternalPort><NewProtocol>TCP</NewProtocol>
<NewInternalPort>{}</NewInternalPort><NewInternalClient>192.168.1.20</NewInternalClient>
<NewEnabled>1</NewEnabled><NewPortMappingDescription>{}</NewPortMappingDescription>
<NewLeaseDuration>0</NewLeaseDuration></u:GetGenericPortMappingEntryResponse>"#,
        external_port, internal_port, description
    ))
}

pub fn fault(code: u16, description: &str) -> Bytes {
    envelope(&format!(
        r#"<s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring><detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>{}</errorCode><errorDescription>{}</errorDescription></UPnPError></detail></s:Fault>"#,
        code, description
    ))
}

pub fn timeout() -> Reply {
    Err(TransportError::Timeout(Duration::from_secs(5)))
}

/// Install a test log writer once per test binary
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("dcc_portmap=debug")
        .with_test_writer()
        .try_init();
}
