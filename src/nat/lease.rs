//! Port mapping lease management.
//!
//! [`LeaseManager`] keeps at most one mapping per (internal port, protocol)
//! pair on its gateway. Concurrent requests for the same pair share one
//! control exchange, granted mappings are renewed before the gateway's lease
//! runs out, and mappings whose renewals keep failing are reported as expired.
//!
//! Callers only ever hold keys. The manager owns every mapping together with
//! its renewal timer, so a release racing a renewal can never act on a stale
//! mapping: each timer carries the generation of the entry it was armed for
//! and does nothing once that entry is gone.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::nat::error::{NatError, NatResult, UpnpErrorCode};
use crate::nat::upnp::response::expect_empty_response;
use crate::nat::upnp::{
    local_ip_for_gateway, AddAnyPortMappingResponse, ControlRequest, ControlTransport,
    ExternalIpResponse, GatewayEndpoint, HttpTransport, PortMappingEntry, PortMappingRequest,
};
use crate::nat::{LeaseConfig, Protocol};

/// Upper bound for a gateway mapping table walk
const MAX_TABLE_ENTRIES: u16 = 1024;

/// Lowest port handed out as a conflict-retry candidate
const CANDIDATE_PORT_FLOOR: u16 = 1024;

/// Opaque identifier of the session that owns a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle identifying a mapping slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey {
    /// Port on the internal client
    pub internal_port: u16,
    /// Mapped protocol
    pub protocol: Protocol,
}

impl MappingKey {
    /// Key for a pair
    pub fn new(internal_port: u16, protocol: Protocol) -> Self {
        Self {
            internal_port,
            protocol,
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.internal_port, self.protocol)
    }
}

/// What a session asks the manager for
#[derive(Debug, Clone)]
pub struct MappingRequest {
    /// Port on the internal client
    pub internal_port: u16,
    /// Mapped protocol
    pub protocol: Protocol,
    /// `None` lets the gateway choose
    pub preferred_external_port: Option<u16>,
    /// Seconds; 0 asks for an indefinite lease
    pub lease_duration: u32,
    /// Session the mapping belongs to
    pub owner: SessionId,
    /// Accept another external port when the preferred one is taken
    pub allow_any_port: bool,
}

impl MappingRequest {
    /// Request with a fresh owner that lets the gateway choose the external port
    pub fn new(internal_port: u16, protocol: Protocol, lease_duration: u32) -> Self {
        Self {
            internal_port,
            protocol,
            preferred_external_port: None,
            lease_duration,
            owner: SessionId::new(),
            allow_any_port: true,
        }
    }

    /// Ask for a specific external port
    pub fn with_external_port(mut self, port: u16) -> Self {
        self.preferred_external_port = Some(port);
        self
    }

    /// Attribute the mapping to an existing session
    pub fn with_owner(mut self, owner: SessionId) -> Self {
        self.owner = owner;
        self
    }

    /// Fail instead of falling back to another external port
    pub fn fixed_port_only(mut self) -> Self {
        self.allow_any_port = false;
        self
    }

    /// Slot the request is for
    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.internal_port, self.protocol)
    }
}

/// A mapping granted by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMapping {
    /// Mapped protocol
    pub protocol: Protocol,
    /// Port on the internal client
    pub internal_port: u16,
    /// Port reachable from the WAN side
    pub external_port: u16,
    /// Seconds granted; 0 is indefinite
    pub lease_duration: u32,
    /// When the gateway last granted or refreshed the lease
    pub granted_at: Instant,
    /// `None` for indefinite leases, which are never renewed
    pub renew_at: Option<Instant>,
    /// Session the mapping belongs to
    pub owner: SessionId,
}

impl ActiveMapping {
    /// Slot the mapping occupies
    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.internal_port, self.protocol)
    }
}

/// Externally visible state of a mapping slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingState {
    /// Nothing held or requested
    Idle,
    /// An add-mapping exchange is in flight
    Requesting,
    /// Granted and, for finite leases, renewed in the background
    Active(ActiveMapping),
    /// Lost after renewals failed; released or requested again by the owner
    Expired(ActiveMapping),
}

/// State transitions reported to subscribers
#[derive(Debug, Clone)]
pub enum MappingEvent {
    /// A direct connection through the mapping is usable
    Active(ActiveMapping),
    /// The gateway refreshed the lease
    Renewed(ActiveMapping),
    /// The mapping was lost mid-session; the owner should fall back
    ///
    /// `error` is a [`NatError::Expired`] wrapping the last renewal failure.
    Expired {
        /// Last known state of the mapping
        mapping: ActiveMapping,
        /// Why it was given up
        error: NatError,
    },
    /// No mapping could be obtained
    Failed {
        /// Slot the request was for
        key: MappingKey,
        /// Session that asked
        owner: SessionId,
        /// Terminal failure of the request
        error: NatError,
    },
    /// The mapping was released and the slot is idle again
    Released {
        /// Slot that was freed
        key: MappingKey,
        /// External port the mapping used
        external_port: u16,
    },
}

/// Counters since the manager was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseStats {
    /// Control exchanges attempted, retries included
    pub requests_sent: u64,
    /// Mappings granted by the gateway
    pub mappings_granted: u64,
    /// Successful lease renewals
    pub renewals: u64,
    /// Failed renewal attempts
    pub renewal_failures: u64,
    /// Mappings given up after renewals failed
    pub expirations: u64,
    /// Mappings released
    pub releases: u64,
    /// Delete requests that failed on release
    pub delete_failures: u64,
}

#[derive(Debug, Default)]
struct LeaseCounters {
    requests_sent: AtomicU64,
    mappings_granted: AtomicU64,
    renewals: AtomicU64,
    renewal_failures: AtomicU64,
    expirations: AtomicU64,
    releases: AtomicU64,
    delete_failures: AtomicU64,
}

impl LeaseCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LeaseStats {
        LeaseStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            mappings_granted: self.mappings_granted.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            renewal_failures: self.renewal_failures.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
        }
    }
}

type Outcome = watch::Sender<Option<NatResult<ActiveMapping>>>;

enum Entry {
    Requesting {
        generation: u64,
        owner: SessionId,
        outcome: Outcome,
        task: JoinHandle<()>,
    },
    Active {
        generation: u64,
        mapping: ActiveMapping,
        renewal: Option<JoinHandle<()>>,
    },
    Expired {
        mapping: ActiveMapping,
    },
}

impl Entry {
    fn owner(&self) -> SessionId {
        match self {
            Entry::Requesting { owner, .. } => *owner,
            Entry::Active { mapping, .. } | Entry::Expired { mapping } => mapping.owner,
        }
    }
}

struct Shared {
    endpoint: GatewayEndpoint,
    transport: Arc<dyn ControlTransport>,
    config: LeaseConfig,
    internal_client: Ipv4Addr,
    entries: Mutex<HashMap<MappingKey, Entry>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<MappingEvent>,
    counters: LeaseCounters,
}

/// Owns the port mappings held on one gateway
#[derive(Clone)]
pub struct LeaseManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("endpoint", &self.shared.endpoint)
            .field("internal_client", &self.shared.internal_client)
            .field("entries", &self.shared.entries.lock().len())
            .finish()
    }
}

impl LeaseManager {
    /// Manager speaking SOAP over HTTP to `endpoint`
    ///
    /// The internal client address comes from the configuration or, when
    /// unset, from the local interface facing the gateway.
    pub fn new(endpoint: GatewayEndpoint, config: LeaseConfig) -> NatResult<Self> {
        let internal_client = match config.internal_client {
            Some(ip) => ip,
            None => local_ip_for_gateway(endpoint.addr.ip())?,
        };
        let transport = Arc::new(HttpTransport::new()?);
        Self::with_transport(endpoint, transport, internal_client, config)
    }

    /// Manager using a caller-supplied transport
    pub fn with_transport(
        endpoint: GatewayEndpoint,
        transport: Arc<dyn ControlTransport>,
        internal_client: Ipv4Addr,
        config: LeaseConfig,
    ) -> NatResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);

        info!(
            "Lease manager for {} announcing internal client {}",
            endpoint, internal_client
        );

        Ok(Self {
            shared: Arc::new(Shared {
                endpoint,
                transport,
                config,
                internal_client,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                events,
                counters: LeaseCounters::default(),
            }),
        })
    }

    /// Gateway this manager talks to
    pub fn endpoint(&self) -> &GatewayEndpoint {
        &self.shared.endpoint
    }

    /// Address announced as `NewInternalClient`
    pub fn internal_client(&self) -> Ipv4Addr {
        self.shared.internal_client
    }

    /// Subscribe to state transitions of every mapping
    pub fn subscribe(&self) -> broadcast::Receiver<MappingEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> LeaseStats {
        self.shared.counters.snapshot()
    }

    /// Obtain a mapping for `request.internal_port`/`request.protocol`
    ///
    /// An already active mapping for the pair is returned as is. While a
    /// request for the pair is in flight, further callers wait for its result
    /// instead of sending their own.
    pub async fn request_mapping(&self, request: MappingRequest) -> NatResult<ActiveMapping> {
        let key = request.key();
        let port_request = self.shared.port_request(&request);
        port_request.validate()?;

        let mut outcome = {
            let mut entries = self.shared.entries.lock();
            match entries.get(&key) {
                Some(Entry::Active { mapping, .. }) => {
                    debug!("Mapping {} already active on port {}", key, mapping.external_port);
                    return Ok(mapping.clone());
                }
                Some(Entry::Requesting { outcome, .. }) => {
                    debug!("Joining in-flight request for {}", key);
                    outcome.subscribe()
                }
                Some(Entry::Expired { .. }) | None => {
                    let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
                    let (outcome, receiver) = watch::channel(None);
                    let owner = request.owner;
                    let shared = self.shared.clone();
                    let task = tokio::spawn(async move {
                        shared.run_request(generation, request, port_request).await;
                    });
                    entries.insert(
                        key,
                        Entry::Requesting {
                            generation,
                            owner,
                            outcome,
                            task,
                        },
                    );
                    receiver
                }
            }
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or(Err(NatError::Cancelled)),
            Err(_) => Err(NatError::Cancelled),
        };
        result
    }

    /// Abort an in-flight request; the slot returns to idle
    ///
    /// Returns whether a request was in flight.
    pub fn cancel(&self, internal_port: u16, protocol: Protocol) -> bool {
        let key = MappingKey::new(internal_port, protocol);
        let mut entries = self.shared.entries.lock();
        match entries.remove(&key) {
            Some(Entry::Requesting { task, outcome, .. }) => {
                drop(entries);
                task.abort();
                let _ = outcome.send(Some(Err(NatError::Cancelled)));
                info!("Cancelled mapping request for {}", key);
                true
            }
            Some(other) => {
                entries.insert(key, other);
                false
            }
            None => false,
        }
    }

    /// Release the mapping for the pair
    ///
    /// Deleting the mapping on the gateway is attempted once; a failure is
    /// logged and otherwise ignored since the gateway's lease eventually
    /// reclaims the entry. Releasing an idle pair does nothing.
    pub async fn release(&self, internal_port: u16, protocol: Protocol) {
        let key = MappingKey::new(internal_port, protocol);
        let removed = self.shared.entries.lock().remove(&key);
        let mapping = match removed {
            None => {
                debug!("Release of idle mapping {} ignored", key);
                return;
            }
            Some(Entry::Requesting { task, outcome, .. }) => {
                task.abort();
                let _ = outcome.send(Some(Err(NatError::Cancelled)));
                info!("Released {} while its request was in flight", key);
                return;
            }
            Some(Entry::Active {
                mapping, renewal, ..
            }) => {
                if let Some(renewal) = renewal {
                    renewal.abort();
                }
                mapping
            }
            Some(Entry::Expired { mapping }) => mapping,
        };

        self.shared.delete_mapping(&mapping).await;
        LeaseCounters::bump(&self.shared.counters.releases);
        self.shared.emit(MappingEvent::Released {
            key,
            external_port: mapping.external_port,
        });
    }

    /// Release everything owned by a session that is going away
    pub async fn release_owner(&self, owner: SessionId) {
        let keys: Vec<MappingKey> = self
            .shared
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.owner() == owner)
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            self.release(key.internal_port, key.protocol).await;
        }
    }

    /// Release every mapping held by this manager
    pub async fn shutdown(&self) {
        let keys: Vec<MappingKey> = self.shared.entries.lock().keys().copied().collect();
        info!("Releasing {} mapping(s) on {}", keys.len(), self.shared.endpoint);
        for key in keys {
            self.release(key.internal_port, key.protocol).await;
        }
    }

    /// Current state of the pair's slot
    pub fn state(&self, internal_port: u16, protocol: Protocol) -> MappingState {
        match self
            .shared
            .entries
            .lock()
            .get(&MappingKey::new(internal_port, protocol))
        {
            None => MappingState::Idle,
            Some(Entry::Requesting { .. }) => MappingState::Requesting,
            Some(Entry::Active { mapping, .. }) => MappingState::Active(mapping.clone()),
            Some(Entry::Expired { mapping }) => MappingState::Expired(mapping.clone()),
        }
    }

    /// Every mapping currently active
    pub fn active_mappings(&self) -> Vec<ActiveMapping> {
        self.shared
            .entries
            .lock()
            .values()
            .filter_map(|entry| match entry {
                Entry::Active { mapping, .. } => Some(mapping.clone()),
                _ => None,
            })
            .collect()
    }

    /// External IPv4 address of the gateway
    pub async fn external_address(&self) -> NatResult<Ipv4Addr> {
        let request = ControlRequest::get_external_ip_address(&self.shared.endpoint.service_type);
        let body = self
            .shared
            .exchange(&request, self.shared.config.request_attempts)
            .await?;
        Ok(ExternalIpResponse::parse(&body)?.external_ip)
    }

    /// Delete a gateway mapping this manager does not track
    ///
    /// Meant for entries left behind by an earlier process. Unlike
    /// [`release`](Self::release), failures are returned to the caller.
    pub async fn remove_stale_mapping(&self, protocol: Protocol, external_port: u16) -> NatResult<()> {
        let tracked = self.shared.entries.lock().values().any(|entry| match entry {
            Entry::Active { mapping, .. } | Entry::Expired { mapping } => {
                mapping.protocol == protocol && mapping.external_port == external_port
            }
            Entry::Requesting { .. } => false,
        });
        if tracked {
            return Err(NatError::InvalidRequest(format!(
                "{} {} is held by this manager, release it instead",
                protocol, external_port
            )));
        }

        self.shared.delete(protocol, external_port).await?;
        info!("Removed stale mapping {} {}", protocol, external_port);
        Ok(())
    }

    /// Every mapping in the gateway's table, including other hosts' entries
    pub async fn list_gateway_mappings(&self) -> NatResult<Vec<PortMappingEntry>> {
        let mut mappings = Vec::new();
        for index in 0..MAX_TABLE_ENTRIES {
            let request = ControlRequest::get_generic_port_mapping_entry(
                &self.shared.endpoint.service_type,
                index,
            );
            let body = self
                .shared
                .exchange(&request, self.shared.config.request_attempts)
                .await?;
            match PortMappingEntry::parse(&body) {
                Ok(entry) => mappings.push(entry),
                Err(e) if e.upnp_error_code().is_some_and(|code| code.ends_table_walk()) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(mappings)
    }
}

impl Shared {
    fn emit(&self, event: MappingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn port_request(&self, request: &MappingRequest) -> PortMappingRequest {
        PortMappingRequest {
            protocol: request.protocol,
            internal_port: request.internal_port,
            internal_client: self.internal_client,
            external_port: request.preferred_external_port,
            lease_duration: request.lease_duration,
            description: self.config.description.clone(),
            enabled: true,
        }
    }

    /// Delay between a grant and its renewal; `None` for indefinite leases
    fn renewal_delay(&self, lease_duration: u32) -> Option<Duration> {
        if lease_duration == 0 {
            return None;
        }
        let lease = Duration::from_secs(u64::from(lease_duration));
        let delay = (lease / 2).min(lease.saturating_sub(self.config.renewal_margin()));
        Some(delay.max(self.config.min_renewal_interval()))
    }

    fn is_current(&self, key: MappingKey, generation: u64) -> bool {
        matches!(
            self.entries.lock().get(&key),
            Some(Entry::Active { generation: g, .. }) if *g == generation
        )
    }

    async fn run_request(
        self: Arc<Self>,
        generation: u64,
        request: MappingRequest,
        port_request: PortMappingRequest,
    ) {
        let key = request.key();
        let result = self.acquire(&request, port_request).await;

        let outcome = {
            let mut entries = self.entries.lock();
            let outcome = match entries.remove(&key) {
                Some(Entry::Requesting {
                    generation: g,
                    outcome,
                    ..
                }) if g == generation => outcome,
                Some(other) => {
                    entries.insert(key, other);
                    debug!("Discarding outcome of superseded request for {}", key);
                    return;
                }
                None => {
                    debug!("Discarding outcome of cancelled request for {}", key);
                    return;
                }
            };

            if let Ok(mapping) = &result {
                let renewal = mapping
                    .renew_at
                    .map(|renew_at| self.spawn_renewal(key, generation, renew_at));
                entries.insert(
                    key,
                    Entry::Active {
                        generation,
                        mapping: mapping.clone(),
                        renewal,
                    },
                );
            }
            outcome
        };

        match &result {
            Ok(mapping) => {
                info!(
                    "Mapped {} {} -> {}:{} (lease {}s)",
                    mapping.protocol,
                    mapping.external_port,
                    self.internal_client,
                    mapping.internal_port,
                    mapping.lease_duration
                );
                LeaseCounters::bump(&self.counters.mappings_granted);
                self.emit(MappingEvent::Active(mapping.clone()));
            }
            Err(e) => {
                warn!("Mapping request for {} failed: {}", key, e);
                self.emit(MappingEvent::Failed {
                    key,
                    owner: request.owner,
                    error: e.clone(),
                });
            }
        }

        let _ = outcome.send(Some(result));
    }

    /// Drive add-mapping exchanges until a mapping is granted or a terminal error
    async fn acquire(
        &self,
        request: &MappingRequest,
        mut port_request: PortMappingRequest,
    ) -> NatResult<ActiveMapping> {
        let any_port_allowed = request.allow_any_port && self.config.allow_any_port_fallback;
        let mut use_add_any = port_request.external_port.is_none() && self.endpoint.supports_add_any();
        let mut conflict_retried = false;
        let mut permanent_retried = false;

        loop {
            let attempt = if use_add_any {
                self.add_any_port_mapping(&port_request).await
            } else {
                self.add_port_mapping(&port_request).await
            };

            match attempt {
                Ok(external_port) => {
                    return Ok(self.grant(request, external_port, port_request.lease_duration));
                }
                Err(NatError::Fault(fault))
                    if fault.is_conflict() && any_port_allowed && !conflict_retried =>
                {
                    conflict_retried = true;
                    if self.endpoint.supports_add_any() && !use_add_any {
                        use_add_any = true;
                    } else {
                        use_add_any = false;
                        port_request.external_port = Some(candidate_port());
                    }
                    info!(
                        "External port for {} taken, retrying with {}",
                        request.key(),
                        if use_add_any {
                            "a gateway-chosen port".to_string()
                        } else {
                            format!("port {}", port_request.external_port.unwrap_or_default())
                        }
                    );
                }
                Err(NatError::Fault(fault))
                    if fault.upnp_error_code() == Some(UpnpErrorCode::OnlyPermanentLeasesSupported)
                        && self.config.permanent_lease_fallback
                        && port_request.lease_duration != 0
                        && !permanent_retried =>
                {
                    permanent_retried = true;
                    port_request.lease_duration = 0;
                    info!("Gateway only grants permanent leases, retrying {} without expiry", request.key());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn grant(&self, request: &MappingRequest, external_port: u16, lease_duration: u32) -> ActiveMapping {
        let granted_at = Instant::now();
        ActiveMapping {
            protocol: request.protocol,
            internal_port: request.internal_port,
            external_port,
            lease_duration,
            granted_at,
            renew_at: self.renewal_delay(lease_duration).map(|delay| granted_at + delay),
            owner: request.owner,
        }
    }

    async fn add_port_mapping(&self, port_request: &PortMappingRequest) -> NatResult<u16> {
        let request = ControlRequest::add_port_mapping(&self.endpoint.service_type, port_request)?;
        let body = self.exchange(&request, self.config.request_attempts).await?;
        expect_empty_response(&body)?;
        Ok(port_request.external_port.unwrap_or(port_request.internal_port))
    }

    async fn add_any_port_mapping(&self, port_request: &PortMappingRequest) -> NatResult<u16> {
        let request = ControlRequest::add_any_port_mapping(&self.endpoint.service_type, port_request)?;
        let body = self.exchange(&request, self.config.request_attempts).await?;
        let response = AddAnyPortMappingResponse::parse(&body)?;
        if response.new_reserved_port == 0 {
            return Err(NatError::malformed("NewReservedPort", "0"));
        }
        Ok(response.new_reserved_port)
    }

    /// Send `request`, retrying transport failures up to `attempts` times
    async fn exchange(&self, request: &ControlRequest, attempts: u32) -> NatResult<Bytes> {
        let mut attempt = 1;
        loop {
            LeaseCounters::bump(&self.counters.requests_sent);
            match self
                .transport
                .send(&self.endpoint, request, self.config.request_timeout())
                .await
            {
                Ok(body) => return Ok(body),
                Err(e) if attempt < attempts => {
                    warn!(
                        "{} attempt {}/{} failed: {}",
                        request.action, attempt, attempts, e
                    );
                    attempt += 1;
                    sleep(self.config.retry_delay()).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `DeletePortMapping`, a single attempt
    async fn delete(&self, protocol: Protocol, external_port: u16) -> NatResult<()> {
        let request =
            ControlRequest::delete_port_mapping(&self.endpoint.service_type, protocol, external_port)?;
        let body = self.exchange(&request, 1).await?;
        expect_empty_response(&body)
    }

    /// Best-effort delete used on release
    async fn delete_mapping(&self, mapping: &ActiveMapping) {
        match self.delete(mapping.protocol, mapping.external_port).await {
            Ok(()) => info!(
                "Released {} {} -> {}",
                mapping.protocol, mapping.external_port, mapping.internal_port
            ),
            Err(e) => {
                LeaseCounters::bump(&self.counters.delete_failures);
                warn!(
                    "Failed to delete mapping {} {}: {}",
                    mapping.protocol, mapping.external_port, e
                );
            }
        }
    }

    fn spawn_renewal(self: &Arc<Self>, key: MappingKey, generation: u64, renew_at: Instant) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut renew_at = renew_at;
            loop {
                sleep_until(renew_at).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match shared.renew(key, generation).await {
                    Some(next) => renew_at = next,
                    None => return,
                }
            }
        })
    }

    /// Reissue the add-mapping request for an active mapping
    ///
    /// Returns when the next renewal is due, or `None` once the mapping is
    /// gone, expired, or no longer needs renewing.
    async fn renew(&self, key: MappingKey, generation: u64) -> Option<Instant> {
        let mapping = match self.entries.lock().get(&key) {
            Some(Entry::Active {
                generation: g,
                mapping,
                ..
            }) if *g == generation => mapping.clone(),
            _ => return None,
        };

        debug!("Renewing {} on external port {}", key, mapping.external_port);
        let port_request = PortMappingRequest {
            protocol: mapping.protocol,
            internal_port: mapping.internal_port,
            internal_client: self.internal_client,
            external_port: Some(mapping.external_port),
            lease_duration: mapping.lease_duration,
            description: self.config.description.clone(),
            enabled: true,
        };

        let mut attempt = 1;
        let result = loop {
            let outcome = match ControlRequest::add_port_mapping(&self.endpoint.service_type, &port_request) {
                Ok(request) => match self.exchange(&request, 1).await {
                    Ok(body) => expect_empty_response(&body),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => break Ok(()),
                Err(e) if e.is_retriable() && attempt < self.config.renewal_attempts => {
                    LeaseCounters::bump(&self.counters.renewal_failures);
                    warn!(
                        "Renewal {}/{} of {} failed: {}",
                        attempt, self.config.renewal_attempts, key, e
                    );
                    attempt += 1;
                    sleep(self.config.retry_delay()).await;
                    if !self.is_current(key, generation) {
                        return None;
                    }
                }
                Err(e) => {
                    LeaseCounters::bump(&self.counters.renewal_failures);
                    break Err(e);
                }
            }
        };

        let mut entries = self.entries.lock();
        let current = match entries.get_mut(&key) {
            Some(Entry::Active {
                generation: g,
                mapping,
                ..
            }) if *g == generation => mapping,
            _ => return None,
        };

        match result {
            Ok(()) => {
                let now = Instant::now();
                current.granted_at = now;
                current.renew_at = self.renewal_delay(current.lease_duration).map(|delay| now + delay);
                let renewed = current.clone();
                drop(entries);

                LeaseCounters::bump(&self.counters.renewals);
                debug!("Renewed {} on external port {}", key, renewed.external_port);
                let next = renewed.renew_at;
                self.emit(MappingEvent::Renewed(renewed));
                next
            }
            Err(e) => {
                let expired = current.clone();
                entries.insert(
                    key,
                    Entry::Expired {
                        mapping: expired.clone(),
                    },
                );
                drop(entries);

                LeaseCounters::bump(&self.counters.expirations);
                let error = NatError::Expired {
                    internal_port: expired.internal_port,
                    external_port: expired.external_port,
                    protocol: expired.protocol,
                    cause: Box::new(e),
                };
                warn!("{}", error);
                self.emit(MappingEvent::Expired {
                    mapping: expired,
                    error,
                });
                None
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for entry in self.entries.get_mut().values() {
            match entry {
                Entry::Requesting { task, .. } => task.abort(),
                Entry::Active {
                    renewal: Some(renewal),
                    ..
                } => renewal.abort(),
                _ => {}
            }
        }
    }
}

fn candidate_port() -> u16 {
    rand::thread_rng().gen_range(CANDIDATE_PORT_FLOOR..=u16::MAX)
}
