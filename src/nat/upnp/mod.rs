//! UPnP Internet Gateway Device discovery and control
//!
//! [`IgdGateway`] owns the discovery state machine:
//!
//! ```text
//! start_discovery ──► Discovering ──(deadline, ≥1 candidate)──► Available
//!                          │
//!                          └──(deadline, no candidates)──────► NotAvailable
//! ```
//!
//! The owning transport feeds SSDP replies into [`IgdGateway::on_discovery_response`]
//! and calls [`IgdGateway::check_timeout`] on every heartbeat tick. Both run on
//! one network task. Port-forwarding calls may come from any other task and
//! wait at most [`IgdConfig::availability_wait`] for discovery to finish.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};

pub mod clock;
pub mod description;
pub mod registry;
pub mod scorer;
pub mod soap;
pub mod ssdp;

use self::clock::{Clock, SystemClock};
use self::registry::CandidateRegistry;
use self::soap::{GatewayControlClient, HttpTransport, ReqwestTransport};
use self::ssdp::{DiscoveryTransport, UdpDiscoveryTransport};
use super::error::{NatError, NatResult, UpnpError};
use super::{local_ipv4_address, IgdConfig};

/// WAN connection services a gateway can be controlled through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    WanIpConnection,
    WanPppConnection,
}

impl ServiceType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WanIpConnection => "WANIPConnection",
            Self::WanPppConnection => "WANPPPConnection",
        }
    }

    /// `urn:schemas-upnp-org:service:{name}:{version}`
    pub fn urn(&self, version: u8) -> String {
        format!("urn:schemas-upnp-org:service:{}:{}", self.name(), version)
    }

    /// Version named by a `serviceType` value, or `None` for another service.
    /// A bare name or a URN without a version counts as version 1.
    pub fn version_in(&self, service_type: &str) -> Option<u8> {
        let service_type = service_type.trim();
        if service_type == self.name() {
            return Some(1);
        }

        let mut parts = service_type.split(':');
        parts.position(|part| part == self.name())?;
        Some(parts.next().and_then(|v| v.parse().ok()).unwrap_or(1))
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A gateway control endpoint found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub control_url: String,
    pub service_type: ServiceType,
    /// Version from the advertised service URN
    pub service_version: u8,
}

impl Candidate {
    /// Candidate for version 1 of `service_type`
    pub fn new(control_url: impl Into<String>, service_type: ServiceType) -> Self {
        Self {
            control_url: control_url.into(),
            service_type,
            service_version: 1,
        }
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.service_version = version;
        self
    }

    /// Namespace used in the envelope and the SOAPACTION header
    pub fn service_urn(&self) -> String {
        self.service_type.urn(self.service_version)
    }
}

/// The gateway chosen when discovery completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedGateway {
    pub control_url: String,
    pub service_type: ServiceType,
    pub service_version: u8,
    pub score: u8,
}

impl SelectedGateway {
    fn endpoint(&self) -> Candidate {
        Candidate::new(self.control_url.clone(), self.service_type)
            .with_version(self.service_version)
    }
}

impl fmt::Display for SelectedGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {} (score {})", self.control_url, self.service_type, self.score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortProtocol {
    Udp,
    Tcp,
}

impl PortProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        }
    }
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of one AddPortMapping call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingRequest {
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: PortProtocol,
    pub description: String,
    pub internal_client: Ipv4Addr,
}

impl PortMappingRequest {
    /// An `internal_port` of zero maps to the same port as `external_port`
    pub fn new(
        external_port: u16,
        internal_port: u16,
        protocol: PortProtocol,
        description: impl Into<String>,
        internal_client: Ipv4Addr,
    ) -> Self {
        Self {
            external_port,
            internal_port: if internal_port == 0 { external_port } else { internal_port },
            protocol,
            description: description.into(),
            internal_client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Discovering,
    NotAvailable,
    Available,
}

impl GatewayStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Discovering,
            2 => Self::Available,
            _ => Self::NotAvailable,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Discovering => 0,
            Self::NotAvailable => 1,
            Self::Available => 2,
        }
    }
}

/// Source of the internal client address put into new mappings
type LocalAddressSource = Arc<dyn Fn() -> NatResult<Ipv4Addr> + Send + Sync>;

/// Discovery coordinator and port-forwarding front end for one IGD
pub struct IgdGateway {
    config: IgdConfig,
    transport: Arc<dyn DiscoveryTransport>,
    control: GatewayControlClient,
    clock: Arc<dyn Clock>,
    local_address: LocalAddressSource,

    status: AtomicU8,
    /// Bumped by every start_discovery; a scoring pass only settles its own window
    generation: AtomicU64,
    /// Set while check_timeout is scoring candidates
    resolving: AtomicBool,
    deadline: RwLock<Option<Instant>>,
    registry: Mutex<CandidateRegistry>,
    selected: RwLock<Option<SelectedGateway>>,
    available_tx: watch::Sender<bool>,
    active_mappings: Mutex<Vec<PortMappingRequest>>,
}

impl IgdGateway {
    /// Coordinator with explicit collaborators. Status starts as
    /// `NotAvailable` until [`start_discovery`](Self::start_discovery) runs.
    pub fn new(
        config: IgdConfig,
        transport: Arc<dyn DiscoveryTransport>,
        http: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (available_tx, _) = watch::channel(false);
        Self {
            config,
            transport,
            control: GatewayControlClient::new(http),
            clock,
            local_address: Arc::new(local_ipv4_address),
            status: AtomicU8::new(GatewayStatus::NotAvailable.as_u8()),
            generation: AtomicU64::new(0),
            resolving: AtomicBool::new(false),
            deadline: RwLock::new(None),
            registry: Mutex::new(CandidateRegistry::new()),
            selected: RwLock::new(None),
            available_tx,
            active_mappings: Mutex::new(Vec::new()),
        }
    }

    /// Coordinator over a UDP socket, reqwest and the system clock
    pub fn with_udp(config: IgdConfig, transport: Arc<UdpDiscoveryTransport>) -> NatResult<Self> {
        let http = Arc::new(ReqwestTransport::new(config.http_timeout())?);
        Ok(Self::new(config, transport, http, Arc::new(SystemClock)))
    }

    /// Use a fixed internal client address instead of scanning interfaces
    pub fn with_local_address(self, address: Ipv4Addr) -> Self {
        self.with_local_address_source(move || Ok(address))
    }

    /// Resolve the internal client address with `source` on every forward
    pub fn with_local_address_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> NatResult<Ipv4Addr> + Send + Sync + 'static,
    {
        self.local_address = Arc::new(source);
        self
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn selected_gateway(&self) -> Option<SelectedGateway> {
        self.selected.read().clone()
    }

    pub fn candidate_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Receiver that flips to `true` once a gateway is selected
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.available_tx.subscribe()
    }

    fn set_status(&self, status: GatewayStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Broadcast the SSDP search and open a new discovery window
    pub async fn start_discovery(&self) -> NatResult<()> {
        {
            let mut selected = self.selected.write();
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.registry.lock().clear();
            *selected = None;
            self.available_tx.send_replace(false);
            *self.deadline.write() = Some(self.clock.now() + self.config.discovery_window());
            self.set_status(GatewayStatus::Discovering);
        }

        let request = ssdp::search_request(self.config.advertised_mx);
        tracing::debug!("Sending SSDP search to {}", self.config.multicast_addr);

        self.transport.set_broadcast(true)?;
        let sent = self.transport.raw_send(request.as_bytes(), self.config.multicast_addr).await;
        if let Err(e) = self.transport.set_broadcast(false) {
            tracing::warn!("Failed to disable broadcast after SSDP search: {}", e);
        }
        sent?;

        tracing::info!(
            "UPnP discovery started, window {:?}",
            self.config.discovery_window()
        );
        Ok(())
    }

    /// Feed one discovery response. Anything unusable is dropped.
    pub async fn on_discovery_response(&self, response: &str) {
        let Some(location) = ssdp::extract_location(response) else {
            tracing::debug!("Discovery response without LOCATION dropped");
            return;
        };

        match description::fetch_candidate(self.control.http().as_ref(), &location).await {
            Ok(candidate) => {
                tracing::debug!(
                    "UPnP candidate {} ({}) from {}",
                    candidate.control_url, candidate.service_type, location
                );
                self.registry.lock().push(candidate);
            }
            Err(e) => {
                tracing::trace!("Ignoring discovery response from {}: {}", location, e);
            }
        }
    }

    /// Resolve the discovery window once its deadline has passed
    pub async fn check_timeout(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        if self.status() != GatewayStatus::Discovering || !self.deadline_passed() {
            return;
        }
        if self.resolving.swap(true, Ordering::AcqRel) {
            return;
        }

        let candidates = self.registry.lock().snapshot();
        let outcome = if candidates.is_empty() {
            None
        } else {
            tracing::debug!("Scoring {} UPnP candidate(s)", candidates.len());
            match scorer::select_best(&self.control, &candidates).await {
                Some((best, score)) => Some(SelectedGateway {
                    control_url: best.control_url,
                    service_type: best.service_type,
                    service_version: best.service_version,
                    score,
                }),
                None => {
                    tracing::error!("Candidate scoring returned no gateway for {} candidates", candidates.len());
                    None
                }
            }
        };

        if !self.settle(generation, outcome) {
            tracing::debug!("Discarding scoring result for a superseded discovery window");
        }
        self.resolving.store(false, Ordering::Release);
    }

    /// Move window `generation` out of `Discovering`. Fails if the window was
    /// restarted or already left `Discovering` some other way.
    fn settle(&self, generation: u64, outcome: Option<SelectedGateway>) -> bool {
        let mut selected = self.selected.write();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }

        let target = match outcome {
            Some(_) => GatewayStatus::Available,
            None => GatewayStatus::NotAvailable,
        };
        let moved = self.status.compare_exchange(
            GatewayStatus::Discovering.as_u8(),
            target.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if moved.is_err() {
            return false;
        }

        match outcome {
            Some(gateway) => {
                tracing::info!("UPnP gateway selected: {}", gateway);
                *selected = Some(gateway);
                self.available_tx.send_replace(true);
            }
            None => tracing::info!("UPnP discovery finished: no gateway found"),
        }
        true
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.read().map_or(false, |deadline| self.clock.now() >= deadline)
    }

    /// Wait (bounded) for a selected gateway
    pub async fn ensure_available(&self) -> Result<SelectedGateway, UpnpError> {
        match self.status() {
            GatewayStatus::NotAvailable => return Err(UpnpError::NoGatewayFound),
            GatewayStatus::Available => {
                return self.selected_gateway().ok_or(UpnpError::Unavailable);
            }
            GatewayStatus::Discovering => {}
        }

        let mut rx = self.available_tx.subscribe();
        let signalled = matches!(
            timeout(self.config.availability_wait(), rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        if signalled {
            return self.selected_gateway().ok_or(UpnpError::Unavailable);
        }

        if !self.resolving.load(Ordering::Acquire) {
            // Held so a concurrent start_discovery cannot slip in between
            let _selected = self.selected.write();
            if self.deadline_passed() {
                let forced = self.status.compare_exchange(
                    GatewayStatus::Discovering.as_u8(),
                    GatewayStatus::NotAvailable.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                if forced.is_ok() {
                    tracing::warn!("UPnP discovery deadline passed without a gateway");
                }
            }
        }

        // Selection may have landed between the timeout and the status check
        if self.status() == GatewayStatus::Available {
            return self.selected_gateway().ok_or(UpnpError::Unavailable);
        }
        Err(UpnpError::Unavailable)
    }

    fn internal_client(&self) -> NatResult<Ipv4Addr> {
        (self.local_address)()
    }

    /// Forward `external_port` over UDP to the same local port
    pub async fn forward_port(&self, external_port: u16, description: &str) -> bool {
        self.forward_port_with(external_port, description, 0, PortProtocol::Udp).await
    }

    /// Forward `external_port` to `internal_port` (zero means same port) on this host
    pub async fn forward_port_with(
        &self,
        external_port: u16,
        description: &str,
        internal_port: u16,
        protocol: PortProtocol,
    ) -> bool {
        let gateway = match self.ensure_available().await {
            Ok(gateway) => gateway,
            Err(e) => {
                tracing::debug!("Cannot forward port {}: {}", external_port, e);
                return false;
            }
        };

        let internal_client = match self.internal_client() {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!("Cannot forward port {}: {}", external_port, e);
                return false;
            }
        };

        let request = PortMappingRequest::new(
            external_port,
            internal_port,
            protocol,
            description,
            internal_client,
        );

        match self.control
            .add_port_mapping(&gateway.endpoint(), &request, self.config.lease_duration)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    "Port mapping created: {} {} -> {}:{}",
                    request.protocol, request.external_port, request.internal_client, request.internal_port
                );
                let mut mappings = self.active_mappings.lock();
                mappings.retain(|m| !(m.external_port == external_port && m.protocol == protocol));
                mappings.push(request);
                true
            }
            Err(e) => {
                tracing::warn!("AddPortMapping {} {} failed: {}", protocol, external_port, e);
                false
            }
        }
    }

    /// Remove the UDP forwarding rule for `external_port`
    pub async fn delete_forwarding_rule(&self, external_port: u16) -> bool {
        self.delete_forwarding_rule_with(external_port, PortProtocol::Udp).await
    }

    pub async fn delete_forwarding_rule_with(&self, external_port: u16, protocol: PortProtocol) -> bool {
        let gateway = match self.ensure_available().await {
            Ok(gateway) => gateway,
            Err(e) => {
                tracing::debug!("Cannot delete port mapping {}: {}", external_port, e);
                return false;
            }
        };

        match self.control
            .delete_port_mapping(&gateway.endpoint(), external_port, protocol)
            .await
        {
            Ok(()) => {
                tracing::info!("Port mapping removed: {} {}", protocol, external_port);
                self.active_mappings.lock()
                    .retain(|m| !(m.external_port == external_port && m.protocol == protocol));
                true
            }
            Err(e) => {
                tracing::warn!("DeletePortMapping {} {} failed: {}", protocol, external_port, e);
                false
            }
        }
    }

    /// External address reported by the selected gateway
    pub async fn get_external_ip(&self) -> Option<Ipv4Addr> {
        let gateway = self.ensure_available().await.ok()?;

        match self.control.get_external_ip(&gateway.endpoint()).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::warn!("GetExternalIPAddress failed: {}", e);
                None
            }
        }
    }

    /// Mappings created through this coordinator and not yet deleted
    pub fn active_mappings(&self) -> Vec<PortMappingRequest> {
        self.active_mappings.lock().clone()
    }

    /// Delete every active mapping; returns how many were removed
    pub async fn cleanup_all(&self) -> usize {
        let mappings = self.active_mappings();
        let mut removed = 0;
        for mapping in mappings {
            if self.delete_forwarding_rule_with(mapping.external_port, mapping.protocol).await {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("{} UPnP port mapping(s) cleaned up", removed);
        }
        removed
    }

    /// Run a whole discovery round over `socket` until the status settles.
    ///
    /// For callers that have no heartbeat of their own.
    pub async fn run_discovery(&self, socket: &UdpDiscoveryTransport) -> NatResult<GatewayStatus> {
        self.start_discovery().await?;

        let mut tick = interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 2048];

        while self.status() == GatewayStatus::Discovering {
            tokio::select! {
                received = socket.recv_response(&mut buf) => match received {
                    Ok((text, from)) => {
                        tracing::trace!("SSDP response from {}", from);
                        self.on_discovery_response(&text).await;
                    }
                    Err(e) => tracing::debug!("SSDP receive error: {}", e),
                },
                _ = tick.tick() => self.check_timeout().await,
            }
        }

        Ok(self.status())
    }
}

impl fmt::Debug for IgdGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IgdGateway")
            .field("status", &self.status())
            .field("selected", &self.selected_gateway())
            .field("candidates", &self.candidate_count())
            .finish()
    }
}

/// Convenience: UDP transport bound to `bind`, wrapped for sharing
pub async fn bind_discovery_socket(bind: SocketAddr) -> NatResult<Arc<UdpDiscoveryTransport>> {
    UdpDiscoveryTransport::bind(bind)
        .await
        .map(Arc::new)
        .map_err(NatError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::upnp::clock::ManualClock;
    use crate::nat::upnp::soap::HttpResponse;
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
        broadcast_log: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl DiscoveryTransport for RecordingTransport {
        async fn raw_send(&self, data: &[u8], target: SocketAddr) -> io::Result<()> {
            self.sent.lock().push((data.to_vec(), target));
            Ok(())
        }

        fn set_broadcast(&self, enabled: bool) -> io::Result<()> {
            self.broadcast_log.lock().push(enabled);
            Ok(())
        }
    }

    /// Counts every HTTP call; all of them fail
    #[derive(Default)]
    struct DeadHttp {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl HttpTransport for DeadHttp {
        async fn get(&self, _url: &str) -> NatResult<String> {
            *self.calls.lock() += 1;
            Err(UpnpError::Transport("offline".to_string()).into())
        }

        async fn post_soap(&self, _url: &str, _action: &str, _body: String) -> NatResult<HttpResponse> {
            *self.calls.lock() += 1;
            Err(UpnpError::Transport("offline".to_string()).into())
        }
    }

    const IGD_DESCRIPTION: &str = "<?xml version=\"1.0\"?><root><device>\
        <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>\
        <serviceList><service><serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>\
        <controlURL>/ctl/IPConn</controlURL></service></serviceList></device></root>";

    /// Serves one IGD description; control calls answer late and fail
    struct SlowGatewayHttp {
        delay: Duration,
    }

    #[async_trait]
    impl HttpTransport for SlowGatewayHttp {
        async fn get(&self, _url: &str) -> NatResult<String> {
            Ok(IGD_DESCRIPTION.to_string())
        }

        async fn post_soap(&self, _url: &str, _action: &str, _body: String) -> NatResult<HttpResponse> {
            tokio::time::sleep(self.delay).await;
            Err(UpnpError::Transport("timed out".to_string()).into())
        }
    }

    /// Coordinator with one candidate whose scoring takes 300 ms, deadline already passed
    async fn slow_scoring_gateway() -> (IgdGateway, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let http = Arc::new(SlowGatewayHttp { delay: Duration::from_millis(300) });
        let gw = IgdGateway::new(
            IgdConfig::default(),
            Arc::new(RecordingTransport::default()),
            http,
            clock.clone(),
        );

        gw.start_discovery().await.unwrap();
        gw.on_discovery_response("LOCATION: http://192.168.1.1:5000/desc.xml\r\n").await;
        assert_eq!(gw.candidate_count(), 1);
        clock.advance(Duration::from_secs(6));
        (gw, clock)
    }

    fn gateway() -> (IgdGateway, Arc<RecordingTransport>, Arc<DeadHttp>, Arc<ManualClock>) {
        let transport = Arc::new(RecordingTransport::default());
        let http = Arc::new(DeadHttp::default());
        let clock = Arc::new(ManualClock::new());
        let gw = IgdGateway::new(IgdConfig::default(), transport.clone(), http.clone(), clock.clone())
            .with_local_address(Ipv4Addr::new(192, 168, 1, 20));
        (gw, transport, http, clock)
    }

    #[test]
    fn test_service_type_matching() {
        let ip = ServiceType::WanIpConnection;
        assert_eq!(ip.version_in("urn:schemas-upnp-org:service:WANIPConnection:1"), Some(1));
        assert_eq!(ip.version_in("WANIPConnection"), Some(1));
        assert_eq!(ip.version_in("urn:schemas-upnp-org:service:WANIPv6FirewallControl:1"), None);
        assert_eq!(ip.version_in("urn:schemas-upnp-org:service:WANPPPConnection:1"), None);
        assert_eq!(
            ServiceType::WanPppConnection.version_in("urn:schemas-upnp-org:service:WANPPPConnection:2"),
            Some(2)
        );
    }

    #[test]
    fn test_candidate_urn_keeps_version() {
        let candidate = Candidate::new("http://192.168.1.1/ctl", ServiceType::WanIpConnection);
        assert_eq!(candidate.service_urn(), "urn:schemas-upnp-org:service:WANIPConnection:1");

        let candidate = candidate.with_version(2);
        assert_eq!(candidate.service_urn(), "urn:schemas-upnp-org:service:WANIPConnection:2");
    }

    #[test]
    fn test_internal_port_defaults_to_external() {
        let request = PortMappingRequest::new(7000, 0, PortProtocol::Udp, "x", Ipv4Addr::LOCALHOST);
        assert_eq!(request.internal_port, 7000);

        let request = PortMappingRequest::new(7000, 7100, PortProtocol::Tcp, "x", Ipv4Addr::LOCALHOST);
        assert_eq!(request.internal_port, 7100);
    }

    #[tokio::test]
    async fn test_start_discovery_sends_search_with_broadcast_toggle() {
        let (gw, transport, _, _) = gateway();
        assert_eq!(gw.status(), GatewayStatus::NotAvailable);

        gw.start_discovery().await.unwrap();
        assert_eq!(gw.status(), GatewayStatus::Discovering);

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "239.255.255.250:1900".parse::<SocketAddr>().unwrap());
        let text = String::from_utf8(sent[0].0.clone()).unwrap();
        assert!(text.contains("ST: upnp:rootdevice"));
        assert!(text.contains("MX: 3"));
        assert_eq!(*transport.broadcast_log.lock(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_discovering_until_deadline() {
        let (gw, _, _, clock) = gateway();
        gw.start_discovery().await.unwrap();

        clock.advance(Duration::from_secs(5));
        gw.check_timeout().await;
        assert_eq!(gw.status(), GatewayStatus::Discovering);

        clock.advance(Duration::from_secs(1));
        gw.check_timeout().await;
        assert_eq!(gw.status(), GatewayStatus::NotAvailable);

        // Terminal until the next start_discovery
        clock.advance(Duration::from_secs(60));
        gw.check_timeout().await;
        assert_eq!(gw.status(), GatewayStatus::NotAvailable);
    }

    #[tokio::test]
    async fn test_malformed_responses_dropped() {
        let (gw, _, http, _) = gateway();
        gw.start_discovery().await.unwrap();

        gw.on_discovery_response("HTTP/1.1 200 OK\r\n\r\n").await;
        assert_eq!(*http.calls.lock(), 0);

        gw.on_discovery_response("HTTP/1.1 200 OK\r\nLOCATION: http://192.168.1.1/desc.xml\r\n\r\n").await;
        assert_eq!(*http.calls.lock(), 1);
        assert_eq!(gw.candidate_count(), 0);
        assert_eq!(gw.status(), GatewayStatus::Discovering);
    }

    #[tokio::test]
    async fn test_forward_port_fails_fast_when_unavailable() {
        let (gw, _, http, clock) = gateway();
        gw.start_discovery().await.unwrap();
        clock.advance(Duration::from_secs(6));
        gw.check_timeout().await;
        assert_eq!(gw.status(), GatewayStatus::NotAvailable);

        assert!(!gw.forward_port(4000, "test").await);
        assert!(!gw.delete_forwarding_rule(4000).await);
        assert_eq!(gw.get_external_ip().await, None);
        assert_eq!(*http.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_ensure_available_forces_not_available_after_deadline() {
        let (gw, _, _, clock) = gateway();
        gw.start_discovery().await.unwrap();
        clock.advance(Duration::from_secs(7));

        // No heartbeat ran; the caller notices the expired window itself
        assert!(matches!(gw.ensure_available().await, Err(UpnpError::Unavailable)));
        assert_eq!(gw.status(), GatewayStatus::NotAvailable);
    }

    #[tokio::test]
    async fn test_ensure_available_times_out_while_discovering() {
        let (gw, _, _, _) = gateway();
        gw.start_discovery().await.unwrap();

        let started = Instant::now();
        assert!(gw.ensure_available().await.is_err());
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(gw.status(), GatewayStatus::Discovering);
    }

    #[tokio::test]
    async fn test_restart_discards_stale_scoring() {
        let (gw, clock) = slow_scoring_gateway().await;

        tokio::join!(gw.check_timeout(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gw.start_discovery().await.unwrap();
        });

        // The old pass finished after the restart and must not settle the new window
        assert_eq!(gw.status(), GatewayStatus::Discovering);
        assert_eq!(gw.selected_gateway(), None);
        assert_eq!(gw.candidate_count(), 0);
        assert!(!*gw.subscribe().borrow());

        // The new window still resolves on its own deadline
        clock.advance(Duration::from_secs(5));
        gw.check_timeout().await;
        assert_eq!(gw.status(), GatewayStatus::Discovering);
        clock.advance(Duration::from_secs(1));
        gw.check_timeout().await;
        assert_eq!(gw.status(), GatewayStatus::NotAvailable);
    }

    #[tokio::test]
    async fn test_settled_window_not_overwritten_by_scoring() {
        let (gw, _) = slow_scoring_gateway().await;

        tokio::join!(gw.check_timeout(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gw.set_status(GatewayStatus::NotAvailable);
        });

        assert_eq!(gw.status(), GatewayStatus::NotAvailable);
        assert_eq!(gw.selected_gateway(), None);
        assert!(matches!(gw.ensure_available().await, Err(UpnpError::NoGatewayFound)));
    }

    #[tokio::test]
    async fn test_slow_scoring_still_selects() {
        let (gw, _) = slow_scoring_gateway().await;

        gw.check_timeout().await;
        assert_eq!(gw.status(), GatewayStatus::Available);
        let selected = gw.selected_gateway().unwrap();
        assert_eq!(selected.control_url, "http://192.168.1.1/ctl/IPConn");
        assert_eq!(selected.score, 1);
    }
}
