use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

pub mod error;
pub mod upnp;

pub use self::error::{NatError, NatResult, UpnpError, UpnpErrorCode};
pub use self::upnp::{
    Candidate, GatewayStatus, IgdGateway, PortMappingRequest, PortProtocol, SelectedGateway,
    ServiceType,
};

/// Gateway discovery and control configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgdConfig {
    /// Time from the SSDP search until candidates are scored
    pub discovery_window_ms: u64,
    /// MX value advertised to responders, in seconds
    pub advertised_mx: u8,
    /// Longest a port-forwarding call waits for discovery to finish
    pub availability_wait_ms: u64,
    /// Per-request HTTP timeout for description fetches and SOAP calls
    pub http_timeout_ms: u64,
    /// Heartbeat period used by `IgdGateway::run_discovery`
    pub tick_interval_ms: u64,
    pub multicast_addr: SocketAddr,
    /// NewLeaseDuration sent with AddPortMapping, 0 = permanent
    pub lease_duration: u32,
}

impl Default for IgdConfig {
    fn default() -> Self {
        Self {
            // Comfortably above the 3 s MX window, slow gateways still make it
            discovery_window_ms: 6_000,
            advertised_mx: 3,
            availability_wait_ms: 1_000,
            http_timeout_ms: 5_000,
            tick_interval_ms: 250,
            multicast_addr: SocketAddr::from(([239, 255, 255, 250], 1900)),
            lease_duration: 0,
        }
    }
}

impl IgdConfig {
    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn availability_wait(&self) -> Duration {
        Duration::from_millis(self.availability_wait_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> NatResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| NatError::Configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> NatResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| NatError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NatResult<()> {
        if self.discovery_window_ms == 0 {
            return Err(NatError::Configuration("discovery_window_ms must be positive".to_string()));
        }
        if self.advertised_mx == 0 {
            return Err(NatError::Configuration("advertised_mx must be at least 1".to_string()));
        }
        if !self.multicast_addr.is_ipv4() {
            return Err(NatError::Configuration("multicast_addr must be IPv4".to_string()));
        }
        Ok(())
    }
}

/// First usable local IPv4 address.
///
/// Loopback and link-local (169.254/16) addresses are never returned.
pub fn local_ipv4_address() -> NatResult<Ipv4Addr> {
    let interfaces = if_addrs::get_if_addrs()?;
    pick_local_ipv4(interfaces.iter().map(|iface| iface.ip()))
}

fn pick_local_ipv4(addresses: impl IntoIterator<Item = IpAddr>) -> NatResult<Ipv4Addr> {
    addresses.into_iter()
        .find_map(|ip| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified() => Some(v4),
            _ => None,
        })
        .ok_or(NatError::NoLocalAddress)
}
