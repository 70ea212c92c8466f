//! SSDP search request and response handling

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Standard SSDP multicast group and port
pub const SSDP_MULTICAST: &str = "239.255.255.250:1900";

/// Search target for every root device; gateways are filtered later by description
pub const SEARCH_TARGET: &str = "upnp:rootdevice";

/// Build the M-SEARCH request advertising an `mx` second response window
pub fn search_request(mx: u8) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST}\r\n\
         ST: {SEARCH_TARGET}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {mx}\r\n\r\n"
    )
}

/// Pull the description URL out of a discovery response.
///
/// Accepts raw SSDP headers (`LOCATION:` in any case) or a bare URL.
pub fn extract_location(response: &str) -> Option<String> {
    let header = response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("location")
            .then(|| value.trim().to_string())
    });

    if let Some(location) = header.filter(|l| !l.is_empty()) {
        return Some(location);
    }

    let trimmed = response.trim();
    if (trimmed.starts_with("http://") || trimmed.starts_with("https://"))
        && !trimmed.contains(char::is_whitespace)
    {
        return Some(trimmed.to_string());
    }

    None
}

/// Outbound side of the UDP transport used to broadcast the search
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Send raw bytes to an endpoint
    async fn raw_send(&self, data: &[u8], target: SocketAddr) -> io::Result<()>;

    /// Toggle the broadcast capability of the outbound socket
    fn set_broadcast(&self, enabled: bool) -> io::Result<()>;
}

/// Discovery transport over a tokio UDP socket
#[derive(Debug, Clone)]
pub struct UdpDiscoveryTransport {
    socket: Arc<UdpSocket>,
}

impl UdpDiscoveryTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::debug!("SSDP socket bound to {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive one discovery response as text
    pub async fn recv_response(&self, buf: &mut [u8]) -> io::Result<(String, SocketAddr)> {
        let (size, from) = self.socket.recv_from(buf).await?;
        Ok((String::from_utf8_lossy(&buf[..size]).into_owned(), from))
    }
}

#[async_trait]
impl DiscoveryTransport for UdpDiscoveryTransport {
    async fn raw_send(&self, data: &[u8], target: SocketAddr) -> io::Result<()> {
        self.socket.send_to(data, target).await?;
        Ok(())
    }

    fn set_broadcast(&self, enabled: bool) -> io::Result<()> {
        self.socket.set_broadcast(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_request_shape() {
        let request = search_request(3);
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("HOST: 239.255.255.250:1900\r\n"));
        assert!(request.contains("ST: upnp:rootdevice\r\n"));
        assert!(request.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(request.contains("MX: 3\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_extract_location_keeps_port() {
        let response = "HTTP/1.1 200 OK\r\n\
                        CACHE-CONTROL: max-age=120\r\n\
                        ST: upnp:rootdevice\r\n\
                        Location: http://192.168.1.1:5431/dyndev/uuid:0000\r\n\
                        SERVER: Linux UPnP/1.0\r\n\r\n";

        assert_eq!(
            extract_location(response).as_deref(),
            Some("http://192.168.1.1:5431/dyndev/uuid:0000")
        );
    }

    #[test]
    fn test_extract_location_bare_url() {
        assert_eq!(
            extract_location("  http://10.0.0.1:49152/rootDesc.xml\n").as_deref(),
            Some("http://10.0.0.1:49152/rootDesc.xml")
        );
    }

    #[test]
    fn test_extract_location_missing() {
        assert_eq!(extract_location("HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\n\r\n"), None);
        assert_eq!(extract_location("LOCATION: \r\n"), None);
        assert_eq!(extract_location(""), None);
    }

    #[tokio::test]
    async fn test_udp_transport_roundtrip() {
        let a = UdpDiscoveryTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpDiscoveryTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        a.set_broadcast(true).unwrap();
        a.raw_send(b"LOCATION: http://127.0.0.1/desc.xml\r\n", b.local_addr().unwrap())
            .await
            .unwrap();
        a.set_broadcast(false).unwrap();

        let mut buf = vec![0u8; 1500];
        let (text, from) = b.recv_response(&mut buf).await.unwrap();
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(extract_location(&text).as_deref(), Some("http://127.0.0.1/desc.xml"));
    }
}
