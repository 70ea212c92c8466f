//! Gateway ranking.
//!
//! A LAN can expose several UPnP devices (secondary routers, VPN or software
//! gateways). Each candidate is probed and scored:
//!
//! * 1 - status query failed, or status is not `Connected`/`Up`
//! * 2 - connected, but no usable external address (missing or reserved)
//! * 3 - connected with a routable external address

use futures::future::join_all;
use std::net::Ipv4Addr;

use super::soap::GatewayControlClient;
use super::Candidate;

pub const SCORE_UNREACHABLE: u8 = 1;
pub const SCORE_CONNECTED: u8 = 2;
pub const SCORE_ROUTABLE: u8 = 3;

/// True for addresses that are not globally routable
pub fn is_reserved(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();

    ip.is_unspecified()
        || ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_documentation()
        || ip.is_broadcast()
        || ip.is_multicast()
        // shared address space (carrier-grade NAT)
        || (a == 100 && (b & 0xC0) == 64)
        // IETF protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // benchmarking
        || (a == 198 && (b & 0xFE) == 18)
        || a == 0
        || a >= 240
}

/// Probe one candidate
pub async fn score_candidate(control: &GatewayControlClient, candidate: &Candidate) -> u8 {
    match control.get_status_info(candidate).await {
        Ok(status) if status == "Connected" || status == "Up" => {}
        Ok(status) => {
            tracing::debug!("Gateway {} reports status '{}'", candidate.control_url, status);
            return SCORE_UNREACHABLE;
        }
        Err(e) => {
            tracing::debug!("GetStatusInfo failed for {}: {}", candidate.control_url, e);
            return SCORE_UNREACHABLE;
        }
    }

    match control.get_external_ip(candidate).await {
        Ok(ip) if !is_reserved(ip) => SCORE_ROUTABLE,
        Ok(ip) => {
            tracing::debug!("Gateway {} reports reserved external IP {}", candidate.control_url, ip);
            SCORE_CONNECTED
        }
        Err(e) => {
            tracing::debug!("GetExternalIPAddress failed for {}: {}", candidate.control_url, e);
            SCORE_CONNECTED
        }
    }
}

/// Pick the highest scoring candidate; the first seen wins a tie.
///
/// Candidates are probed concurrently. Returns `None` only for an empty slice.
pub async fn select_best(
    control: &GatewayControlClient,
    candidates: &[Candidate],
) -> Option<(Candidate, u8)> {
    let scores = join_all(candidates.iter().map(|c| score_candidate(control, c))).await;

    let mut best: Option<(usize, u8)> = None;
    for (idx, score) in scores.into_iter().enumerate() {
        tracing::debug!("Candidate {} ({}) scored {}", idx, candidates[idx].control_url, score);
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((idx, score));
        }
    }

    best.map(|(idx, score)| (candidates[idx].clone(), score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::error::{NatResult, UpnpError};
    use crate::nat::upnp::soap::{HttpResponse, HttpTransport};
    use crate::nat::upnp::ServiceType;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Per-control-URL gateway behaviour
    #[derive(Clone)]
    struct Behaviour {
        status: Option<&'static str>,
        external_ip: Option<&'static str>,
    }

    struct FakeGateways {
        gateways: HashMap<String, Behaviour>,
    }

    #[async_trait]
    impl HttpTransport for FakeGateways {
        async fn get(&self, url: &str) -> NatResult<String> {
            Err(UpnpError::Transport(format!("no GET for {url}")).into())
        }

        async fn post_soap(&self, url: &str, soap_action: &str, _body: String) -> NatResult<HttpResponse> {
            let gw = self.gateways.get(url)
                .ok_or_else(|| UpnpError::Transport("unreachable".to_string()))?;

            let (action, inner) = if soap_action.ends_with("#GetStatusInfo\"") {
                match gw.status {
                    Some(s) => ("GetStatusInfo", format!("<NewConnectionStatus>{s}</NewConnectionStatus>")),
                    None => return Ok(HttpResponse { status: 500, body: String::new() }),
                }
            } else {
                match gw.external_ip {
                    Some(ip) => ("GetExternalIPAddress", format!("<NewExternalIPAddress>{ip}</NewExternalIPAddress>")),
                    None => return Ok(HttpResponse { status: 500, body: String::new() }),
                }
            };

            Ok(HttpResponse {
                status: 200,
                body: format!(
                    "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\"><s:Body>\
                     <u:{action}Response xmlns:u=\"x\">{inner}</u:{action}Response></s:Body></s:Envelope>"
                ),
            })
        }
    }

    fn setup(gateways: &[(&str, Behaviour)]) -> (GatewayControlClient, Vec<Candidate>) {
        let map = gateways.iter()
            .map(|(url, b)| (url.to_string(), b.clone()))
            .collect();
        let control = GatewayControlClient::new(Arc::new(FakeGateways { gateways: map }));
        let candidates = gateways.iter()
            .map(|(url, _)| Candidate::new(*url, ServiceType::WanIpConnection))
            .collect();
        (control, candidates)
    }

    const ROUTABLE: Behaviour = Behaviour { status: Some("Connected"), external_ip: Some("203.0.114.9") };
    const PRIVATE: Behaviour = Behaviour { status: Some("Up"), external_ip: Some("10.0.0.2") };
    const DOWN: Behaviour = Behaviour { status: Some("Disconnected"), external_ip: Some("8.8.8.8") };

    #[test]
    fn test_reserved_ranges() {
        for ip in ["10.1.2.3", "172.16.0.1", "192.168.1.1", "127.0.0.1", "169.254.3.4",
                   "192.0.2.1", "198.51.100.1", "203.0.113.1", "100.64.0.1", "0.0.0.0",
                   "255.255.255.255", "224.0.0.1"] {
            assert!(is_reserved(ip.parse().unwrap()), "{ip} should be reserved");
        }
        for ip in ["8.8.8.8", "1.1.1.1", "203.0.114.9", "100.128.0.1", "172.32.0.1"] {
            assert!(!is_reserved(ip.parse().unwrap()), "{ip} should be routable");
        }
    }

    #[tokio::test]
    async fn test_score_levels() {
        let (control, candidates) = setup(&[
            ("http://a/ctl", ROUTABLE),
            ("http://b/ctl", PRIVATE),
            ("http://c/ctl", DOWN),
            ("http://d/ctl", Behaviour { status: None, external_ip: None }),
            ("http://e/ctl", Behaviour { status: Some("Connected"), external_ip: None }),
            ("http://f/ctl", Behaviour { status: Some("connected"), external_ip: Some("8.8.8.8") }),
        ]);

        let mut scores = Vec::new();
        for c in &candidates {
            scores.push(score_candidate(&control, c).await);
        }
        assert_eq!(scores, vec![3, 2, 1, 1, 2, 1]);

        let unreachable = Candidate::new("http://nowhere/ctl", ServiceType::WanIpConnection);
        assert_eq!(score_candidate(&control, &unreachable).await, SCORE_UNREACHABLE);
    }

    #[tokio::test]
    async fn test_select_highest_score() {
        let (control, candidates) = setup(&[
            ("http://first/ctl", DOWN),
            ("http://second/ctl", ROUTABLE),
            ("http://third/ctl", PRIVATE),
        ]);

        let (best, score) = select_best(&control, &candidates).await.unwrap();
        assert_eq!(best.control_url, "http://second/ctl");
        assert_eq!(score, SCORE_ROUTABLE);
    }

    #[tokio::test]
    async fn test_tie_goes_to_first_seen() {
        let (control, candidates) = setup(&[
            ("http://low/ctl", DOWN),
            ("http://early/ctl", PRIVATE),
            ("http://late/ctl", PRIVATE),
        ]);

        let (best, score) = select_best(&control, &candidates).await.unwrap();
        assert_eq!(best.control_url, "http://early/ctl");
        assert_eq!(score, SCORE_CONNECTED);
    }

    #[tokio::test]
    async fn test_empty_registry_selects_nothing() {
        let (control, _) = setup(&[]);
        assert!(select_best(&control, &[]).await.is_none());
    }
}
