//! Local address discovery

use local_ip_address::local_ip;
use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

use crate::models::BrokerEndpoint;

/// Local socket address the OS would use to reach `endpoint`
///
/// No packet is sent: connecting a UDP socket only resolves the route.
pub async fn route_to(endpoint: &BrokerEndpoint) -> Option<SocketAddr> {
    let remote = lookup_host((endpoint.host.as_str(), endpoint.port)).await.ok()?.next()?;
    let bind: SocketAddr = if remote.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(remote).await.ok()?;
    socket.local_addr().ok()
}

/// IP the device announces in its CONNECT header
pub async fn reachable_ip(endpoint: &BrokerEndpoint) -> String {
    if let Some(addr) = route_to(endpoint).await {
        if !addr.ip().is_unspecified() {
            return addr.ip().to_string();
        }
    }
    match local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            debug!("no local IP found: {}", e);
            "0.0.0.0".into()
        }
    }
}
