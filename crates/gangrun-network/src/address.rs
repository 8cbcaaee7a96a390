//! Driver address discovery

use std::net::{IpAddr, Ipv4Addr};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Any routable address works; connecting a UDP socket sends no packets.
const PROBE_TARGET: &str = "10.255.255.255:1";

/// Address other hosts can use to reach this process
///
/// Falls back to `127.0.0.1` when no outward route exists.
pub async fn driver_address() -> IpAddr {
    match outward_address().await {
        Ok(ip) => {
            debug!(address = %ip, "Resolved driver address");
            ip
        }
        Err(e) => {
            warn!(error = %e, "Could not resolve driver address, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

async fn outward_address() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(PROBE_TARGET).await?;
    Ok(socket.local_addr()?.ip())
}
