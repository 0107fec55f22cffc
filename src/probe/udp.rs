//! UDP info prober using raw datagrams.
//!
//! Sends a single "info" request and expects a newline-delimited reply:
//! name, label, then "population/capacity". Stand-in framing; anything
//! richer belongs in its own [`Prober`] implementation.

use async_trait::async_trait;
use std::net::UdpSocket;
use std::time::Duration;

use super::{ProbeError, Prober, Snapshot};

const INFO_REQUEST: &[u8] = b"INFO\n";

/// Prober that performs the plain-text UDP info exchange.
#[derive(Debug, Default, Clone)]
pub struct UdpProber;

#[async_trait]
impl Prober for UdpProber {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<Snapshot, ProbeError> {
        let address = address.to_string();
        // Socket reads are blocking with a read timeout; run them off the
        // async worker threads.
        tokio::task::spawn_blocking(move || query_info(&address, timeout))
            .await
            .map_err(|e| ProbeError::Unreachable(format!("probe task failed: {}", e)))?
    }
}

fn query_info(address: &str, timeout: Duration) -> Result<Snapshot, ProbeError> {
    if !address.contains(':') {
        return Err(ProbeError::Config(format!("address missing port: {}", address)));
    }

    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| ProbeError::Unreachable(format!("failed to bind socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Unreachable(format!("failed to set timeout: {}", e)))?;

    socket
        .connect(address)
        .map_err(|e| ProbeError::Unreachable(format!("failed to connect: {}", e)))?;

    socket
        .send(INFO_REQUEST)
        .map_err(|e| ProbeError::Unreachable(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 1024];
    let n = socket.recv(&mut response).map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Unreachable(format!("failed to recv: {}", e))
        }
    })?;

    let text = String::from_utf8_lossy(&response[..n]);
    parse_info_reply(&text, address)
}

fn parse_info_reply(text: &str, address: &str) -> Result<Snapshot, ProbeError> {
    let mut lines = text.lines();

    let name = lines.next().unwrap_or(address).trim();
    let label = lines
        .next()
        .ok_or_else(|| ProbeError::Unreachable("reply missing label line".to_string()))?
        .trim();

    let (population, capacity) = match lines.next() {
        Some(counts) => {
            let mut parts = counts.trim().splitn(2, '/');
            let population = parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(0);
            let capacity = parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(0);
            (population, capacity)
        }
        None => (0, 0),
    };

    Ok(Snapshot {
        online: true,
        name: if name.is_empty() { address.to_string() } else { name.to_string() },
        label: label.to_string(),
        population,
        capacity,
    })
}
