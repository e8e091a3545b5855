//! Probe module for host liveness monitoring.
//!
//! ICMP echo is the only probe; the [`Transport`] trait is the seam the
//! monitor loop drives, so the loop never touches sockets directly.

mod icmp;

pub use icmp::*;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("insufficient privilege to open an ICMP socket: {0}")]
    Privilege(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("could not find host {0}")]
    Resolve(String),
}

/// Per-request parameters, taken from the configuration snapshot of the cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeParams {
    pub buffer_size: usize,
    pub ttl: u32,
    pub timeout: Duration,
}

/// Result of a single probe attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub rtt_ms: Option<u32>,
    pub description: String,
}

impl ProbeOutcome {
    pub fn reply(rtt_ms: u32, description: impl Into<String>) -> Self {
        Self {
            success: true,
            rtt_ms: Some(rtt_ms),
            description: description.into(),
        }
    }

    pub fn failure(description: impl Into<String>) -> Self {
        Self {
            success: false,
            rtt_ms: None,
            description: description.into(),
        }
    }

    pub fn timed_out() -> Self {
        Self::failure("Request timed out.")
    }
}

/// A blocking echo transport bound to one target at a time.
pub trait Transport: Send + 'static {
    /// Point subsequent requests at `address`.
    fn set_address(&mut self, address: Ipv4Addr);

    /// Send one echo request.
    fn send(&mut self, params: &ProbeParams) -> Result<(), ProbeError>;

    /// Wait for the reply to the last request, or time out.
    fn receive(&mut self) -> ProbeOutcome;
}

/// Run one request/response cycle. Send errors are reported as failed
/// outcomes so a broken cycle never takes down the worker.
pub fn probe_once(
    transport: &mut dyn Transport,
    address: Ipv4Addr,
    params: &ProbeParams,
) -> ProbeOutcome {
    transport.set_address(address);
    match transport.send(params) {
        Ok(()) => transport.receive(),
        Err(e) => ProbeOutcome::failure(format!("Transmit failed: {}", e)),
    }
}

/// Resolve `address`, giving up after `timeout`. A resolver that does not
/// answer in time counts as an unknown host.
pub async fn resolve_within(address: &str, timeout: Duration) -> Result<Ipv4Addr, ProbeError> {
    bounded(resolve_address(address), address, timeout).await
}

async fn bounded<F>(lookup: F, address: &str, timeout: Duration) -> Result<Ipv4Addr, ProbeError>
where
    F: Future<Output = Result<Ipv4Addr, ProbeError>>,
{
    tokio::time::timeout(timeout, lookup)
        .await
        .unwrap_or_else(|_| Err(ProbeError::Resolve(address.to_string())))
}

/// Resolve a target address to the IPv4 address the transport will use.
pub async fn resolve_address(address: &str) -> Result<Ipv4Addr, ProbeError> {
    // Try direct parse first
    if let Ok(ip) = address.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|_| ProbeError::Resolve(address.to_string()))?
        .find_map(|sa| match sa.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| ProbeError::Resolve(address.to_string()))
}
