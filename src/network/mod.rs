//! Network module - Handles the control channel and datagram transport
//!
//! Provides:
//! - Server with a per-connection supervisor and a datagram router
//! - Session registry shared by both server halves
//! - Client that speaks the sender side of the protocol

mod client;
mod connection;
mod registry;
mod router;
mod server;
mod supervisor;

#[cfg(test)]
mod tests;

pub use client::*;
pub use connection::*;
pub use registry::*;
pub use server::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, RETRANSMIT_TIMEOUT};

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface to bind (server) or host to reach (client)
    pub host: String,
    /// Control channel port
    pub tcp_port: u16,
    /// Datagram port
    pub udp_port: u16,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Age after which an unacknowledged datagram is resent
    pub retransmit_timeout: Duration,
    /// Period of the retransmission sweep
    pub sweep_interval: Duration,
    /// Retransmissions per datagram before giving up (0 = never give up)
    pub max_retransmits: u32,
    /// Outbound queue depth per control connection
    pub outbound_queue: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            connect_timeout_ms: 5000,
            retransmit_timeout: RETRANSMIT_TIMEOUT,
            sweep_interval: Duration::from_secs(1),
            max_retransmits: 5,
            outbound_queue: 256,
        }
    }
}

impl NetworkConfig {
    pub fn new(host: impl Into<String>, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            host: host.into(),
            tcp_port,
            udp_port,
            ..Default::default()
        }
    }

    pub fn with_retransmit(mut self, timeout: Duration, sweep_interval: Duration) -> Self {
        self.retransmit_timeout = timeout;
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_max_retransmits(mut self, max_retransmits: u32) -> Self {
        self.max_retransmits = max_retransmits;
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
