//! Protocol module - Defines the wire protocol for ChatRelay communication
//!
//! Both transports share one binary header:
//! - 1 byte message type
//! - 16 bytes sender identity (UTF-8, zero-padded)
//! - 4 bytes sequence number (big-endian)
//! - 4 bytes payload length (big-endian)
//! - Variable length JSON payload

mod message;
mod codec;

pub use message::*;
pub use codec::*;

use std::time::Duration;

/// Default TCP port for the control channel
pub const DEFAULT_TCP_PORT: u16 = 55555;

/// Default UDP port for the datagram endpoint
pub const DEFAULT_UDP_PORT: u16 = 55556;

/// Receive buffer size for a single datagram
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Unacknowledged datagrams older than this are retransmitted
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Identity used for packets the server originates itself
pub const SERVER_IDENTITY: &str = "SERVER";
