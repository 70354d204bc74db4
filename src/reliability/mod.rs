//! Reliability module - At-least-once delivery over the datagram transport
//!
//! Provides:
//! - Sequence numbering and the table of unacknowledged sends
//! - A sender that records, transmits and periodically retransmits datagrams
//! - Round-trip probes over the control channel

mod pending;
mod probe;
mod sender;

pub use pending::*;
pub use probe::*;
pub use sender::*;

use std::time::Duration;

use crate::protocol::RETRANSMIT_TIMEOUT;

/// Shortest timeout or sweep period a policy accepts
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// When and how often unacknowledged datagrams are resent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitPolicy {
    /// Age after which a pending datagram is resent
    pub timeout: Duration,
    /// Period of the background sweep; shorter than `timeout`
    pub sweep_interval: Duration,
    /// Resends per datagram before it is abandoned (`None` = unbounded)
    pub max_retransmits: Option<u32>,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            timeout: RETRANSMIT_TIMEOUT,
            sweep_interval: Duration::from_secs(1),
            max_retransmits: Some(5),
        }
    }
}

impl RetransmitPolicy {
    /// Build a policy; a retry limit of 0 means retry forever
    ///
    /// Both periods are kept non-zero, and a sweep interval that is not
    /// shorter than the timeout falls back to half the timeout.
    pub fn new(timeout: Duration, sweep_interval: Duration, max_retransmits: u32) -> Self {
        let timeout = timeout.max(MIN_PERIOD);
        let sweep_interval = if sweep_interval.is_zero() || sweep_interval >= timeout {
            (timeout / 2).max(MIN_PERIOD)
        } else {
            sweep_interval
        };

        Self {
            timeout,
            sweep_interval,
            max_retransmits: (max_retransmits > 0).then_some(max_retransmits),
        }
    }
}
