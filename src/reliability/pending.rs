//! Pending-delivery bookkeeping
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility. Time is passed in explicitly so sweeps are deterministic.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use super::RetransmitPolicy;

/// Sender-scoped sequence numbers, starting at 1
///
/// 0 means "not applicable" on the wire and is never handed out.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    last: AtomicU32,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number
    pub fn next(&self) -> u32 {
        loop {
            let sequence = self.last.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if sequence != 0 {
                return sequence;
            }
        }
    }
}

/// One datagram awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    /// Exact bytes of the first transmission; resends reuse them unchanged
    pub raw: Bytes,
    /// Time of the most recent transmission
    pub sent_at: Instant,
    /// Resends so far
    pub retransmits: u32,
}

/// Result of one sweep
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Entries to resend now, with their new retransmit count
    pub retransmit: Vec<(u32, Bytes, u32)>,
    /// Entries removed because they hit the retry limit
    pub abandoned: Vec<u32>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.retransmit.is_empty() && self.abandoned.is_empty()
    }
}

/// Unacknowledged sends keyed by sequence number
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: BTreeMap<u32, PendingDelivery>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a datagram that is about to be (or was just) sent
    pub fn record(&mut self, sequence: u32, raw: Bytes, now: Instant) {
        self.entries.insert(
            sequence,
            PendingDelivery {
                raw,
                sent_at: now,
                retransmits: 0,
            },
        );
    }

    /// Retire an entry; unknown sequence numbers return `false`
    pub fn acknowledge(&mut self, sequence: u32) -> bool {
        self.entries.remove(&sequence).is_some()
    }

    /// Collect every entry older than the timeout
    ///
    /// Due entries get a fresh timestamp and a bumped retransmit count;
    /// entries that already used up their retries are removed instead.
    pub fn sweep(&mut self, now: Instant, policy: &RetransmitPolicy) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for (sequence, entry) in self.entries.iter_mut() {
            if now.saturating_duration_since(entry.sent_at) < policy.timeout {
                continue;
            }

            match policy.max_retransmits {
                Some(max) if entry.retransmits >= max => outcome.abandoned.push(*sequence),
                _ => {
                    entry.retransmits += 1;
                    entry.sent_at = now;
                    outcome
                        .retransmit
                        .push((*sequence, entry.raw.clone(), entry.retransmits));
                }
            }
        }

        for sequence in &outcome.abandoned {
            self.entries.remove(sequence);
        }

        outcome
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
