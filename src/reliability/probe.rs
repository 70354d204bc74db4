//! Round-trip probes
//!
//! One outstanding probe per target; a newer probe overwrites the older
//! start time. Responses with no matching probe are ignored.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct RttProbe {
    started: HashMap<String, Instant>,
}

impl RttProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the send time of a probe to `target`
    pub fn start(&mut self, target: &str, now: Instant) {
        self.started.insert(target.to_string(), now);
    }

    /// Resolve the probe for `from`, returning the elapsed time
    pub fn complete(&mut self, from: &str, now: Instant) -> Option<Duration> {
        self.started
            .remove(from)
            .map(|started| now.saturating_duration_since(started))
    }

    /// Forget a probe that could not be sent
    pub fn cancel(&mut self, target: &str) {
        self.started.remove(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_and_remove() {
        let start = Instant::now();
        let mut probe = RttProbe::new();
        probe.start("bob", start);

        let rtt = probe.complete("bob", start + Duration::from_millis(42)).unwrap();
        assert_eq!(rtt, Duration::from_millis(42));
        assert!(!probe.started.contains_key("bob"));

        // Late duplicate
        assert_eq!(probe.complete("bob", start + Duration::from_millis(50)), None);
    }

    #[test]
    fn test_restart_overwrites() {
        let start = Instant::now();
        let mut probe = RttProbe::new();
        probe.start("bob", start);
        probe.start("bob", start + Duration::from_millis(100));
        assert_eq!(probe.started.len(), 1);

        let rtt = probe.complete("bob", start + Duration::from_millis(130)).unwrap();
        assert_eq!(rtt, Duration::from_millis(30));
    }

    #[test]
    fn test_unknown_and_cancelled() {
        let start = Instant::now();
        let mut probe = RttProbe::new();
        assert_eq!(probe.complete("nobody", start), None);

        probe.start("carol", start);
        probe.cancel("carol");
        assert_eq!(probe.complete("carol", start), None);
    }

    #[test]
    fn test_clock_skew_is_non_negative() {
        let start = Instant::now() + Duration::from_secs(1);
        let mut probe = RttProbe::new();
        probe.start("bob", start);
        assert_eq!(probe.complete("bob", Instant::now()), Some(Duration::ZERO));
    }
}
