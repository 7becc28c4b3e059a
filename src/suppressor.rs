//! Change-rate suppression.
//!
//! Files rewritten faster than the configured threshold are flagged invalid
//! by the scanner instead of flooding the cluster with index updates and
//! block churn. The flag clears once the rate drops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

use crate::scanner::Suppress;

struct Seen {
    size: u64,
    at: Instant,
}

/// Tracks per-file size deltas between scans and flags files whose change
/// rate exceeds a threshold.
pub struct Suppressor {
    threshold_bytes_per_s: u64,
    seen: Mutex<HashMap<String, Seen>>,
}

impl Suppressor {
    /// `threshold_kbps` of zero disables suppression entirely.
    pub fn new(threshold_kbps: u64) -> Self {
        Self {
            threshold_bytes_per_s: threshold_kbps * 1024,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, name: &str, size: u64, now: Instant) -> bool {
        if self.threshold_bytes_per_s == 0 {
            return false;
        }

        let mut seen = self.seen.lock();
        let decision = match seen.get(name) {
            Some(prev) => {
                let delta = size.abs_diff(prev.size);
                let elapsed = now.duration_since(prev.at).as_secs_f64();
                if elapsed <= 0.0 {
                    delta > 0
                } else {
                    (delta as f64 / elapsed) > self.threshold_bytes_per_s as f64
                }
            }
            None => false,
        };
        seen.insert(name.to_string(), Seen { size, at: now });
        decision
    }
}

impl Suppress for Suppressor {
    fn suppress(&self, name: &str, size: u64) -> bool {
        self.check(name, size, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_sighting_never_suppresses() {
        let sup = Suppressor::new(100);
        assert!(!sup.suppress("f", 1_000_000));
    }

    #[test]
    fn test_fast_change_suppresses() {
        let sup = Suppressor::new(100); // 100 KiB/s
        let t0 = Instant::now();
        sup.check("f", 0, t0);
        // 10 MiB of change in one second is far above threshold.
        assert!(sup.check("f", 10 * 1024 * 1024, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_slow_change_passes() {
        let sup = Suppressor::new(100);
        let t0 = Instant::now();
        sup.check("f", 0, t0);
        // 1 KiB over ten seconds.
        assert!(!sup.check("f", 1024, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_rate_recovery_clears() {
        let sup = Suppressor::new(1); // 1 KiB/s
        let t0 = Instant::now();
        sup.check("f", 0, t0);
        assert!(sup.check("f", 1024 * 1024, t0 + Duration::from_secs(1)));
        // Same size an hour later: no delta, no suppression.
        assert!(!sup.check("f", 1024 * 1024, t0 + Duration::from_secs(3601)));
    }

    #[test]
    fn test_zero_threshold_disables() {
        let sup = Suppressor::new(0);
        let t0 = Instant::now();
        sup.check("f", 0, t0);
        assert!(!sup.check("f", u64::MAX / 2, t0 + Duration::from_millis(1)));
    }
}
