use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One height observation. Samples live only in memory; the ring is rebuilt
/// from node polls after a restart.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub timestamp: DateTime<Utc>,
    pub chain_height: u64,
}

pub const DEFAULT_SAMPLE_CAPACITY: usize = 20;

/// Tracks observed chain height and estimates time-to-target from recent
/// throughput. Estimates are advisory: they feed notifications and the
/// status endpoint, never admission.
#[derive(Debug)]
pub struct ProgressTracker {
    samples: VecDeque<ProgressSample>,
    capacity: usize,
}

impl ProgressTracker {
    pub fn new(capacity: usize) -> Self {
        Self { samples: VecDeque::with_capacity(capacity), capacity: capacity.max(2) }
    }

    /// Records a height observation, evicting the oldest sample at capacity.
    /// Out-of-order timestamps are dropped rather than poisoning the rate.
    pub fn sample(&mut self, timestamp: DateTime<Utc>, chain_height: u64) {
        if let Some(last) = self.samples.back() {
            if timestamp <= last.timestamp {
                tracing::debug!(%timestamp, "Dropping non-monotonic progress sample");
                return;
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ProgressSample { timestamp, chain_height });
    }

    pub fn current_height(&self) -> Option<u64> {
        self.samples.back().map(|s| s.chain_height)
    }

    /// Mean height gained per second over the ring, `None` until two samples
    /// exist or when the node is stalled/regressing.
    fn mean_rate(&self) -> Option<f64> {
        let (first, last) = (self.samples.front()?, self.samples.back()?);
        if self.samples.len() < 2 {
            return None;
        }
        let elapsed = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return None;
        }
        // signed: a resyncing node can regress
        let delta = last.chain_height as f64 - first.chain_height as f64;
        let rate = delta / elapsed;
        (rate > 0.0).then_some(rate)
    }

    /// Estimated time until `target_height` is reached. `None` means
    /// Unknown: fewer than two samples, or a stalled/regressing node —
    /// never a division by a non-positive rate.
    pub fn estimate_completion(&self, target_height: u64) -> Option<Duration> {
        let current = self.current_height()?;
        if target_height <= current {
            return Some(Duration::ZERO);
        }
        let rate = self.mean_rate()?;
        let remaining = (target_height - current) as f64;
        let secs = remaining / rate;
        if !secs.is_finite() {
            return None;
        }
        Some(Duration::from_secs_f64(secs))
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CAPACITY)
    }
}
