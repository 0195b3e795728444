//! Overrun warning.
//!
//! Large runs sometimes take far longer than estimated, most often because the
//! files are cloud-synced placeholders that have to be downloaded before they
//! can be read. The monitor only reports; it never interrupts anything.

use serde::Serialize;
use std::time::{Duration, Instant};

pub const DEFAULT_OVERRUN_THRESHOLD: f64 = 1.3;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OverrunStatus {
    pub overdue: bool,
    pub elapsed_ms: f64,
    /// How far past the estimate, zero until overdue.
    pub overrun_secs: f64,
}

#[derive(Debug, Clone)]
pub struct OverrunMonitor {
    estimate_ms: f64,
    started_at: Instant,
    threshold: f64,
    poll_interval: Duration,
    last_tick: Option<Instant>,
}

impl OverrunMonitor {
    pub fn new(estimate_ms: f64, started_at: Instant, threshold: f64, poll_interval: Duration) -> Self {
        let threshold = if threshold.is_finite() && threshold >= 1.0 {
            threshold
        } else {
            DEFAULT_OVERRUN_THRESHOLD
        };
        Self {
            estimate_ms: estimate_ms.max(0.0),
            started_at,
            threshold,
            poll_interval,
            last_tick: None,
        }
    }

    pub fn check(&self, now: Instant) -> OverrunStatus {
        let elapsed_ms = now.saturating_duration_since(self.started_at).as_secs_f64() * 1000.0;
        let overdue = elapsed_ms > self.estimate_ms * self.threshold;
        let overrun_secs = if overdue {
            (elapsed_ms - self.estimate_ms).max(0.0) / 1000.0
        } else {
            0.0
        };
        OverrunStatus {
            overdue,
            elapsed_ms,
            overrun_secs,
        }
    }

    /// Same as [`check`](Self::check), but only once per poll interval.
    pub fn tick(&mut self, now: Instant) -> Option<OverrunStatus> {
        if let Some(last) = self.last_tick {
            if now.saturating_duration_since(last) < self.poll_interval {
                return None;
            }
        }
        self.last_tick = Some(now);
        Some(self.check(now))
    }
}
