use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Hashing progress for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HashProgress {
    pub processed: usize,
    pub total: usize,
    pub percentage: f64,
}

impl HashProgress {
    pub fn new(processed: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            processed as f64 / total as f64 * 100.0
        };
        Self {
            processed,
            total,
            percentage,
        }
    }
}

/// Lets through at most one emission per interval. The first call always
/// emits.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_caps_simulated_run() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(Duration::from_secs(1));
        let mut emitted = 0;
        for tick in 0..=200u64 {
            if throttle.should_emit(start + Duration::from_millis(tick * 50)) {
                emitted += 1;
            }
        }
        assert!(emitted <= 11, "emitted {} events", emitted);
        assert!(emitted >= 10);
    }

    #[test]
    fn test_first_call_emits() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(throttle.should_emit(now));
        assert!(!throttle.should_emit(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_progress_percentage() {
        assert_eq!(HashProgress::new(1, 4).percentage, 25.0);
        assert_eq!(HashProgress::new(0, 0).percentage, 100.0);
    }
}
