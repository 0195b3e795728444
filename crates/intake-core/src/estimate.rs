//! Three-phase processing time estimate.
//!
//! Phase 1 covers path analysis, phase 2 hashing of duplicate candidates and
//! phase 3 materializing the queue for display. Each phase is a linear model
//! whose coefficients were fit on one measured environment; they are data, not
//! truth, and can be overridden from the `[estimator]` config section.

use serde::{Deserialize, Serialize};

use crate::calibration::{is_valid_h_factor, BASELINE_H_FACTOR};
use crate::error::Error;

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
pub const MIN_TOTAL_MS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorCoefficients {
    pub phase1_base_ms: f64,
    pub phase1_file_ms: f64,
    pub phase1_depth_ms: f64,
    pub phase1_dir_ms: f64,

    pub phase2_base_ms: f64,
    pub phase2_candidate_ms: f64,
    pub phase2_mb_ms: f64,

    pub phase3_base_ms: f64,
    pub phase3_file_ms: f64,
    pub phase3_depth_ms: f64,
    pub phase3_dir_ms: f64,

    /// The throughput the coefficients were measured at.
    pub baseline_h_factor: f64,
}

impl Default for EstimatorCoefficients {
    fn default() -> Self {
        Self {
            phase1_base_ms: 12.0,
            phase1_file_ms: 0.15,
            phase1_depth_ms: 4.5,
            phase1_dir_ms: 0.35,

            phase2_base_ms: 2.0,
            phase2_candidate_ms: 3.8,
            phase2_mb_ms: 9.5,

            phase3_base_ms: 40.0,
            phase3_file_ms: 0.8,
            phase3_depth_ms: 12.0,
            phase3_dir_ms: 1.2,

            baseline_h_factor: BASELINE_H_FACTOR,
        }
    }
}

impl EstimatorCoefficients {
    /// Slopes must be non-negative or more work could predict less time.
    pub fn validate(&self) -> Result<(), Error> {
        let slopes = [
            ("phase1_file_ms", self.phase1_file_ms),
            ("phase1_depth_ms", self.phase1_depth_ms),
            ("phase1_dir_ms", self.phase1_dir_ms),
            ("phase2_candidate_ms", self.phase2_candidate_ms),
            ("phase2_mb_ms", self.phase2_mb_ms),
            ("phase3_file_ms", self.phase3_file_ms),
            ("phase3_depth_ms", self.phase3_depth_ms),
            ("phase3_dir_ms", self.phase3_dir_ms),
        ];
        for (name, value) in slopes {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "estimator.{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        let intercepts = [self.phase1_base_ms, self.phase2_base_ms, self.phase3_base_ms];
        if intercepts.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidConfig(
                "estimator base times must be finite".to_string(),
            ));
        }
        if !is_valid_h_factor(self.baseline_h_factor) {
            return Err(Error::InvalidConfig(format!(
                "estimator.baseline_h_factor out of range: {}",
                self.baseline_h_factor
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EstimateInput {
    pub file_count: usize,
    pub candidate_count: usize,
    pub candidate_size_mb: f64,
    pub avg_depth: f64,
    pub directory_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimeEstimate {
    pub phase1_ms: f64,
    pub phase2_ms: f64,
    pub phase3_ms: f64,
    pub total_ms: f64,
}

impl TimeEstimate {
    pub fn total_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.total_ms / 1000.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Estimator {
    coefficients: EstimatorCoefficients,
}

impl Estimator {
    pub fn new(coefficients: EstimatorCoefficients) -> Self {
        Self { coefficients }
    }

    pub fn estimate(&self, input: &EstimateInput, calibration_factor: f64) -> TimeEstimate {
        let c = &self.coefficients;
        let files = input.file_count as f64;
        let dirs = input.directory_count as f64;
        let depth = input.avg_depth.max(0.0);

        let phase1 = c.phase1_base_ms
            + files * c.phase1_file_ms
            + depth * c.phase1_depth_ms
            + dirs * c.phase1_dir_ms;

        let phase2 = if input.candidate_count == 0 {
            0.0
        } else {
            c.phase2_base_ms
                + input.candidate_count as f64 * c.phase2_candidate_ms
                + input.candidate_size_mb.max(0.0) * c.phase2_mb_ms
        };

        let phase3 = c.phase3_base_ms
            + files * c.phase3_file_ms
            + depth * c.phase3_depth_ms
            + dirs * c.phase3_dir_ms;

        let current = if is_valid_h_factor(calibration_factor) {
            calibration_factor
        } else {
            c.baseline_h_factor
        };
        let scale = c.baseline_h_factor / current;

        let phase1_ms = (phase1 * scale).max(0.0);
        let phase2_ms = (phase2 * scale).max(0.0);
        let phase3_ms = (phase3 * scale).max(0.0);

        TimeEstimate {
            phase1_ms,
            phase2_ms,
            phase3_ms,
            total_ms: (phase1_ms + phase2_ms + phase3_ms).max(MIN_TOTAL_MS),
        }
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(files: usize, candidates: usize, mb: f64) -> EstimateInput {
        EstimateInput {
            file_count: files,
            candidate_count: candidates,
            candidate_size_mb: mb,
            avg_depth: 2.0,
            directory_count: 10,
        }
    }

    #[test]
    fn test_floor_on_degenerate_input() {
        let zero = EstimatorCoefficients {
            phase1_base_ms: -50.0,
            phase3_base_ms: -50.0,
            ..EstimatorCoefficients::default()
        };
        let estimator = Estimator::new(zero);
        let estimate = estimator.estimate(&EstimateInput::default(), BASELINE_H_FACTOR);
        assert!(estimate.total_ms >= MIN_TOTAL_MS);
        assert!(estimate.phase1_ms >= 0.0 && estimate.phase3_ms >= 0.0);

        let default = Estimator::default().estimate(&EstimateInput::default(), 0.0);
        assert!(default.total_ms >= MIN_TOTAL_MS);
    }

    #[test]
    fn test_file_count_monotonic_for_phase1_and_phase3() {
        let estimator = Estimator::default();
        let mut previous = estimator.estimate(&input(0, 4, 1.0), 1.0);
        for files in [1, 10, 100, 1_000, 10_000] {
            let current = estimator.estimate(&input(files, 4, 1.0), 1.0);
            assert!(current.phase1_ms >= previous.phase1_ms);
            assert!(current.phase3_ms >= previous.phase3_ms);
            assert_eq!(current.phase2_ms, previous.phase2_ms);
            previous = current;
        }
    }

    #[test]
    fn test_candidates_monotonic_for_phase2() {
        let estimator = Estimator::default();
        let mut previous = estimator.estimate(&input(100, 0, 0.0), 1.0);
        for (candidates, mb) in [(1, 0.0), (2, 0.5), (20, 0.5), (20, 50.0), (200, 50.0)] {
            let current = estimator.estimate(&input(100, candidates, mb), 1.0);
            assert!(current.phase2_ms >= previous.phase2_ms);
            previous = current;
        }
    }

    #[test]
    fn test_faster_device_predicts_less_time() {
        let estimator = Estimator::default();
        let slow = estimator.estimate(&input(500, 50, 5.0), 0.25);
        let baseline = estimator.estimate(&input(500, 50, 5.0), BASELINE_H_FACTOR);
        let fast = estimator.estimate(&input(500, 50, 5.0), 2.0);
        assert!(slow.total_ms > baseline.total_ms);
        assert!(fast.total_ms < baseline.total_ms);
    }

    #[test]
    fn test_deterministic() {
        let estimator = Estimator::default();
        let a = estimator.estimate(&input(321, 12, 3.3), 0.9);
        let b = estimator.estimate(&input(321, 12, 3.3), 0.9);
        assert_eq!(a, b);
    }

    #[test]
    fn test_validate_rejects_negative_slope() {
        let bad = EstimatorCoefficients {
            phase2_candidate_ms: -1.0,
            ..EstimatorCoefficients::default()
        };
        assert!(bad.validate().is_err());
        assert!(EstimatorCoefficients::default().validate().is_ok());
    }
}
