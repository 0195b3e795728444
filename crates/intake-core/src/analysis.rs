use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing::debug;

use crate::dedup::SizePartition;
use crate::estimate::{bytes_to_mb, EstimateInput, TimeEstimate};
use crate::paths::DirectoryStats;

/// The predictors for one batch, as fed to the estimator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchAnalysis {
    pub total_files: usize,
    pub candidate_count: usize,
    pub candidate_percent: f64,
    pub unique_files: usize,
    pub unique_size_mb: f64,
    pub candidate_size_mb: f64,
    pub total_size_mb: f64,
    pub directory_count: usize,
    pub avg_depth: f64,
    pub max_depth: usize,
}

impl BatchAnalysis {
    pub fn new(stats: &DirectoryStats, partition: &SizePartition) -> Self {
        let total_files = partition.unique.len() + partition.candidates.len();
        let candidate_count = partition.candidates.len();
        let unique_size_mb = bytes_to_mb(partition.unique_bytes());
        let candidate_size_mb = bytes_to_mb(partition.candidate_bytes());
        let candidate_percent = if total_files == 0 {
            0.0
        } else {
            candidate_count as f64 / total_files as f64 * 100.0
        };

        Self {
            total_files,
            candidate_count,
            candidate_percent,
            unique_files: partition.unique.len(),
            unique_size_mb,
            candidate_size_mb,
            total_size_mb: unique_size_mb + candidate_size_mb,
            directory_count: stats.directory_count,
            avg_depth: stats.avg_depth,
            max_depth: stats.max_depth,
        }
    }

    pub fn estimate_input(&self) -> EstimateInput {
        EstimateInput {
            file_count: self.total_files,
            candidate_count: self.candidate_count,
            candidate_size_mb: self.candidate_size_mb,
            avg_depth: self.avg_depth,
            directory_count: self.directory_count,
        }
    }

    pub fn log(&self) {
        debug!(
            total_files = self.total_files,
            candidate_count = self.candidate_count,
            candidate_percent = self.candidate_percent,
            unique_files = self.unique_files,
            unique_size_mb = self.unique_size_mb,
            candidate_size_mb = self.candidate_size_mb,
            total_size_mb = self.total_size_mb,
            directory_count = self.directory_count,
            avg_depth = self.avg_depth,
            max_depth = self.max_depth,
            "Batch analysis"
        );
    }
}

/// Measured durations of one run next to what was predicted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunTimings {
    /// RFC 3339, UTC.
    pub run_at: String,
    pub total_files: usize,
    pub candidate_count: usize,
    pub candidate_size_mb: f64,
    pub directory_count: usize,
    pub avg_depth: f64,
    pub scanning_ms: f64,
    pub hashing_ms: f64,
    pub total_ms: f64,
    pub estimated_phase1_ms: f64,
    pub estimated_phase2_ms: f64,
    pub estimated_phase3_ms: f64,
    pub estimated_total_ms: f64,
    pub accuracy_percent: f64,
    pub h_factor: f64,
    pub worker_restarts: u32,
}

impl RunTimings {
    pub fn new(
        analysis: &BatchAnalysis,
        estimate: &TimeEstimate,
        scanning_ms: f64,
        hashing_ms: f64,
        worker_restarts: u32,
    ) -> Self {
        let total_ms = scanning_ms + hashing_ms;
        let h_factor = if total_ms > 0.0 {
            analysis.total_files as f64 / total_ms
        } else {
            0.0
        };
        Self {
            run_at: chrono::Utc::now().to_rfc3339(),
            total_files: analysis.total_files,
            candidate_count: analysis.candidate_count,
            candidate_size_mb: analysis.candidate_size_mb,
            directory_count: analysis.directory_count,
            avg_depth: analysis.avg_depth,
            scanning_ms,
            hashing_ms,
            total_ms,
            estimated_phase1_ms: estimate.phase1_ms,
            estimated_phase2_ms: estimate.phase2_ms,
            estimated_phase3_ms: estimate.phase3_ms,
            estimated_total_ms: estimate.total_ms,
            accuracy_percent: accuracy_percent(total_ms, estimate.total_ms),
            h_factor,
            worker_restarts,
        }
    }

    /// Appends one row to `path`, writing the header only when the file is new.
    pub fn write_csv(&self, path: &Path) -> Result<(), csv::Error> {
        let file_exists = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(file);
        wtr.serialize(self)?;
        wtr.flush()?;
        Ok(())
    }
}

/// 100 minus the absolute error as a percentage of the actual duration.
pub fn accuracy_percent(actual_ms: f64, predicted_ms: f64) -> f64 {
    if actual_ms <= 0.0 {
        return 0.0;
    }
    100.0 - (actual_ms - predicted_ms).abs() / actual_ms * 100.0
}
