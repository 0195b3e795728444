//! Hardware calibration store.
//!
//! Keeps a rolling window of observed throughput samples (files processed per
//! millisecond) so estimates adapt to the device they run on. Calibration is
//! best effort: storage failures degrade to the baseline, corrupt data is
//! wiped, and nothing here returns an error to the caller.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::StorageError;

/// Throughput of a typical device, in files per millisecond. Used whenever no
/// valid samples exist. Bump `BASELINE_VERSION` when changing it.
pub const BASELINE_H_FACTOR: f64 = 0.5;
pub const BASELINE_VERSION: u32 = 1;

pub const MIN_H_FACTOR: f64 = 0.01;
pub const MAX_H_FACTOR: f64 = 100.0;
pub const DEFAULT_RETENTION: usize = 50;
pub const MIN_RETENTION: usize = 5;

const SAMPLES_KEY: &str = "calibration.samples.v1";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    #[serde(rename = "hFactor")]
    pub h_factor: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Stored,
    /// Outside `[MIN_H_FACTOR, MAX_H_FACTOR]` or not finite.
    Rejected,
    /// Valid, but storage could not take it even after shrinking the window.
    Dropped,
}

/// Simple key-value persistence with a byte quota that can fail.
pub trait KeyValueStorage: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
}

impl<S: KeyValueStorage + ?Sized> KeyValueStorage for Box<S> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

/// In-memory storage, mostly for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: AHashMap<String, String>,
    quota_bytes: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            values: AHashMap::new(),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn used_bytes_excluding(&self, key: &str) -> usize {
        self.values
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        if let Some(quota) = self.quota_bytes {
            let needed = self.used_bytes_excluding(key) + key.len() + value.len();
            if needed > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    quota,
                });
            }
        }
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.values.remove(key);
        Ok(())
    }
}

/// One file per key under a directory, with a per-value byte quota.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    quota_bytes: usize,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>, quota_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            quota_bytes,
        }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        if value.len() > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                key: key.to_string(),
                needed: value.len(),
                quota: self.quota_bytes,
            });
        }
        fs::create_dir_all(&self.dir)?;
        let path = self.key_path(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct CalibrationStore<S: KeyValueStorage> {
    storage: S,
    retention: usize,
}

impl<S: KeyValueStorage> CalibrationStore<S> {
    pub fn new(storage: S) -> Self {
        Self::with_retention(storage, DEFAULT_RETENTION)
    }

    pub fn with_retention(storage: S, retention: usize) -> Self {
        Self {
            storage,
            retention: retention.max(1),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn record_sample(&mut self, h_factor: f64) -> SampleOutcome {
        if !is_valid_h_factor(h_factor) {
            debug!("Rejected calibration sample {}", h_factor);
            return SampleOutcome::Rejected;
        }

        let mut samples = self.load();
        samples.push(CalibrationSample {
            h_factor,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        truncate_oldest(&mut samples, self.retention);

        match self.save(&samples) {
            Ok(()) => SampleOutcome::Stored,
            Err(StorageError::QuotaExceeded { .. }) => {
                self.retention = (self.retention / 2).max(MIN_RETENTION);
                truncate_oldest(&mut samples, self.retention);
                warn!(
                    "Calibration storage over quota, retention reduced to {}",
                    self.retention
                );
                match self.save(&samples) {
                    Ok(()) => SampleOutcome::Stored,
                    Err(e) => {
                        warn!("Dropping calibration sample: {}", e);
                        SampleOutcome::Dropped
                    }
                }
            }
            Err(e) => {
                warn!("Dropping calibration sample: {}", e);
                SampleOutcome::Dropped
            }
        }
    }

    /// Mean of stored samples, or the baseline when there are none.
    pub fn calibration_factor(&mut self) -> f64 {
        let samples = self.load();
        if samples.is_empty() {
            return BASELINE_H_FACTOR;
        }
        samples.iter().map(|s| s.h_factor).sum::<f64>() / samples.len() as f64
    }

    pub fn samples(&mut self) -> Vec<CalibrationSample> {
        self.load()
    }

    pub fn reset(&mut self) {
        if let Err(e) = self.storage.remove(SAMPLES_KEY) {
            warn!("Failed to reset calibration samples: {}", e);
        }
    }

    /// Reads the window, wiping it if anything in it is unusable.
    fn load(&mut self) -> Vec<CalibrationSample> {
        let raw = match self.storage.get(SAMPLES_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Calibration storage unavailable: {}", e);
                return Vec::new();
            }
        };

        let parsed: Result<Vec<CalibrationSample>, _> = serde_json::from_str(&raw);
        match parsed {
            Ok(samples) if samples.iter().all(|s| is_valid_h_factor(s.h_factor)) => samples,
            Ok(_) => {
                warn!("Calibration samples out of range, resetting store");
                self.reset();
                Vec::new()
            }
            Err(e) => {
                warn!("Calibration samples corrupt ({}), resetting store", e);
                self.reset();
                Vec::new()
            }
        }
    }

    fn save(&mut self, samples: &[CalibrationSample]) -> Result<(), StorageError> {
        let raw = serde_json::to_string(samples)?;
        self.storage.set(SAMPLES_KEY, &raw)
    }
}

pub fn is_valid_h_factor(h_factor: f64) -> bool {
    h_factor.is_finite() && (MIN_H_FACTOR..=MAX_H_FACTOR).contains(&h_factor)
}

fn truncate_oldest(samples: &mut Vec<CalibrationSample>, keep: usize) {
    if samples.len() > keep {
        let excess = samples.len() - keep;
        samples.drain(..excess);
    }
}
