use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::calibration::{
    CalibrationStore, FileStorage, KeyValueStorage, DEFAULT_RETENTION, MIN_RETENTION,
};
use crate::error::Error;
use crate::estimate::{Estimator, EstimatorCoefficients};
use crate::monitor::DEFAULT_OVERRUN_THRESHOLD;
use crate::queue::{IntakeContext, QueueSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Globs matched against full paths and entry names while scanning.
    pub ignore_patterns: Vec<String>,
    pub calibration_dir: PathBuf,
    pub calibration: CalibrationConfig,
    pub estimator: EstimatorCoefficients,
    pub monitor: MonitorConfig,
    pub worker: WorkerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            calibration_dir: PathBuf::from(".intake"),
            calibration: CalibrationConfig::default(),
            estimator: EstimatorCoefficients::default(),
            monitor: MonitorConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub retention: usize,
    pub quota_bytes: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            quota_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub overrun_threshold: f64,
    pub poll_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            overrun_threshold: DEFAULT_OVERRUN_THRESHOLD,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub progress_interval_ms: u64,
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub max_restarts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 1_000,
            health_interval_ms: 5_000,
            health_timeout_ms: 30_000,
            max_restarts: 2,
        }
    }
}

/// Reads `Config.toml` (optional) and `INTAKE__*` environment overrides, e.g.
/// `INTAKE__WORKER__MAX_RESTARTS=5`.
pub fn load_configuration() -> Result<AppConfig, Error> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .add_source(Environment::with_prefix("INTAKE").separator("__"))
        .build()?;
    let config = builder.try_deserialize::<AppConfig>()?;
    config.validate()?;
    Ok(config)
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.estimator.validate()?;
        if self.calibration.retention < MIN_RETENTION {
            return Err(Error::InvalidConfig(format!(
                "calibration.retention must be at least {}",
                MIN_RETENTION
            )));
        }
        if !self.monitor.overrun_threshold.is_finite() || self.monitor.overrun_threshold < 1.0 {
            return Err(Error::InvalidConfig(
                "monitor.overrun_threshold must be at least 1.0".to_string(),
            ));
        }
        if self.worker.health_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "worker.health_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            progress_interval: Duration::from_millis(self.worker.progress_interval_ms),
            health_interval: Duration::from_millis(self.worker.health_interval_ms),
            health_timeout: Duration::from_millis(self.worker.health_timeout_ms),
            max_worker_restarts: self.worker.max_restarts,
            overrun_threshold: self.monitor.overrun_threshold,
            monitor_poll_interval: Duration::from_millis(self.monitor.poll_interval_ms),
        }
    }

    pub fn calibration_store(&self) -> CalibrationStore<Box<dyn KeyValueStorage>> {
        let storage: Box<dyn KeyValueStorage> = Box::new(FileStorage::new(
            self.calibration_dir.clone(),
            self.calibration.quota_bytes,
        ));
        CalibrationStore::with_retention(storage, self.calibration.retention)
    }

    pub fn build_context(&self) -> IntakeContext {
        IntakeContext::new(
            self.queue_settings(),
            Estimator::new(self.estimator),
            self.calibration_store(),
        )
    }
}
