pub mod analysis;
pub mod calibration;
pub mod config;
pub mod dedup;
pub mod error;
pub mod estimate;
pub mod model;
pub mod monitor;
pub mod paths;
pub mod progress;
pub mod queue;
pub mod scanner;
pub mod source;
pub mod worker;

pub use config::AppConfig;
pub use error::Error;
pub use model::{ContentHash, FileRecord, FileStatus, RecordId};
pub use queue::{IntakeContext, IntakeQueue, QueueEvent, QueuePhase, UploadSink, UploadSummary};
pub use source::{DiskFile, FileHandle, MemoryFile, SharedHandle};
pub use worker::{CancelToken, ThreadWorkerFactory};
