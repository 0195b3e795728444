//! Background hash worker.
//!
//! The coordinator talks to a worker only through typed messages. A worker
//! hashes the files of one dispatched batch, reports throttled progress that
//! carries the hashes computed so far, answers health checks between files and
//! finishes with a full [`Resolution`] of the batch.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::dedup::{resolve_hash_groups, Resolution};
use crate::error::{HashError, WorkerError};
use crate::model::{CandidateMeta, HashedCandidate, RecordId};
use crate::progress::{HashProgress, ProgressThrottle};
use crate::source::{hash_handle, SharedHandle};

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Cooperative cancellation flag shared between the coordinator and workers.
///
/// A child token reports cancelled when either it or its parent is, so the
/// coordinator can stop a single worker without touching the others.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::SeqCst))
    }

    pub fn child(&self) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.flag)),
        }
    }
}

#[derive(Clone)]
pub struct PendingFile {
    pub meta: CandidateMeta,
    pub handle: SharedHandle,
}

#[derive(Clone)]
pub struct DispatchBatch {
    pub batch_id: u64,
    pub pending: Vec<PendingFile>,
    /// Hashes already known, from earlier batches or earlier workers.
    pub prehashed: Vec<HashedCandidate>,
}

pub enum WorkerRequest {
    Dispatch(DispatchBatch),
    HealthCheck { nonce: u64 },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    Progress {
        batch_id: u64,
        processed: usize,
        total: usize,
        percentage: f64,
        /// Hashes computed since the previous progress event.
        checkpoint: Vec<HashedCandidate>,
    },
    Complete {
        batch_id: u64,
        resolution: Resolution,
        failed: Vec<RecordId>,
    },
    Error {
        batch_id: u64,
        record_id: RecordId,
        message: String,
    },
    HealthAck {
        nonce: u64,
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
    },
}

impl WorkerEvent {
    pub fn batch_id(&self) -> Option<u64> {
        match self {
            WorkerEvent::Progress { batch_id, .. }
            | WorkerEvent::Complete { batch_id, .. }
            | WorkerEvent::Error { batch_id, .. } => Some(*batch_id),
            WorkerEvent::HealthAck { .. } => None,
        }
    }
}

/// Transport between the coordinator and one worker.
pub trait HashChannel: Send {
    fn send(&self, request: WorkerRequest) -> Result<(), WorkerError>;

    /// `Ok(None)` on timeout, `Err(Disconnected)` once the worker is gone.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerEvent>, WorkerError>;

    fn try_recv(&self) -> Result<Option<WorkerEvent>, WorkerError> {
        self.recv_timeout(Duration::ZERO)
    }

    /// Stops the worker without waiting for it.
    fn terminate(&mut self);
}

pub trait WorkerFactory: Send {
    fn spawn(&self, cancel: CancelToken) -> Result<Box<dyn HashChannel>, WorkerError>;
}

#[derive(Debug, Clone)]
pub struct ThreadWorkerFactory {
    progress_interval: Duration,
    /// Numbers worker threads spawned by this factory.
    spawned: Arc<AtomicU64>,
}

impl ThreadWorkerFactory {
    pub fn new(progress_interval: Duration) -> Self {
        Self {
            progress_interval,
            spawned: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for ThreadWorkerFactory {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    fn spawn(&self, cancel: CancelToken) -> Result<Box<dyn HashChannel>, WorkerError> {
        let (request_tx, request_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let worker_cancel = cancel.clone();
        let progress_interval = self.progress_interval;
        let seq = self.spawned.fetch_add(1, Ordering::Relaxed);

        thread::Builder::new()
            .name(format!("hash-worker-{}", seq))
            .spawn(move || run_worker(request_rx, event_tx, worker_cancel, progress_interval))
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        debug!("Spawned hash worker {}", seq);
        Ok(Box::new(ThreadChannel {
            requests: request_tx,
            events: event_rx,
            cancel,
        }))
    }
}

struct ThreadChannel {
    requests: Sender<WorkerRequest>,
    events: Receiver<WorkerEvent>,
    cancel: CancelToken,
}

impl HashChannel for ThreadChannel {
    fn send(&self, request: WorkerRequest) -> Result<(), WorkerError> {
        self.requests
            .send(request)
            .map_err(|_| WorkerError::Disconnected)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<WorkerEvent>, WorkerError> {
        if timeout.is_zero() {
            return match self.events.try_recv() {
                Ok(event) => Ok(Some(event)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(WorkerError::Disconnected),
            };
        }
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(WorkerError::Disconnected),
        }
    }

    fn terminate(&mut self) {
        self.cancel.cancel();
        // The thread may already be gone.
        let _ = self.requests.send(WorkerRequest::Shutdown);
    }
}

impl Drop for ThreadChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}

enum Control {
    Continue,
    Stop,
}

/// Worker thread body. Returns when shut down, cancelled, or when the
/// coordinator hangs up.
pub fn run_worker(
    requests: Receiver<WorkerRequest>,
    events: Sender<WorkerEvent>,
    cancel: CancelToken,
    progress_interval: Duration,
) {
    let mut deferred: VecDeque<DispatchBatch> = VecDeque::new();
    loop {
        let request = match deferred.pop_front() {
            Some(batch) => WorkerRequest::Dispatch(batch),
            None => match requests.recv() {
                Ok(request) => request,
                Err(_) => return,
            },
        };

        match request {
            WorkerRequest::Dispatch(batch) => {
                let control = hash_batch(
                    batch,
                    &requests,
                    &events,
                    &cancel,
                    progress_interval,
                    &mut deferred,
                );
                if let Control::Stop = control {
                    return;
                }
            }
            WorkerRequest::HealthCheck { nonce } => {
                if let Control::Stop = send_ack(&events, nonce) {
                    return;
                }
            }
            WorkerRequest::Shutdown => return,
        }
    }
}

fn hash_batch(
    batch: DispatchBatch,
    requests: &Receiver<WorkerRequest>,
    events: &Sender<WorkerEvent>,
    cancel: &CancelToken,
    progress_interval: Duration,
    deferred: &mut VecDeque<DispatchBatch>,
) -> Control {
    let DispatchBatch {
        batch_id,
        pending,
        prehashed,
    } = batch;
    let total = pending.len();
    debug!(
        "Worker hashing batch {}: {} files, {} prehashed",
        batch_id,
        total,
        prehashed.len()
    );

    let mut throttle = ProgressThrottle::new(progress_interval);
    let mut hashed: Vec<HashedCandidate> = prehashed;
    let mut checkpoint: Vec<HashedCandidate> = Vec::new();
    let mut failed: Vec<RecordId> = Vec::new();

    for (processed, file) in pending.into_iter().enumerate() {
        if let Control::Stop = answer_requests(requests, events, deferred) {
            return Control::Stop;
        }
        if cancel.is_cancelled() {
            debug!("Worker cancelled during batch {}", batch_id);
            return Control::Stop;
        }

        match hash_handle(file.handle.as_ref()) {
            Ok(hash) => {
                trace!("Hashed {} -> {}", file.meta.path, hash);
                let candidate = HashedCandidate {
                    meta: file.meta,
                    hash,
                };
                checkpoint.push(candidate.clone());
                hashed.push(candidate);
            }
            Err(source) => {
                let error = HashError {
                    record_id: file.meta.id,
                    path: file.meta.path,
                    source,
                };
                warn!("{}", error);
                failed.push(error.record_id);
                let event = WorkerEvent::Error {
                    batch_id,
                    record_id: error.record_id,
                    message: error.to_string(),
                };
                if events.send(event).is_err() {
                    return Control::Stop;
                }
            }
        }

        if throttle.should_emit(Instant::now()) {
            let progress = HashProgress::new(processed + 1, total);
            let event = WorkerEvent::Progress {
                batch_id,
                processed: progress.processed,
                total: progress.total,
                percentage: progress.percentage,
                checkpoint: std::mem::take(&mut checkpoint),
            };
            if events.send(event).is_err() {
                return Control::Stop;
            }
        }
    }

    if cancel.is_cancelled() {
        return Control::Stop;
    }

    let resolution = resolve_hash_groups(hashed);
    let event = WorkerEvent::Complete {
        batch_id,
        resolution,
        failed,
    };
    if events.send(event).is_err() {
        return Control::Stop;
    }
    Control::Continue
}

/// Handles whatever arrived while the current file was being hashed.
fn answer_requests(
    requests: &Receiver<WorkerRequest>,
    events: &Sender<WorkerEvent>,
    deferred: &mut VecDeque<DispatchBatch>,
) -> Control {
    loop {
        match requests.try_recv() {
            Ok(WorkerRequest::HealthCheck { nonce }) => {
                if let Control::Stop = send_ack(events, nonce) {
                    return Control::Stop;
                }
            }
            Ok(WorkerRequest::Dispatch(batch)) => deferred.push_back(batch),
            Ok(WorkerRequest::Shutdown) => return Control::Stop,
            Err(TryRecvError::Empty) => return Control::Continue,
            Err(TryRecvError::Disconnected) => return Control::Stop,
        }
    }
}

fn send_ack(events: &Sender<WorkerEvent>, nonce: u64) -> Control {
    let ack = WorkerEvent::HealthAck {
        nonce,
        timestamp: chrono::Utc::now().timestamp_millis(),
    };
    match events.send(ack) {
        Ok(()) => Control::Continue,
        Err(_) => Control::Stop,
    }
}
