//! Queue coordinator.
//!
//! Owns the records and drives them through scanning, hashing and upload on
//! the caller's thread. Hashing happens on a worker reached through
//! [`WorkerFactory`]; everything observers see is published as a
//! [`QueueEvent`] snapshot.

use ahash::{AHashMap, AHashSet};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::fmt;
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::analysis::{BatchAnalysis, RunTimings};
use crate::calibration::{CalibrationStore, KeyValueStorage, MemoryStorage, SampleOutcome};
use crate::dedup::{partition_by_size, resolve_hash_groups, Resolution};
use crate::error::{Error, UploadError, WorkerError};
use crate::estimate::{Estimator, TimeEstimate};
use crate::model::{CandidateMeta, ContentHash, FileRecord, FileStatus, HashedCandidate, RecordId};
use crate::monitor::{OverrunMonitor, DEFAULT_OVERRUN_THRESHOLD, DEFAULT_POLL_INTERVAL};
use crate::paths::{analyze_paths, normalize_path};
use crate::progress::{HashProgress, ProgressThrottle};
use crate::source::{is_ingestible, SharedHandle};
use crate::worker::{
    CancelToken, DispatchBatch, HashChannel, PendingFile, WorkerEvent, WorkerFactory,
    WorkerRequest, DEFAULT_PROGRESS_INTERVAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueuePhase {
    Idle,
    Scanning,
    Hashing,
    Ready,
    Uploading,
    Completed,
    Cancelled,
    Error,
}

impl fmt::Display for QueuePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueuePhase::Idle => "idle",
            QueuePhase::Scanning => "scanning",
            QueuePhase::Hashing => "hashing",
            QueuePhase::Ready => "ready",
            QueuePhase::Uploading => "uploading",
            QueuePhase::Completed => "completed",
            QueuePhase::Cancelled => "cancelled",
            QueuePhase::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub progress_interval: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub max_worker_restarts: u32,
    pub overrun_threshold: f64,
    pub monitor_poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            health_interval: Duration::from_secs(5),
            health_timeout: Duration::from_secs(30),
            max_worker_restarts: 2,
            overrun_threshold: DEFAULT_OVERRUN_THRESHOLD,
            monitor_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Everything the queue needs from its host, passed in rather than held in
/// globals.
pub struct IntakeContext {
    pub settings: QueueSettings,
    pub estimator: Estimator,
    pub calibration: CalibrationStore<Box<dyn KeyValueStorage>>,
}

impl IntakeContext {
    pub fn new(
        settings: QueueSettings,
        estimator: Estimator,
        calibration: CalibrationStore<Box<dyn KeyValueStorage>>,
    ) -> Self {
        Self {
            settings,
            estimator,
            calibration,
        }
    }

    /// Default settings with calibration kept in memory only.
    pub fn in_memory() -> Self {
        let storage: Box<dyn KeyValueStorage> = Box::new(MemoryStorage::new());
        Self::new(
            QueueSettings::default(),
            Estimator::default(),
            CalibrationStore::new(storage),
        )
    }
}

/// Snapshot published to subscribers after every state change.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEvent {
    pub phase: QueuePhase,
    pub records: Vec<FileRecord>,
    pub estimate: Option<TimeEstimate>,
    pub progress: Option<HashProgress>,
    pub overdue: bool,
    /// Seconds past the estimate, zero unless overdue.
    pub overrun_secs: f64,
    pub worker_restarts: u32,
}

/// Destination for ready files. Files are keyed by content hash when they
/// have one.
pub trait UploadSink {
    fn upload(&self, record: &FileRecord, content: &mut dyn Read) -> Result<(), UploadError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub failed: usize,
    /// Duplicates left behind.
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub duplicate: usize,
    pub error: usize,
    pub uploaded: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Worker messages that arrived for a batch no longer active.
    pub stale_messages: usize,
    pub worker_restarts: u32,
}

struct Entry {
    record: FileRecord,
    handle: SharedHandle,
}

struct ActiveBatch {
    batch_id: u64,
    channel: Box<dyn HashChannel>,
    worker_cancel: CancelToken,
    pending: Vec<CandidateMeta>,
    prehashed: Vec<HashedCandidate>,
    checkpoint: AHashMap<RecordId, ContentHash>,
    failed: AHashMap<RecordId, String>,
    restarts: u32,
    scan_duration: Duration,
    hash_started: Instant,
    last_health_sent: Instant,
    awaiting_ack: Option<(u64, Instant)>,
    progress: Option<HashProgress>,
    monitor: OverrunMonitor,
    analysis: BatchAnalysis,
}

enum Drained {
    Idle { changed: bool },
    Complete {
        resolution: Resolution,
        failed: Vec<RecordId>,
    },
    Failed(WorkerError),
}

pub struct IntakeQueue {
    ctx: IntakeContext,
    factory: Box<dyn WorkerFactory>,
    entries: Vec<Entry>,
    next_id: u64,
    next_index: usize,
    next_batch_id: u64,
    next_nonce: u64,
    phase: QueuePhase,
    estimate: Option<TimeEstimate>,
    analysis: Option<BatchAnalysis>,
    timings: Option<RunTimings>,
    cancel: CancelToken,
    active: Option<ActiveBatch>,
    overdue: bool,
    overrun_secs: f64,
    subscribers: Vec<Sender<QueueEvent>>,
    stats: QueueStats,
}

impl IntakeQueue {
    pub fn new(ctx: IntakeContext, factory: Box<dyn WorkerFactory>) -> Self {
        Self {
            ctx,
            factory,
            entries: Vec::new(),
            next_id: 1,
            next_index: 0,
            next_batch_id: 1,
            next_nonce: 1,
            phase: QueuePhase::Idle,
            estimate: None,
            analysis: None,
            timings: None,
            cancel: CancelToken::new(),
            active: None,
            overdue: false,
            overrun_secs: 0.0,
            subscribers: Vec::new(),
            stats: QueueStats::default(),
        }
    }

    pub fn phase(&self) -> QueuePhase {
        self.phase
    }

    pub fn estimate(&self) -> Option<TimeEstimate> {
        self.estimate
    }

    pub fn analysis(&self) -> Option<&BatchAnalysis> {
        self.analysis.as_ref()
    }

    /// Timings of the last hashing run that reached Ready.
    pub fn last_timings(&self) -> Option<&RunTimings> {
        self.timings.as_ref()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub fn context(&self) -> &IntakeContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut IntakeContext {
        &mut self.ctx
    }

    pub fn records(&self) -> Vec<FileRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in &self.entries {
            match entry.record.status {
                FileStatus::Pending => counts.pending += 1,
                FileStatus::Ready => counts.ready += 1,
                FileStatus::Duplicate => counts.duplicate += 1,
                FileStatus::Error => counts.error += 1,
                FileStatus::Uploaded => counts.uploaded += 1,
            }
        }
        counts
    }

    /// Token that cancels the current run from another thread. A new token
    /// is issued when the queue is reused after a cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn subscribe(&mut self) -> Receiver<QueueEvent> {
        let (tx, rx) = unbounded();
        // New subscribers start from the current state.
        let _ = tx.send(self.snapshot());
        self.subscribers.push(tx);
        rx
    }

    /// Replaces the queue content with a freshly dropped folder.
    pub fn drop_folder(&mut self, handles: Vec<SharedHandle>) -> Result<(), Error> {
        self.clear();
        self.add_files(handles)
    }

    pub fn clear(&mut self) {
        if let Some(active) = self.active.take() {
            self.retire(active);
        }
        self.entries.clear();
        self.estimate = None;
        self.analysis = None;
        self.clear_overrun();
        self.renew_cancel_token();
        self.set_phase(QueuePhase::Idle);
    }

    /// Ingests `handles` and regroups the whole queue. Files already hashed
    /// keep their hash; only new candidates go to the worker.
    pub fn add_files(&mut self, handles: Vec<SharedHandle>) -> Result<(), Error> {
        let scan_started = Instant::now();
        self.renew_cancel_token();
        if let Some(active) = self.active.take() {
            debug!("New files arrived mid-hash, regrouping batch {}", active.batch_id);
            self.absorb_checkpoint(&active);
            self.retire(active);
        }

        self.clear_overrun();
        self.set_phase(QueuePhase::Scanning);

        let mut skipped = 0usize;
        for handle in handles {
            if !is_ingestible(handle.name()) {
                trace!("Skipping non-ingestible file {}", handle.name());
                skipped += 1;
                continue;
            }
            let path = match handle.relative_path() {
                Some(relative) if !relative.is_empty() => normalize_path(relative),
                _ => normalize_path(handle.name()),
            };
            let record = FileRecord {
                id: RecordId(self.next_id),
                path,
                size: handle.size(),
                last_modified: handle.last_modified(),
                content_hash: None,
                status: FileStatus::Pending,
                original_index: self.next_index,
                error: None,
            };
            self.next_id += 1;
            self.next_index += 1;
            self.entries.push(Entry { record, handle });
        }
        if skipped > 0 {
            debug!("Skipped {} files a file picker would not deliver", skipped);
        }

        let groupable: Vec<CandidateMeta> = self
            .entries
            .iter()
            .filter(|e| is_groupable(e.record.status))
            .map(|e| e.record.meta())
            .collect();

        let stats = analyze_paths(groupable.iter().map(|m| m.path.as_str()));
        let partition = partition_by_size(&groupable);
        let analysis = BatchAnalysis::new(&stats, &partition);
        analysis.log();

        let factor = self.ctx.calibration.calibration_factor();
        let estimate = self
            .ctx
            .estimator
            .estimate(&analysis.estimate_input(), factor);
        debug!(
            "Estimated {:.0} ms (phase1 {:.0}, phase2 {:.0}, phase3 {:.0}) at h-factor {:.3}",
            estimate.total_ms, estimate.phase1_ms, estimate.phase2_ms, estimate.phase3_ms, factor
        );
        self.estimate = Some(estimate);

        for unique in &partition.unique {
            if let Some(entry) = self.entry_mut(unique.id) {
                entry.record.status = FileStatus::Ready;
            }
        }

        let mut pending = Vec::new();
        let mut prehashed = Vec::new();
        for candidate in &partition.candidates {
            let Some(entry) = self.entry_mut(candidate.id) else {
                continue;
            };
            match &entry.record.content_hash {
                Some(hash) => prehashed.push(HashedCandidate {
                    meta: candidate.clone(),
                    hash: hash.clone(),
                }),
                None => {
                    entry.record.status = FileStatus::Pending;
                    pending.push(candidate.clone());
                }
            }
        }

        info!(
            "Scanned {} files: {} unique sizes, {} to hash, {} already hashed",
            analysis.total_files,
            partition.unique.len(),
            pending.len(),
            prehashed.len()
        );
        let scan_duration = scan_started.elapsed();
        self.analysis = Some(analysis.clone());

        if pending.is_empty() {
            if !prehashed.is_empty() {
                let resolution = resolve_hash_groups(prehashed);
                self.apply_resolution(resolution, &AHashMap::new(), &[]);
            }
            self.set_phase(QueuePhase::Ready);
            return Ok(());
        }

        let now = Instant::now();
        let to_hash = pending.len();
        let monitor = OverrunMonitor::new(
            estimate.total_ms,
            scan_started,
            self.ctx.settings.overrun_threshold,
            self.ctx.settings.monitor_poll_interval,
        );
        let worker_cancel = self.cancel.child();
        let batch_id = self.take_batch_id();
        let channel = match self.factory.spawn(worker_cancel.clone()) {
            Ok(channel) => channel,
            Err(e) => {
                self.fail_candidates(&pending, &e);
                self.set_phase(QueuePhase::Error);
                return Err(e.into());
            }
        };

        let active = ActiveBatch {
            batch_id,
            channel,
            worker_cancel,
            pending,
            prehashed,
            checkpoint: AHashMap::new(),
            failed: AHashMap::new(),
            restarts: 0,
            scan_duration,
            hash_started: now,
            last_health_sent: now,
            awaiting_ack: None,
            progress: Some(HashProgress::new(0, to_hash)),
            monitor,
            analysis,
        };
        self.phase = QueuePhase::Hashing;
        self.dispatch(active);
        Ok(())
    }

    /// Drains worker events for up to `timeout`, then publishes. Returns the
    /// phase after processing.
    ///
    /// Events already queued are handled before the health timeout is judged,
    /// so a late poll never mistakes a finished worker for a stuck one.
    pub fn poll(&mut self, timeout: Duration) -> QueuePhase {
        if self.cancel.is_cancelled() && self.phase != QueuePhase::Cancelled {
            self.cancel();
            return self.phase;
        }

        let Some(mut active) = self.active.take() else {
            return self.phase;
        };

        let queued = active.channel.try_recv();
        let mut changed = match self.drain_events(&mut active, queued) {
            Drained::Idle { changed } => changed,
            Drained::Complete { resolution, failed } => {
                self.complete(active, resolution, failed);
                return self.phase;
            }
            Drained::Failed(e) => {
                self.restart(active, e);
                return self.phase;
            }
        };

        let now = Instant::now();
        if let Some((_, sent_at)) = active.awaiting_ack {
            let waited = now.saturating_duration_since(sent_at);
            if waited > self.ctx.settings.health_timeout {
                self.restart(active, WorkerError::Unresponsive { waited });
                return self.phase;
            }
        } else if now.saturating_duration_since(active.last_health_sent)
            >= self.ctx.settings.health_interval
        {
            let nonce = self.next_nonce;
            self.next_nonce += 1;
            if active
                .channel
                .send(WorkerRequest::HealthCheck { nonce })
                .is_ok()
            {
                trace!("Health check {} sent to batch {}", nonce, active.batch_id);
                active.awaiting_ack = Some((nonce, now));
            }
            active.last_health_sent = now;
        }

        let next = active.channel.recv_timeout(timeout);
        match self.drain_events(&mut active, next) {
            Drained::Idle { changed: more } => changed |= more,
            Drained::Complete { resolution, failed } => {
                self.complete(active, resolution, failed);
                return self.phase;
            }
            Drained::Failed(e) => {
                self.restart(active, e);
                return self.phase;
            }
        }

        if let Some(status) = active.monitor.tick(Instant::now()) {
            if status.overdue && !self.overdue {
                warn!(
                    "Processing is {:.1}s past the estimate; cloud-synced files may be downloading",
                    status.overrun_secs
                );
            }
            if status.overdue != self.overdue || status.overrun_secs != self.overrun_secs {
                self.overdue = status.overdue;
                self.overrun_secs = status.overrun_secs;
                changed = true;
            }
        }

        self.active = Some(active);
        if changed {
            self.publish();
        }
        self.phase
    }

    /// Polls until hashing is over, one `tick` at a time.
    pub fn wait_until_settled(&mut self, tick: Duration) -> QueuePhase {
        while self.phase == QueuePhase::Hashing {
            self.poll(tick);
        }
        self.phase
    }

    /// Stops all work now. In-flight worker output is discarded; records keep
    /// whatever hashes were already reported.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        if let Some(active) = self.active.take() {
            self.absorb_checkpoint(&active);
            self.retire(active);
        }
        if self.phase != QueuePhase::Cancelled {
            info!("Queue cancelled in phase {}", self.phase);
            self.set_phase(QueuePhase::Cancelled);
        }
    }

    /// Sends every `Ready` record to `sink`. Each file succeeds or fails on
    /// its own.
    pub fn upload_ready(&mut self, sink: &dyn UploadSink) -> UploadSummary {
        let mut summary = UploadSummary {
            skipped: self
                .entries
                .iter()
                .filter(|e| e.record.status == FileStatus::Duplicate)
                .count(),
            ..UploadSummary::default()
        };
        if self.phase != QueuePhase::Ready {
            warn!("Upload requested in phase {}, nothing to do", self.phase);
            return summary;
        }

        self.set_phase(QueuePhase::Uploading);
        let mut throttle = ProgressThrottle::new(self.ctx.settings.progress_interval);
        let ready_ids: Vec<RecordId> = self
            .entries
            .iter()
            .filter(|e| e.record.status == FileStatus::Ready)
            .map(|e| e.record.id)
            .collect();
        let total = ready_ids.len();

        for (done, id) in ready_ids.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let Some(entry) = self.entry_mut(id) else {
                continue;
            };
            let outcome = match entry.handle.open() {
                Ok(mut reader) => sink.upload(&entry.record, &mut reader),
                Err(e) => Err(UploadError::Read(e)),
            };
            match outcome {
                Ok(()) => {
                    trace!("Uploaded {}", entry.record.path);
                    entry.record.status = FileStatus::Uploaded;
                    entry.record.error = None;
                    summary.uploaded += 1;
                }
                Err(e) => {
                    warn!("Upload of {} failed: {}", entry.record.path, e);
                    entry.record.status = FileStatus::Error;
                    entry.record.error = Some(e.to_string());
                    summary.failed += 1;
                }
            }
            if throttle.should_emit(Instant::now()) {
                self.publish_with_progress(Some(HashProgress::new(done + 1, total)));
            }
        }

        if summary.cancelled {
            info!("Upload cancelled after {} files", summary.uploaded + summary.failed);
            self.set_phase(QueuePhase::Cancelled);
        } else {
            info!(
                "Upload finished: {} uploaded, {} failed, {} duplicates skipped",
                summary.uploaded, summary.failed, summary.skipped
            );
            self.set_phase(QueuePhase::Completed);
        }
        summary
    }

    /// Handles `first` and everything else already queued, stopping at the
    /// batch completion or a broken channel.
    fn drain_events(
        &mut self,
        active: &mut ActiveBatch,
        first: Result<Option<WorkerEvent>, WorkerError>,
    ) -> Drained {
        let mut changed = false;
        let mut next = first;
        loop {
            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => return Drained::Idle { changed },
                Err(e) => return Drained::Failed(e),
            };
            if event.batch_id().is_some_and(|id| id != active.batch_id) {
                self.stats.stale_messages += 1;
                next = active.channel.try_recv();
                continue;
            }
            match event {
                WorkerEvent::Progress {
                    processed,
                    total,
                    percentage,
                    checkpoint,
                    ..
                } => {
                    for hashed in checkpoint {
                        active.checkpoint.insert(hashed.meta.id, hashed.hash);
                    }
                    active.progress = Some(HashProgress {
                        processed,
                        total,
                        percentage,
                    });
                    changed = true;
                }
                WorkerEvent::Error {
                    record_id, message, ..
                } => {
                    active.failed.insert(record_id, message);
                }
                WorkerEvent::HealthAck { nonce, .. } => {
                    if matches!(active.awaiting_ack, Some((expected, _)) if expected == nonce) {
                        active.awaiting_ack = None;
                    }
                }
                WorkerEvent::Complete {
                    resolution, failed, ..
                } => return Drained::Complete { resolution, failed },
            }
            next = active.channel.try_recv();
        }
    }

    fn dispatch(&mut self, active: ActiveBatch) {
        let pending_files: Vec<PendingFile> = active
            .pending
            .iter()
            .filter(|m| !active.checkpoint.contains_key(&m.id) && !active.failed.contains_key(&m.id))
            .filter_map(|meta| {
                self.entries
                    .iter()
                    .find(|e| e.record.id == meta.id)
                    .map(|e| PendingFile {
                        meta: meta.clone(),
                        handle: e.handle.clone(),
                    })
            })
            .collect();
        let mut prehashed = active.prehashed.clone();
        for meta in &active.pending {
            if let Some(hash) = active.checkpoint.get(&meta.id) {
                prehashed.push(HashedCandidate {
                    meta: meta.clone(),
                    hash: hash.clone(),
                });
            }
        }

        info!(
            "Dispatching batch {}: {} to hash, {} prehashed",
            active.batch_id,
            pending_files.len(),
            prehashed.len()
        );
        let request = WorkerRequest::Dispatch(DispatchBatch {
            batch_id: active.batch_id,
            pending: pending_files,
            prehashed,
        });
        match active.channel.send(request) {
            Ok(()) => {
                self.active = Some(active);
                self.publish();
            }
            Err(e) => self.restart(active, e),
        }
    }

    fn complete(&mut self, active: ActiveBatch, resolution: Resolution, failed: Vec<RecordId>) {
        let mut failures = active.failed.clone();
        for id in failed {
            failures
                .entry(id)
                .or_insert_with(|| "failed to hash file".to_string());
        }
        let pending = active.pending.clone();
        let hashing_ms = active.hash_started.elapsed().as_secs_f64() * 1000.0;
        let scanning_ms = active.scan_duration.as_secs_f64() * 1000.0;
        let restarts = active.restarts;
        let analysis = active.analysis.clone();
        shut_down(active);

        self.apply_resolution(resolution, &failures, &pending);
        self.clear_overrun();

        if let Some(estimate) = self.estimate {
            let timings = RunTimings::new(&analysis, &estimate, scanning_ms, hashing_ms, restarts);
            let outcome = self.ctx.calibration.record_sample(timings.h_factor);
            debug!(
                "Calibration sample {:.4} files/ms: {:?}",
                timings.h_factor, outcome
            );
            if outcome == SampleOutcome::Rejected {
                debug!("Run too short or too slow to calibrate from");
            }
            info!(
                "Hashing finished in {:.0} ms (estimated {:.0} ms, accuracy {:.1}%)",
                timings.total_ms, timings.estimated_total_ms, timings.accuracy_percent
            );
            self.timings = Some(timings);
        }
        self.set_phase(QueuePhase::Ready);
    }

    fn restart(&mut self, mut active: ActiveBatch, reason: WorkerError) {
        warn!("Hash worker for batch {} failed: {}", active.batch_id, reason);
        active.worker_cancel.cancel();
        active.channel.terminate();
        active.restarts += 1;

        if active.restarts > self.ctx.settings.max_worker_restarts {
            self.give_up(active, &reason);
            return;
        }

        let worker_cancel = self.cancel.child();
        match self.factory.spawn(worker_cancel.clone()) {
            Ok(channel) => {
                self.stats.worker_restarts += 1;
                let now = Instant::now();
                active.batch_id = self.take_batch_id();
                active.channel = channel;
                active.worker_cancel = worker_cancel;
                active.awaiting_ack = None;
                active.last_health_sent = now;
                self.dispatch(active);
            }
            Err(e) => self.give_up(active, &e),
        }
    }

    /// Too many restarts: what never got hashed is marked as failed, the rest
    /// is resolved with the hashes already reported.
    fn give_up(&mut self, active: ActiveBatch, reason: &WorkerError) {
        warn!(
            "Giving up on batch {} after {} restarts",
            active.batch_id,
            active.restarts.saturating_sub(1)
        );
        let mut failures = active.failed.clone();
        let mut hashed = active.prehashed.clone();
        for meta in &active.pending {
            match active.checkpoint.get(&meta.id) {
                Some(hash) => hashed.push(HashedCandidate {
                    meta: meta.clone(),
                    hash: hash.clone(),
                }),
                None => {
                    failures
                        .entry(meta.id)
                        .or_insert_with(|| format!("hash worker gave up: {}", reason));
                }
            }
        }
        let pending = active.pending.clone();
        shut_down(active);
        self.apply_resolution(resolve_hash_groups(hashed), &failures, &pending);
        self.clear_overrun();
        self.set_phase(QueuePhase::Ready);
    }

    /// Applies one resolution in a single step. Pending records of the batch
    /// that the resolution does not mention become errors.
    fn apply_resolution(
        &mut self,
        resolution: Resolution,
        failures: &AHashMap<RecordId, String>,
        batch: &[CandidateMeta],
    ) {
        let mut seen: AHashSet<RecordId> = AHashSet::new();
        for hashed in resolution.ready {
            seen.insert(hashed.meta.id);
            if let Some(entry) = self.entry_mut(hashed.meta.id) {
                entry.record.content_hash = Some(hashed.hash);
                entry.record.status = FileStatus::Ready;
                entry.record.error = None;
            }
        }
        for hashed in resolution.duplicates {
            seen.insert(hashed.meta.id);
            if let Some(entry) = self.entry_mut(hashed.meta.id) {
                entry.record.content_hash = Some(hashed.hash);
                entry.record.status = FileStatus::Duplicate;
                entry.record.error = None;
            }
        }
        let collapsed: AHashSet<RecordId> = resolution.collapsed.into_iter().collect();
        if !collapsed.is_empty() {
            debug!("Collapsed {} re-selected files", collapsed.len());
            self.entries.retain(|e| !collapsed.contains(&e.record.id));
        }
        seen.extend(collapsed.iter().copied());

        for (id, message) in failures {
            seen.insert(*id);
            if let Some(entry) = self.entry_mut(*id) {
                entry.record.status = FileStatus::Error;
                entry.record.error = Some(message.clone());
            }
        }
        for meta in batch {
            if seen.contains(&meta.id) {
                continue;
            }
            if let Some(entry) = self.entry_mut(meta.id) {
                if entry.record.status == FileStatus::Pending {
                    entry.record.status = FileStatus::Error;
                    entry.record.error = Some("file was not hashed".to_string());
                }
            }
        }
    }

    fn fail_candidates(&mut self, candidates: &[CandidateMeta], reason: &WorkerError) {
        for meta in candidates {
            if let Some(entry) = self.entry_mut(meta.id) {
                entry.record.status = FileStatus::Error;
                entry.record.error = Some(reason.to_string());
            }
        }
    }

    /// Stores reported hashes on the records so a later batch can reuse them.
    fn absorb_checkpoint(&mut self, active: &ActiveBatch) {
        for (id, hash) in &active.checkpoint {
            if let Some(entry) = self.entry_mut(*id) {
                entry.record.content_hash = Some(hash.clone());
            }
        }
    }

    /// Shuts a worker down and counts whatever it still had in flight.
    fn retire(&mut self, mut active: ActiveBatch) {
        active.worker_cancel.cancel();
        while let Ok(Some(_)) = active.channel.try_recv() {
            self.stats.stale_messages += 1;
        }
        active.channel.terminate();
    }

    fn clear_overrun(&mut self) {
        self.overdue = false;
        self.overrun_secs = 0.0;
    }

    fn renew_cancel_token(&mut self) {
        if self.cancel.is_cancelled() {
            self.cancel = CancelToken::new();
        }
    }

    fn take_batch_id(&mut self) -> u64 {
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        id
    }

    fn entry_mut(&mut self, id: RecordId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.record.id == id)
    }

    fn set_phase(&mut self, phase: QueuePhase) {
        if self.phase != phase {
            debug!("Queue phase {} -> {}", self.phase, phase);
        }
        self.phase = phase;
        self.publish();
    }

    fn snapshot(&self) -> QueueEvent {
        QueueEvent {
            phase: self.phase,
            records: self.records(),
            estimate: self.estimate,
            progress: self.active.as_ref().and_then(|a| a.progress),
            overdue: self.overdue,
            overrun_secs: self.overrun_secs,
            worker_restarts: self.stats.worker_restarts,
        }
    }

    fn publish(&mut self) {
        let event = self.snapshot();
        self.send_event(event);
    }

    fn publish_with_progress(&mut self, progress: Option<HashProgress>) {
        let mut event = self.snapshot();
        event.progress = progress;
        self.send_event(event);
    }

    fn send_event(&mut self, event: QueueEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Drop for IntakeQueue {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.worker_cancel.cancel();
            active.channel.terminate();
        }
    }
}

fn shut_down(mut active: ActiveBatch) {
    active.channel.terminate();
}

fn is_groupable(status: FileStatus) -> bool {
    matches!(
        status,
        FileStatus::Pending | FileStatus::Ready | FileStatus::Duplicate
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryFile;
    use crate::worker::ThreadWorkerFactory;
    use std::sync::Arc;

    fn queue() -> IntakeQueue {
        let mut ctx = IntakeContext::in_memory();
        ctx.settings.progress_interval = Duration::from_millis(0);
        IntakeQueue::new(ctx, Box::new(ThreadWorkerFactory::new(Duration::from_millis(0))))
    }

    fn file(name: &str, content: &str, last_modified: i64) -> SharedHandle {
        Arc::new(MemoryFile::new(name, content.as_bytes().to_vec(), last_modified))
    }

    #[test]
    fn test_unique_sizes_ready_without_worker() {
        let mut queue = queue();
        queue
            .add_files(vec![file("a.txt", "1", 1), file("b.txt", "22", 1), file("c.txt", "333", 1)])
            .unwrap();
        assert_eq!(queue.phase(), QueuePhase::Ready);
        assert!(queue
            .records()
            .iter()
            .all(|r| r.status == FileStatus::Ready && r.content_hash.is_none()));
        assert!(queue.estimate().is_some_and(|e| e.phase2_ms == 0.0));
    }

    #[test]
    fn test_non_ingestible_files_skipped() {
        let mut queue = queue();
        queue
            .add_files(vec![file("a.txt", "1", 1), file(".DS_Store", "xx", 1), file("Thumbs.db", "yyy", 1)])
            .unwrap();
        assert_eq!(queue.records().len(), 1);
    }

    #[test]
    fn test_ids_are_stable_and_monotonic() {
        let mut queue = queue();
        queue.add_files(vec![file("a.txt", "1", 1)]).unwrap();
        queue.add_files(vec![file("b.txt", "22", 1)]).unwrap();
        let ids: Vec<u64> = queue.records().iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
        let indexes: Vec<usize> = queue.records().iter().map(|r| r.original_index).collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[test]
    fn test_subscribe_receives_snapshots() {
        let mut queue = queue();
        let events = queue.subscribe();
        queue
            .add_files(vec![file("a.txt", "same", 1), file("b.txt", "same", 2)])
            .unwrap();
        queue.wait_until_settled(Duration::from_millis(20));

        let phases: Vec<QueuePhase> = events.try_iter().map(|e| e.phase).collect();
        assert_eq!(phases.first(), Some(&QueuePhase::Idle));
        assert!(phases.contains(&QueuePhase::Scanning));
        assert!(phases.contains(&QueuePhase::Hashing));
        assert_eq!(phases.last(), Some(&QueuePhase::Ready));
    }

    #[test]
    fn test_clear_resets_to_idle() {
        let mut queue = queue();
        queue.add_files(vec![file("a.txt", "1", 1)]).unwrap();
        queue.clear();
        assert_eq!(queue.phase(), QueuePhase::Idle);
        assert!(queue.records().is_empty());
        assert!(queue.estimate().is_none());
    }

    #[test]
    fn test_cancel_from_token_is_seen_by_poll() {
        let mut queue = queue();
        queue.add_files(vec![file("a.txt", "1", 1)]).unwrap();
        queue.cancel_token().cancel();
        assert_eq!(queue.poll(Duration::from_millis(1)), QueuePhase::Cancelled);
    }
}
