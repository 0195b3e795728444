use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use intake_core::estimate::{Estimator, EstimatorCoefficients};
use intake_core::{
    FileHandle, FileStatus, IntakeContext, IntakeQueue, MemoryFile, QueuePhase, SharedHandle,
    ThreadWorkerFactory,
};

const TICK: Duration = Duration::from_millis(20);

/// How a test file misbehaves when opened.
enum Behavior {
    /// Blocks until the gate is released.
    Gated(Receiver<()>),
    PanicOnce(AtomicBool),
    PanicAlways,
    SlowOnce(AtomicBool, Duration),
    Unreadable,
    Normal,
}

struct TestFile {
    name: String,
    content: Vec<u8>,
    last_modified: i64,
    opens: AtomicUsize,
    behavior: Behavior,
}

impl TestFile {
    fn new(name: &str, content: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            content: content.as_bytes().to_vec(),
            last_modified: 1_000,
            opens: AtomicUsize::new(0),
            behavior,
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl FileHandle for TestFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.content.len() as u64
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
    }

    fn relative_path(&self) -> Option<&str> {
        None
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Gated(gate) => {
                let _ = gate.recv_timeout(Duration::from_secs(5));
            }
            Behavior::PanicOnce(fired) => {
                if !fired.swap(true, Ordering::SeqCst) {
                    panic!("simulated worker crash");
                }
            }
            Behavior::PanicAlways => panic!("simulated worker crash"),
            Behavior::SlowOnce(fired, delay) => {
                if !fired.swap(true, Ordering::SeqCst) {
                    thread::sleep(*delay);
                }
            }
            Behavior::Unreadable => {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
            }
            Behavior::Normal => {}
        }
        Ok(Box::new(Cursor::new(&self.content[..])))
    }
}

fn queue_with(configure: impl FnOnce(&mut IntakeContext)) -> IntakeQueue {
    let mut ctx = IntakeContext::in_memory();
    ctx.settings.progress_interval = Duration::ZERO;
    configure(&mut ctx);
    IntakeQueue::new(ctx, Box::new(ThreadWorkerFactory::new(Duration::ZERO)))
}

fn settle_within(queue: &mut IntakeQueue, limit: Duration) -> QueuePhase {
    let deadline = Instant::now() + limit;
    while queue.phase() == QueuePhase::Hashing && Instant::now() < deadline {
        queue.poll(TICK);
    }
    queue.phase()
}

fn gate() -> (Sender<()>, Receiver<()>) {
    bounded(1)
}

#[test]
fn test_cancel_mid_hash_discards_results() {
    let (release, wait) = gate();
    let blocked = TestFile::new("a.txt", "same", Behavior::Gated(wait));
    let second = TestFile::new("b.txt", "same", Behavior::Normal);
    let mut queue = queue_with(|_| {});
    queue
        .add_files(vec![blocked.clone() as SharedHandle, second.clone() as SharedHandle])
        .unwrap();
    assert_eq!(queue.phase(), QueuePhase::Hashing);

    // Give the worker time to reach the gated file.
    let deadline = Instant::now() + Duration::from_secs(2);
    while blocked.opens() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    queue.cancel();
    assert_eq!(queue.phase(), QueuePhase::Cancelled);
    let _ = release.send(());

    thread::sleep(Duration::from_millis(100));
    assert_eq!(queue.poll(TICK), QueuePhase::Cancelled);
    let records = queue.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == FileStatus::Pending));
    assert_eq!(second.opens(), 0);
}

#[test]
fn test_cancel_halfway_keeps_reported_hashes() {
    let (release, wait) = gate();
    let a = TestFile::new("a.txt", "same", Behavior::Normal);
    let b = TestFile::new("b.txt", "diff", Behavior::Normal);
    let c = TestFile::new("c.txt", "same", Behavior::Gated(wait));
    let d = TestFile::new("d.txt", "more", Behavior::Normal);
    let mut queue = queue_with(|_| {});
    let events = queue.subscribe();
    queue
        .add_files(vec![
            a as SharedHandle,
            b as SharedHandle,
            c.clone() as SharedHandle,
            d.clone() as SharedHandle,
        ])
        .unwrap();

    // Wait until the first two hashes have been reported.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut reported = 0;
    while reported < 2 && Instant::now() < deadline {
        queue.poll(TICK);
        for event in events.try_iter() {
            if let Some(progress) = event.progress {
                reported = reported.max(progress.processed);
            }
        }
    }
    assert_eq!(reported, 2);
    while c.opens() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    queue.cancel();
    let _ = release.send(());
    assert_eq!(queue.phase(), QueuePhase::Cancelled);

    let records = queue.records();
    assert!(records.iter().all(|r| r.status == FileStatus::Pending));
    let hashed: Vec<&str> = records
        .iter()
        .filter(|r| r.content_hash.is_some())
        .map(|r| r.path.as_str())
        .collect();
    assert_eq!(hashed, vec!["a.txt", "b.txt"]);
    assert_eq!(d.opens(), 0);
}

#[test]
fn test_late_poll_does_not_restart_finished_worker() {
    let mut queue = queue_with(|ctx| {
        ctx.settings.health_interval = Duration::ZERO;
        ctx.settings.health_timeout = Duration::from_millis(50);
        ctx.settings.max_worker_restarts = 0;
    });
    queue
        .add_files(vec![
            Arc::new(MemoryFile::new("a.txt", b"same".to_vec(), 1)) as SharedHandle,
            Arc::new(MemoryFile::new("b.txt", b"same".to_vec(), 2)) as SharedHandle,
            Arc::new(MemoryFile::new("c.txt", b"diff".to_vec(), 1)) as SharedHandle,
        ])
        .unwrap();

    // Sends a health check, then stays away far longer than the timeout.
    queue.poll(Duration::ZERO);
    thread::sleep(Duration::from_millis(300));

    assert_eq!(queue.poll(Duration::ZERO), QueuePhase::Ready);
    assert_eq!(queue.stats().worker_restarts, 0);
    let counts = queue.counts();
    assert_eq!(counts.error, 0);
    assert_eq!(counts.ready, 2);
    assert_eq!(counts.duplicate, 1);
}

#[test]
fn test_overrun_reaches_subscribers() {
    let (release, wait) = gate();
    let instant_estimate = EstimatorCoefficients {
        phase1_base_ms: 0.0,
        phase1_file_ms: 0.0,
        phase1_depth_ms: 0.0,
        phase1_dir_ms: 0.0,
        phase2_base_ms: 0.0,
        phase2_candidate_ms: 0.0,
        phase2_mb_ms: 0.0,
        phase3_base_ms: 0.0,
        phase3_file_ms: 0.0,
        phase3_depth_ms: 0.0,
        phase3_dir_ms: 0.0,
        ..EstimatorCoefficients::default()
    };
    let mut queue = queue_with(|ctx| {
        ctx.estimator = Estimator::new(instant_estimate);
        ctx.settings.monitor_poll_interval = Duration::ZERO;
    });
    let events = queue.subscribe();
    queue
        .add_files(vec![
            TestFile::new("a.txt", "same", Behavior::Gated(wait)) as SharedHandle,
            TestFile::new("b.txt", "same", Behavior::Normal) as SharedHandle,
        ])
        .unwrap();

    thread::sleep(Duration::from_millis(50));
    queue.poll(TICK);
    let _ = release.send(());
    assert_eq!(settle_within(&mut queue, Duration::from_secs(5)), QueuePhase::Ready);

    let snapshots: Vec<_> = events.try_iter().collect();
    assert!(snapshots
        .iter()
        .any(|e| e.phase == QueuePhase::Hashing && e.overdue && e.overrun_secs > 0.0));
    let last = snapshots.last().unwrap();
    assert_eq!(last.phase, QueuePhase::Ready);
    assert!(!last.overdue);
    assert_eq!(last.overrun_secs, 0.0);
}

#[test]
fn test_cancelled_queue_can_be_reused() {
    let mut queue = queue_with(|_| {});
    queue
        .add_files(vec![
            TestFile::new("a.txt", "same", Behavior::Normal) as SharedHandle,
            TestFile::new("b.txt", "same", Behavior::Normal) as SharedHandle,
        ])
        .unwrap();
    queue.cancel();
    assert_eq!(queue.phase(), QueuePhase::Cancelled);

    queue
        .add_files(vec![TestFile::new("c.txt", "zz", Behavior::Normal) as SharedHandle])
        .unwrap();
    assert_eq!(settle_within(&mut queue, Duration::from_secs(5)), QueuePhase::Ready);
    let counts = queue.counts();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.ready + counts.duplicate, 3);
}

#[test]
fn test_crashed_worker_is_restarted() {
    let first = TestFile::new("first.txt", "same", Behavior::Normal);
    let crashing = TestFile::new("crash.txt", "same", Behavior::PanicOnce(AtomicBool::new(false)));
    let mut queue = queue_with(|_| {});
    queue
        .add_files(vec![first.clone() as SharedHandle, crashing.clone() as SharedHandle])
        .unwrap();

    assert_eq!(settle_within(&mut queue, Duration::from_secs(5)), QueuePhase::Ready);
    assert_eq!(queue.stats().worker_restarts, 1);
    // The hash reported before the crash is reused, not recomputed.
    assert_eq!(first.opens(), 1);
    assert_eq!(crashing.opens(), 2);

    let counts = queue.counts();
    assert_eq!(counts.ready, 1);
    assert_eq!(counts.duplicate, 1);
    assert_eq!(counts.error, 0);
}

#[test]
fn test_unresponsive_worker_is_replaced() {
    let slow = TestFile::new(
        "slow.txt",
        "same",
        Behavior::SlowOnce(AtomicBool::new(false), Duration::from_millis(1_500)),
    );
    let other = TestFile::new("other.txt", "same", Behavior::Normal);
    let mut queue = queue_with(|ctx| {
        ctx.settings.health_interval = Duration::from_millis(20);
        ctx.settings.health_timeout = Duration::from_millis(200);
    });
    queue
        .add_files(vec![slow.clone() as SharedHandle, other.clone() as SharedHandle])
        .unwrap();

    let started = Instant::now();
    assert_eq!(settle_within(&mut queue, Duration::from_secs(5)), QueuePhase::Ready);
    assert!(queue.stats().worker_restarts >= 1);
    // Finished without waiting for the stuck read.
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(queue.counts().ready, 1);
    assert_eq!(queue.counts().duplicate, 1);
}

#[test]
fn test_restart_limit_marks_remaining_as_errors() {
    let a = TestFile::new("a.txt", "same", Behavior::Normal);
    let b = TestFile::new("b.txt", "same", Behavior::Normal);
    let doomed = TestFile::new("doomed.txt", "same", Behavior::PanicAlways);
    let mut queue = queue_with(|ctx| ctx.settings.max_worker_restarts = 2);
    queue
        .add_files(vec![
            a.clone() as SharedHandle,
            b.clone() as SharedHandle,
            doomed.clone() as SharedHandle,
        ])
        .unwrap();

    assert_eq!(settle_within(&mut queue, Duration::from_secs(5)), QueuePhase::Ready);
    assert_eq!(queue.stats().worker_restarts, 2);
    assert_eq!(doomed.opens(), 3);

    let records = queue.records();
    let doomed_record = records.iter().find(|r| r.path == "doomed.txt").unwrap();
    assert_eq!(doomed_record.status, FileStatus::Error);
    assert!(doomed_record.error.as_deref().unwrap_or("").contains("gave up"));
    assert_eq!(queue.counts().ready, 1);
    assert_eq!(queue.counts().duplicate, 1);
}

#[test]
fn test_unreadable_file_does_not_stop_batch() {
    let locked = TestFile::new("locked.txt", "same", Behavior::Unreadable);
    let mut queue = queue_with(|_| {});
    queue
        .add_files(vec![
            locked as SharedHandle,
            Arc::new(MemoryFile::new("b.txt", b"same".to_vec(), 1)) as SharedHandle,
            Arc::new(MemoryFile::new("c.txt", b"diff".to_vec(), 1)) as SharedHandle,
        ])
        .unwrap();

    assert_eq!(settle_within(&mut queue, Duration::from_secs(5)), QueuePhase::Ready);
    let records = queue.records();
    let locked = records.iter().find(|r| r.path == "locked.txt").unwrap();
    assert_eq!(locked.status, FileStatus::Error);
    assert!(locked.error.as_deref().unwrap_or("").contains("locked"));
    assert!(locked.content_hash.is_none());
    assert_eq!(queue.counts().ready, 2);
    assert_eq!(queue.stats().worker_restarts, 0);
}
