use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use intake_core::error::UploadError;
use intake_core::{
    FileRecord, FileStatus, IntakeContext, IntakeQueue, MemoryFile, QueuePhase, SharedHandle,
    ThreadWorkerFactory, UploadSink,
};

#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<(String, Vec<u8>)>>,
    reject: Vec<String>,
}

impl UploadSink for RecordingSink {
    fn upload(&self, record: &FileRecord, content: &mut dyn Read) -> Result<(), UploadError> {
        if self.reject.iter().any(|name| name == record.file_name()) {
            return Err(UploadError::Rejected("quota exceeded".to_string()));
        }
        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes).map_err(UploadError::Read)?;
        if let Ok(mut received) = self.received.lock() {
            received.push((record.path.clone(), bytes));
        }
        Ok(())
    }
}

fn ready_queue(files: Vec<(&str, &str, i64)>) -> IntakeQueue {
    let mut ctx = IntakeContext::in_memory();
    ctx.settings.progress_interval = Duration::ZERO;
    let mut queue = IntakeQueue::new(ctx, Box::new(ThreadWorkerFactory::new(Duration::ZERO)));
    let handles: Vec<SharedHandle> = files
        .into_iter()
        .map(|(name, content, modified)| {
            Arc::new(MemoryFile::new(name, content.as_bytes().to_vec(), modified)) as SharedHandle
        })
        .collect();
    queue.add_files(handles).unwrap();
    assert_eq!(queue.wait_until_settled(Duration::from_millis(20)), QueuePhase::Ready);
    queue
}

#[test]
fn test_uploads_ready_and_skips_duplicates() {
    let mut queue = ready_queue(vec![
        ("a.txt", "same", 1),
        ("b.txt", "same", 2),
        ("c.txt", "unique!", 1),
    ]);
    let sink = RecordingSink::default();
    let summary = queue.upload_ready(&sink);

    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 1);
    assert!(!summary.cancelled);
    assert_eq!(queue.phase(), QueuePhase::Completed);

    let received = sink.received.lock().unwrap();
    let paths: Vec<&str> = received.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "c.txt"]);
    assert_eq!(received[1].1, b"unique!");

    let counts = queue.counts();
    assert_eq!(counts.uploaded, 2);
    assert_eq!(counts.duplicate, 1);
}

#[test]
fn test_each_upload_fails_independently() {
    let mut queue = ready_queue(vec![("a.txt", "1", 1), ("b.txt", "22", 1), ("c.txt", "333", 1)]);
    let sink = RecordingSink {
        reject: vec!["b.txt".to_string()],
        ..RecordingSink::default()
    };
    let summary = queue.upload_ready(&sink);

    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.failed, 1);
    let records = queue.records();
    let rejected = records.iter().find(|r| r.path == "b.txt").unwrap();
    assert_eq!(rejected.status, FileStatus::Error);
    assert!(rejected.error.as_deref().unwrap_or("").contains("quota exceeded"));
    assert_eq!(queue.phase(), QueuePhase::Completed);
}

#[test]
fn test_upload_requires_ready_phase() {
    let mut queue = IntakeQueue::new(
        IntakeContext::in_memory(),
        Box::new(ThreadWorkerFactory::default()),
    );
    let summary = queue.upload_ready(&RecordingSink::default());
    assert_eq!(summary.uploaded, 0);
    assert_eq!(queue.phase(), QueuePhase::Idle);
}

#[test]
fn test_cancelled_upload_stops() {
    let mut queue = ready_queue(vec![("a.txt", "1", 1), ("b.txt", "22", 1)]);
    queue.cancel_token().cancel();
    let summary = queue.upload_ready(&RecordingSink::default());
    assert!(summary.cancelled);
    assert_eq!(summary.uploaded, 0);
    assert_eq!(queue.phase(), QueuePhase::Cancelled);
    assert!(queue
        .records()
        .iter()
        .all(|r| r.status == FileStatus::Ready));
}
