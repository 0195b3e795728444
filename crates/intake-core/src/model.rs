use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier handed out by the queue when a file is ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lowercase hex SHA-256 digest of a file's full content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Waiting on the hash worker.
    Pending,
    Ready,
    /// Same content as the keeper of its hash group.
    Duplicate,
    Error,
    /// Accepted by the upload sink.
    Uploaded,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FileStatus::Pending => "pending",
            FileStatus::Ready => "ready",
            FileStatus::Duplicate => "duplicate",
            FileStatus::Error => "error",
            FileStatus::Uploaded => "uploaded",
        };
        f.write_str(label)
    }
}

/// One user-selected file in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: RecordId,
    /// Normalized relative path, or the bare file name without folder context.
    pub path: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
    pub content_hash: Option<ContentHash>,
    pub status: FileStatus,
    pub original_index: usize,
    pub error: Option<String>,
}

impl FileRecord {
    pub fn file_name(&self) -> &str {
        split_file_name(&self.path).1
    }

    pub fn directory_prefix(&self) -> &str {
        split_file_name(&self.path).0
    }

    pub fn meta(&self) -> CandidateMeta {
        CandidateMeta {
            id: self.id,
            path: self.path.clone(),
            size: self.size,
            last_modified: self.last_modified,
            original_index: self.original_index,
        }
    }
}

/// The subset of a record the grouper and the worker need. Serializable so it
/// can cross the worker boundary, unlike file handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMeta {
    pub id: RecordId,
    pub path: String,
    pub size: u64,
    pub last_modified: i64,
    pub original_index: usize,
}

impl CandidateMeta {
    pub fn file_name(&self) -> &str {
        split_file_name(&self.path).1
    }

    pub fn directory_prefix(&self) -> &str {
        split_file_name(&self.path).0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedCandidate {
    pub meta: CandidateMeta,
    pub hash: ContentHash,
}

/// Splits `dir/sub/name.ext` into (`dir/sub`, `name.ext`).
pub(crate) fn split_file_name(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}
