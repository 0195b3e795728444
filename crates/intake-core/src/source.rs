//! File source boundary.
//!
//! The queue never touches the filesystem directly. Everything it knows about
//! a selected file comes through [`FileHandle`], which a folder scanner, a
//! test fixture or any other selection primitive can implement.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::model::ContentHash;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Names a browser file picker never hands over, so neither do we.
const SYSTEM_FILE_NAMES: &[&str] = &["thumbs.db", "desktop.ini", ".ds_store"];

pub trait FileHandle: Send + Sync {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    /// Milliseconds since the Unix epoch.
    fn last_modified(&self) -> i64;
    /// Folder-aware path relative to the dropped root, when there is one.
    fn relative_path(&self) -> Option<&str>;
    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>>;

    fn read_all_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.size() as usize);
        self.open()?.read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

pub type SharedHandle = Arc<dyn FileHandle>;

/// A file on local disk, stat'ed once at scan time.
#[derive(Debug, Clone)]
pub struct DiskFile {
    path: PathBuf,
    name: String,
    relative_path: Option<String>,
    size: u64,
    last_modified: i64,
}

impl DiskFile {
    pub fn new(
        path: PathBuf,
        relative_path: Option<String>,
        size: u64,
        last_modified: i64,
    ) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            name,
            relative_path,
            size,
            last_modified,
        }
    }

    /// Builds a handle for a single file, reading its metadata now.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let last_modified = metadata
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        Ok(Self::new(path.to_path_buf(), None, metadata.len(), last_modified))
    }
}

impl FileHandle for DiskFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
    }

    fn relative_path(&self) -> Option<&str> {
        self.relative_path.as_deref()
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

/// In-memory file, used for fixtures and for callers that already hold bytes.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    relative_path: Option<String>,
    last_modified: i64,
    content: Arc<[u8]>,
}

impl MemoryFile {
    pub fn new(name: &str, content: impl Into<Vec<u8>>, last_modified: i64) -> Self {
        Self {
            name: name.to_string(),
            relative_path: None,
            last_modified,
            content: Arc::from(content.into()),
        }
    }

    pub fn with_relative_path(mut self, relative_path: &str) -> Self {
        self.relative_path = Some(relative_path.to_string());
        self
    }
}

impl FileHandle for MemoryFile {
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
        self.relative_path.as_deref()
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(io::Cursor::new(&self.content[..])))
    }
}

/// Streams `reader` through SHA-256.
pub fn hash_reader(reader: &mut dyn Read) -> io::Result<ContentHash> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

pub fn hash_handle(handle: &dyn FileHandle) -> io::Result<ContentHash> {
    let mut reader = handle.open()?;
    hash_reader(&mut reader)
}

/// Whether a file would be delivered by a browser picker: hidden, system and
/// temp files are not.
pub fn is_ingestible(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    if lower.is_empty() || lower.starts_with('.') || lower.starts_with('~') {
        return false;
    }
    if lower.ends_with(".tmp") {
        return false;
    }
    !SYSTEM_FILE_NAMES.contains(&lower.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_known_vector() {
        let file = MemoryFile::new("abc.txt", b"abc".to_vec(), 0);
        let hash = hash_handle(&file).unwrap();
        assert_eq!(
            hash.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_is_ingestible() {
        assert!(is_ingestible("invoice.pdf"));
        assert!(!is_ingestible(".hidden"));
        assert!(!is_ingestible("Thumbs.db"));
        assert!(!is_ingestible("desktop.ini"));
        assert!(!is_ingestible(".DS_Store"));
        assert!(!is_ingestible("~$report.docx"));
        assert!(!is_ingestible("upload.TMP"));
    }

    #[test]
    fn test_disk_file_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello").unwrap();
        let file = DiskFile::from_path(&path).unwrap();
        assert_eq!(file.name(), "a.txt");
        assert_eq!(file.size(), 5);
        assert!(file.last_modified() > 0);
        assert_eq!(file.read_all_bytes().unwrap(), b"hello");
    }
}
