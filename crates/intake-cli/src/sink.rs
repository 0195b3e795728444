use intake_core::error::UploadError;
use intake_core::source::hash_reader;
use intake_core::{FileRecord, UploadSink};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Copies files into a directory named by content hash, keeping the
/// extension. Uploading the same content twice is a no-op.
pub struct DirectorySink {
    dest: PathBuf,
}

impl DirectorySink {
    pub fn new(dest: &Path) -> io::Result<Self> {
        fs::create_dir_all(dest)?;
        Ok(Self {
            dest: dest.to_path_buf(),
        })
    }

    fn target_path(&self, hash: &str, record: &FileRecord) -> PathBuf {
        let extension = Path::new(record.file_name())
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        let name = match extension {
            Some(ext) if !ext.is_empty() => format!("{}.{}", hash, ext),
            _ => hash.to_string(),
        };
        self.dest.join(&hash[..2.min(hash.len())]).join(name)
    }
}

impl DirectorySink {
    fn store(&self, record: &FileRecord, content: &mut dyn Read, staging: &Path) -> Result<(), UploadError> {
        {
            let mut out = File::create(staging)?;
            io::copy(content, &mut out).map_err(UploadError::Read)?;
        }

        // Files with a unique size were never hashed by the queue.
        let hash = match &record.content_hash {
            Some(hash) => hash.as_str().to_string(),
            None => {
                let mut staged = File::open(staging)?;
                hash_reader(&mut staged)?.0
            }
        };

        let target = self.target_path(&hash, record);
        if target.exists() {
            debug!("{} already stored as {}", record.path, target.display());
            fs::remove_file(staging)?;
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(staging, &target)?;
        debug!("Stored {} as {}", record.path, target.display());
        Ok(())
    }
}

impl UploadSink for DirectorySink {
    fn upload(&self, record: &FileRecord, content: &mut dyn Read) -> Result<(), UploadError> {
        let staging = self.dest.join(format!(".upload-{}.part", record.id.0));
        let result = self.store(record, content, &staging);
        if result.is_err() && staging.exists() {
            if let Err(e) = fs::remove_file(&staging) {
                warn!("Could not remove {}: {}", staging.display(), e);
            }
        }
        result
    }
}
