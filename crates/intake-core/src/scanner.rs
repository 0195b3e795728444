use glob::Pattern;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use walkdir::WalkDir;

use crate::error::Error;
use crate::source::{is_ingestible, DiskFile};

/// Walks a dropped folder into file handles, the way a browser folder picker
/// would hand them over: relative paths start with the folder's own name and
/// hidden, system and temp files are left out. Symlinks are not followed.
pub fn collect_files(root: &Path, ignore_globs: &[String]) -> Result<Vec<DiskFile>, Error> {
    let root_metadata = fs::metadata(root).map_err(|source| Error::Enumeration {
        path: root.to_path_buf(),
        source,
    })?;
    if !root_metadata.is_dir() {
        return Err(Error::Enumeration {
            path: root.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        });
    }

    let ignore_patterns = compile_patterns(ignore_globs);
    let base = root.parent().unwrap_or(root).to_path_buf();
    let root_is_base = base == root;

    let mut paths: Vec<PathBuf> = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_ignored(entry.path(), &ignore_patterns));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().map(|e| e.kind()) == Some(io::ErrorKind::PermissionDenied) {
                    error!("Access denied while scanning: {}", err);
                } else {
                    warn!("Skipping unreadable entry: {}", err);
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !is_ingestible(&name) {
            continue;
        }
        paths.push(entry.into_path());
    }

    let files: Vec<DiskFile> = paths
        .par_iter()
        .filter_map(|path| {
            let metadata = match fs::metadata(path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!("Error getting metadata for {}: {}", path.display(), err);
                    return None;
                }
            };
            let last_modified = metadata
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
                .unwrap_or(0);
            let relative = if root_is_base {
                path.strip_prefix(root).ok()
            } else {
                path.strip_prefix(&base).ok()
            };
            let relative_path = relative.map(to_slash_path);
            Some(DiskFile::new(
                path.clone(),
                relative_path,
                metadata.len(),
                last_modified,
            ))
        })
        .collect();

    debug!("Collected {} files under {}", files.len(), root.display());
    Ok(files)
}

fn compile_patterns(globs: &[String]) -> Vec<Pattern> {
    globs
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect()
}

/// A pattern matches either the full path or just the entry name.
fn is_ignored(path: &Path, patterns: &[Pattern]) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy());
    patterns.iter().any(|pattern| {
        pattern.matches_path(path) || name.as_deref().is_some_and(|n| pattern.matches(n))
    })
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
