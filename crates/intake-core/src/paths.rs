//! Directory statistics for a file selection.
//!
//! The estimator needs these aggregates before it runs, so they are produced
//! in one pass that splits each path exactly once.

use ahash::AHashSet;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DirectoryStats {
    pub file_count: usize,
    /// Unique parent prefixes, including every ancestor. Files without a
    /// folder all live in one implicit root.
    pub directory_count: usize,
    pub avg_depth: f64,
    pub max_depth: usize,
}

pub fn analyze_paths<'a, I>(paths: I) -> DirectoryStats
where
    I: IntoIterator<Item = &'a str>,
{
    let mut directories: AHashSet<&'a str> = AHashSet::new();
    let mut has_root_files = false;
    let mut file_count = 0usize;
    let mut depth_sum = 0usize;
    let mut max_depth = 0usize;

    for path in paths {
        file_count += 1;
        let mut depth = 0usize;
        for (idx, byte) in path.bytes().enumerate() {
            if byte == b'/' {
                depth += 1;
                directories.insert(&path[..idx]);
            }
        }
        if depth == 0 {
            has_root_files = true;
        }
        depth_sum += depth;
        max_depth = max_depth.max(depth);
    }

    if file_count == 0 {
        return DirectoryStats::default();
    }

    DirectoryStats {
        file_count,
        directory_count: directories.len() + usize::from(has_root_files),
        avg_depth: depth_sum as f64 / file_count as f64,
        max_depth,
    }
}

/// Forward slashes, no leading `./` or `/`, no empty segments.
pub fn normalize_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
