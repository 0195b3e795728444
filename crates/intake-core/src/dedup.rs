//! Duplicate detection.
//!
//! Files are first bucketed by byte size; only sizes shared by two or more
//! files are worth hashing. After hashing, each hash group is split by
//! metadata signature (file name, size, last-modified). Records sharing a
//! signature are assumed to be the same file picked twice and collapse to one.
//! This is a heuristic: two distinct files with the same name, size and
//! modification time in different folders will also collapse.
//!
//! When a hash group holds several distinct signatures the content really was
//! stored more than once, and exactly one keeper stays `Ready`.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::model::{CandidateMeta, ContentHash, HashedCandidate, RecordId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizePartition {
    /// Sizes seen exactly once. Ready without hashing.
    pub unique: Vec<CandidateMeta>,
    /// Sizes seen more than once, sorted by original index.
    pub candidates: Vec<CandidateMeta>,
}

impl SizePartition {
    pub fn candidate_bytes(&self) -> u64 {
        self.candidates.iter().map(|c| c.size).sum()
    }

    pub fn unique_bytes(&self) -> u64 {
        self.unique.iter().map(|c| c.size).sum()
    }
}

pub fn partition_by_size(records: &[CandidateMeta]) -> SizePartition {
    let mut counts: AHashMap<u64, usize> = AHashMap::with_capacity(records.len());
    for record in records {
        *counts.entry(record.size).or_insert(0) += 1;
    }

    let mut partition = SizePartition::default();
    for record in records {
        if counts.get(&record.size).copied().unwrap_or(0) > 1 {
            partition.candidates.push(record.clone());
        } else {
            partition.unique.push(record.clone());
        }
    }
    partition.unique.sort_by_key(|c| c.original_index);
    partition.candidates.sort_by_key(|c| c.original_index);
    partition
}

/// Outcome of resolving hashed candidates. Every input lands in exactly one
/// of the three lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub ready: Vec<HashedCandidate>,
    pub duplicates: Vec<HashedCandidate>,
    /// Same file selected again; removed from the queue without a flag.
    pub collapsed: Vec<RecordId>,
}

pub fn metadata_signature(meta: &CandidateMeta) -> String {
    format!("{}|{}|{}", meta.file_name(), meta.size, meta.last_modified)
}

pub fn resolve_hash_groups(hashed: Vec<HashedCandidate>) -> Resolution {
    let mut groups: AHashMap<ContentHash, Vec<HashedCandidate>> = AHashMap::new();
    for candidate in hashed {
        groups
            .entry(candidate.hash.clone())
            .or_default()
            .push(candidate);
    }

    let mut resolution = Resolution::default();
    for (_, mut group) in groups {
        group.sort_by_key(|c| c.meta.original_index);
        if group.len() == 1 {
            resolution.ready.extend(group);
            continue;
        }

        // Signature subgroups keep first-seen order; the first member of each
        // has the smallest original index and represents it.
        let mut subgroups: Vec<(String, Vec<HashedCandidate>)> = Vec::new();
        for candidate in group {
            let signature = metadata_signature(&candidate.meta);
            match subgroups.iter_mut().find(|(s, _)| *s == signature) {
                Some((_, members)) => members.push(candidate),
                None => subgroups.push((signature, vec![candidate])),
            }
        }

        let mut representatives = Vec::with_capacity(subgroups.len());
        for (_, members) in subgroups {
            let mut members = members.into_iter();
            if let Some(representative) = members.next() {
                representatives.push(representative);
            }
            resolution.collapsed.extend(members.map(|m| m.meta.id));
        }

        if representatives.len() == 1 {
            resolution.ready.extend(representatives);
            continue;
        }

        let keeper_idx = choose_keeper(&representatives);
        for (idx, representative) in representatives.into_iter().enumerate() {
            if Some(idx) == keeper_idx {
                resolution.ready.push(representative);
            } else {
                resolution.duplicates.push(representative);
            }
        }
    }

    resolution.ready.sort_by_key(|c| c.meta.original_index);
    resolution.duplicates.sort_by_key(|c| c.meta.original_index);
    resolution.collapsed.sort();
    resolution
}

/// Orders two candidates so that the better keeper sorts first.
///
/// Earliest modification wins, then the deeper folder (longest directory
/// prefix), then the shorter name, then the lexicographically smaller name,
/// and finally ingestion order.
pub fn compare_keeper(a: &CandidateMeta, b: &CandidateMeta) -> Ordering {
    a.last_modified
        .cmp(&b.last_modified)
        .then_with(|| b.directory_prefix().len().cmp(&a.directory_prefix().len()))
        .then_with(|| {
            let (a_len, b_len) = (a.file_name().chars().count(), b.file_name().chars().count());
            a_len.cmp(&b_len)
        })
        .then_with(|| a.file_name().cmp(b.file_name()))
        .then_with(|| a.original_index.cmp(&b.original_index))
}

/// Index of the keeper among `candidates`, `None` when empty.
pub fn choose_keeper(candidates: &[HashedCandidate]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| compare_keeper(&a.meta, &b.meta))
        .map(|(idx, _)| idx)
}
