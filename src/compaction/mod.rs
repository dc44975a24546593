//! Compaction mechanism: merge a set of input SSTables into the next
//! level, deduplicating keys and dropping spent tombstones (§12).
//!
//! This module provides the mechanism only. *When* to compact, and
//! which tables to pick, is a scheduling policy left to the embedding
//! application — [`compact`] just executes whatever `input_ids` it is
//! given against `target_level` and commits the result.
//!
//! Dedup keeps the entry with the highest seqno for each key. A
//! tombstone is dropped from the output only when `target_level` is the
//! bottommost level among all currently live tables, since at any
//! higher level an older, lower-level table might still hold a value
//! the tombstone needs to shadow.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::block::BlockEntry;
use crate::error::ErrorKind;
use crate::manifest::{Manifest, ManifestError, SstableEntry};
use crate::sstable::{SSTable, SstWriter, SstableError};

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("sstable error: {0}")]
    Sstable(#[from] SstableError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("compaction input id {0} is not a live SSTable")]
    UnknownInput(u64),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl CompactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompactionError::Sstable(e) => e.kind(),
            CompactionError::Manifest(e) => e.kind(),
            CompactionError::Io(_) => ErrorKind::Io,
            CompactionError::UnknownInput(_) => ErrorKind::InvalidArgument,
            CompactionError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Outcome of a single compaction run.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub removed_ids: Vec<u64>,
    pub new_sstable_id: u64,
    pub new_path: PathBuf,
    pub entries_written: usize,
    pub tombstones_dropped: usize,
}

/// Merges the SSTables named by `input_ids` plus any level-`target_level`
/// tables overlapping their combined key range, writes a single output
/// SSTable at `target_level`, and atomically swaps the manifest.
///
/// `is_bottommost` tells the merge whether `target_level` is the last
/// level containing any data for the affected key range; only then are
/// tombstones eligible to be dropped rather than carried forward.
pub fn compact(
    data_dir: impl AsRef<Path>,
    manifest: &Manifest,
    input_ids: &[u64],
    target_level: u8,
    bloom_fpr: f64,
    block_size: usize,
    is_bottommost: bool,
) -> Result<CompactionOutcome, CompactionError> {
    let data_dir = data_dir.as_ref();
    let live = manifest.live_sstables();

    let mut inputs: Vec<SstableEntry> = Vec::new();
    for &id in input_ids {
        let entry = live
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(CompactionError::UnknownInput(id))?;
        inputs.push(entry);
    }

    let min_key = inputs.iter().map(|e| e.min_key.clone()).min().unwrap_or_default();
    let max_key = inputs.iter().map(|e| e.max_key.clone()).max().unwrap_or_default();

    let overlapping_at_target: Vec<SstableEntry> = live
        .iter()
        .filter(|e| e.level == target_level && !input_ids.contains(&e.id))
        .filter(|e| e.min_key.as_slice() <= max_key.as_slice() && e.max_key.as_slice() >= min_key.as_slice())
        .cloned()
        .collect();

    let mut all_inputs = inputs.clone();
    all_inputs.extend(overlapping_at_target.iter().cloned());

    let merged = merge_dedup(data_dir, &all_inputs, is_bottommost)?;
    let tombstones_dropped = merged.dropped_tombstones;

    let mut removed_ids: Vec<u64> = all_inputs.iter().map(|e| e.id).collect();
    removed_ids.sort_unstable();
    removed_ids.dedup();

    let new_id = manifest.allocate_id();
    let new_path = data_dir.join(format!("{new_id}.sst"));

    if merged.entries.is_empty() {
        // Every input key was a droppable tombstone; commit the removal
        // with no replacement SSTable.
        manifest.swap(&removed_ids, Vec::new())?;
        return Ok(CompactionOutcome {
            removed_ids,
            new_sstable_id: new_id,
            new_path,
            entries_written: 0,
            tombstones_dropped,
        });
    }

    let meta = SstWriter::build(&new_path, target_level, &merged.entries, bloom_fpr, block_size)?;

    manifest.swap(
        &removed_ids,
        vec![SstableEntry {
            id: new_id,
            level: target_level,
            min_key: meta.min_key,
            max_key: meta.max_key,
            file_name: new_path.file_name().unwrap().to_string_lossy().into_owned(),
            entry_count: meta.entry_count,
            file_size: meta.file_size,
            created_at: meta.created_at,
        }],
    )?;

    for id in &removed_ids {
        let path = data_dir.join(format!("{id}.sst"));
        let _ = std::fs::remove_file(path);
    }

    info!(
        target_level,
        inputs = removed_ids.len(),
        entries = merged.entries.len(),
        tombstones_dropped,
        "compaction committed"
    );

    Ok(CompactionOutcome {
        removed_ids,
        new_sstable_id: new_id,
        new_path,
        entries_written: merged.entries.len(),
        tombstones_dropped,
    })
}

struct MergeResult {
    entries: Vec<BlockEntry>,
    dropped_tombstones: usize,
}

/// Reads every entry out of `inputs`, keeps only the highest-seqno
/// version of each key, and (when `drop_tombstones`) removes tombstones
/// from the result entirely.
fn merge_dedup(
    data_dir: &Path,
    inputs: &[SstableEntry],
    drop_tombstones: bool,
) -> Result<MergeResult, CompactionError> {
    use std::collections::BTreeMap;

    let mut best: BTreeMap<Vec<u8>, BlockEntry> = BTreeMap::new();

    for input in inputs {
        let path = data_dir.join(&input.file_name);
        let sst = Arc::new(SSTable::open(&path)?);
        for block_idx in 0..sst.block_count() {
            for entry in sst.read_block(block_idx)? {
                match best.get(&entry.key) {
                    Some(existing) if existing.seqno >= entry.seqno => {}
                    _ => {
                        best.insert(entry.key.clone(), entry);
                    }
                }
            }
        }
    }

    let mut dropped_tombstones = 0usize;
    let entries: Vec<BlockEntry> = best
        .into_values()
        .filter(|e| {
            if e.value.is_none() && drop_tombstones {
                dropped_tombstones += 1;
                false
            } else {
                true
            }
        })
        .collect();

    Ok(MergeResult { entries, dropped_tombstones })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockEntry;
    use tempfile::tempdir;

    fn write_sst(dir: &Path, id: u64, level: u8, entries: Vec<BlockEntry>) -> SstableEntry {
        let path = dir.join(format!("{id}.sst"));
        let meta = SstWriter::build(&path, level, &entries, 0.01, 4096).unwrap();
        SstableEntry {
            id,
            level,
            min_key: meta.min_key,
            max_key: meta.max_key,
            file_name: format!("{id}.sst"),
            entry_count: meta.entry_count,
            file_size: meta.file_size,
            created_at: meta.created_at,
        }
    }

    #[test]
    fn merges_and_keeps_highest_seqno() {
        let dir = tempdir().unwrap();
        let manifest = Manifest::open(dir.path()).unwrap();

        let e1 = write_sst(
            dir.path(),
            1,
            0,
            vec![BlockEntry { key: b"k".to_vec(), value: Some(b"old".to_vec()), seqno: 1 }],
        );
        let e2 = write_sst(
            dir.path(),
            2,
            0,
            vec![BlockEntry { key: b"k".to_vec(), value: Some(b"new".to_vec()), seqno: 2 }],
        );
        manifest.add_sstable(e1).unwrap();
        manifest.add_sstable(e2).unwrap();

        let outcome = compact(dir.path(), &manifest, &[1, 2], 1, 0.01, 4096, false).unwrap();
        assert_eq!(outcome.entries_written, 1);

        let live = manifest.live_sstables();
        assert_eq!(live.len(), 1);
        let out_sst = SSTable::open(dir.path().join(&live[0].file_name)).unwrap();
        match out_sst.get(b"k").unwrap() {
            crate::sstable::LookupResult::Found(v) => assert_eq!(v, b"new"),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn drops_tombstones_only_at_bottommost_level() {
        let dir = tempdir().unwrap();
        let manifest = Manifest::open(dir.path()).unwrap();
        let e1 = write_sst(dir.path(), 1, 0, vec![BlockEntry { key: b"k".to_vec(), value: None, seqno: 5 }]);
        manifest.add_sstable(e1).unwrap();

        let outcome = compact(dir.path(), &manifest, &[1], 1, 0.01, 4096, false).unwrap();
        assert_eq!(outcome.entries_written, 1);
        assert_eq!(outcome.tombstones_dropped, 0);

        let live = manifest.live_sstables();
        let id = live[0].id;
        let outcome2 = compact(dir.path(), &manifest, &[id], 2, 0.01, 4096, true).unwrap();
        assert_eq!(outcome2.entries_written, 0);
        assert_eq!(outcome2.tombstones_dropped, 1);
        assert!(manifest.live_sstables().is_empty());
    }

    #[test]
    fn unknown_input_id_is_rejected() {
        let dir = tempdir().unwrap();
        let manifest = Manifest::open(dir.path()).unwrap();
        let err = compact(dir.path(), &manifest, &[999], 1, 0.01, 4096, false).unwrap_err();
        assert!(matches!(err, CompactionError::UnknownInput(999)));
    }
}
