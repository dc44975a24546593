//! The embeddable storage engine facade (§6): `open`, `put`, `delete`,
//! `get`, `close`, `compact`, and `stats`, plus the supplemental
//! `delete_range`/`scan` operations built on the same merge machinery.
//!
//! A single writer lock serializes `put`/`delete` so that seqno
//! assignment is strictly monotonic. Writes go WAL-first, then into the
//! active memtable. When the active memtable crosses its configured
//! byte budget it is rotated out and handed to the single background
//! flush thread, which builds an SSTable and commits it to the
//! manifest in the same order memtables were enqueued — flush
//! publish order always matches flush enqueue order.

pub mod utils;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam::channel::{self, Sender};
use tracing::{debug, info, warn};

use crate::block::BlockEntry;
use crate::compaction::{self, CompactionOutcome};
use crate::config::EngineConfig;
use crate::error::{validate_key, validate_value, EngineError};
use crate::manifest::{Manifest, SstableEntry};
use crate::memtable::Memtable;
use crate::sstable::{LookupResult, SSTable, SstWriter};
use crate::wal::{Wal, WalOp, WalRecord};

use utils::{MergeIterator, Record};

const WAL_DIR_NAME: &str = "wal";

fn segment_path(wal_dir: &Path, id: u64) -> PathBuf {
    wal_dir.join(format!("{id:020}.log"))
}

fn existing_segment_ids(wal_dir: &Path) -> Result<Vec<u64>, EngineError> {
    let mut ids = Vec::new();
    if !wal_dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(wal_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".log") {
            if let Ok(id) = stem.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Aggregate counters describing the current state of an open engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub next_seqno: u64,
    pub active_memtable_entries: usize,
    pub active_memtable_bytes: u64,
    pub live_sstables: usize,
    pub live_sstable_bytes: u64,
    pub flushes_completed: u64,
}

struct MemState {
    active: Memtable,
    /// Set while a rotated-out memtable is being flushed in the
    /// background; point lookups must still consult it.
    immutable: Option<Arc<Memtable>>,
}

struct FlushTask {
    seq: u64,
    memtable: Arc<Memtable>,
    /// Every WAL segment with id <= this value is fully captured by
    /// `memtable` and may be deleted once the flush commits.
    retire_through: u64,
}

/// An open SegmentDB engine rooted at a single data directory.
pub struct Engine {
    data_dir: PathBuf,
    config: EngineConfig,
    manifest: Arc<Manifest>,
    wal: Mutex<Wal>,
    wal_dir: PathBuf,
    segment_id: AtomicU64,
    seqno: AtomicU64,
    write_lock: Mutex<()>,
    mem: Mutex<MemState>,
    sstable_cache: Mutex<HashMap<u64, Arc<SSTable>>>,
    flush_tx: Sender<FlushTask>,
    flush_seq: AtomicU64,
    flush_completed: Arc<(Mutex<u64>, Condvar)>,
    closed: AtomicBool,
}

impl Engine {
    /// Opens (creating if absent) the database rooted at `data_dir`,
    /// replaying the WAL to recover any writes not yet flushed to an
    /// SSTable.
    pub fn open(data_dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let manifest = Arc::new(Manifest::open(&data_dir)?);

        let wal_dir = data_dir.join(WAL_DIR_NAME);
        fs::create_dir_all(&wal_dir)?;
        let existing_segments = existing_segment_ids(&wal_dir)?;

        let mut memtable = Memtable::new();
        let mut max_seqno = 0u64;
        let mut total_records = 0usize;
        for &id in &existing_segments {
            for record in Wal::replay(segment_path(&wal_dir, id))? {
                max_seqno = max_seqno.max(record.seqno);
                total_records += 1;
                match record.op {
                    WalOp::Put { key, value } => {
                        memtable.put(key, value, record.seqno)?;
                    }
                    WalOp::Delete { key } => {
                        memtable.delete(key, record.seqno)?;
                    }
                }
            }
        }
        if total_records > 0 {
            info!(records = total_records, segments = existing_segments.len(), "recovered WAL records into memtable");
        }

        let next_segment_id = existing_segments.last().copied().unwrap_or(0) + 1;
        let wal = Wal::open(segment_path(&wal_dir, next_segment_id), config.wal_batch_size)?;

        let (flush_tx, flush_rx) = channel::unbounded::<FlushTask>();
        let flush_completed = Arc::new((Mutex::new(0u64), Condvar::new()));

        {
            let manifest = Arc::clone(&manifest);
            let data_dir = data_dir.clone();
            let wal_dir = wal_dir.clone();
            let config = config;
            let flush_completed = Arc::clone(&flush_completed);
            std::thread::Builder::new()
                .name("flush".into())
                .spawn(move || {
                    for task in flush_rx {
                        if let Err(e) = run_flush(&data_dir, &wal_dir, &manifest, &task, &config) {
                            warn!(error = %e, "memtable flush failed");
                        }
                        let (lock, cvar) = &*flush_completed;
                        let mut completed = lock.lock().unwrap();
                        *completed = task.seq;
                        cvar.notify_all();
                    }
                })
                .map_err(EngineError::Io)?;
        }

        Ok(Self {
            data_dir,
            config,
            manifest,
            wal: Mutex::new(wal),
            wal_dir,
            segment_id: AtomicU64::new(next_segment_id),
            seqno: AtomicU64::new(max_seqno),
            write_lock: Mutex::new(()),
            mem: Mutex::new(MemState { active: memtable, immutable: None }),
            sstable_cache: Mutex::new(HashMap::new()),
            flush_tx,
            flush_seq: AtomicU64::new(0),
            flush_completed,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Durably writes `key`/`value`, assigning the next seqno.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.check_open()?;
        validate_key(key)?;
        validate_value(value)?;

        let _guard = self.write_lock.lock().unwrap();
        let seqno = self.seqno.fetch_add(1, AtomicOrdering::SeqCst) + 1;

        self.wal.lock().unwrap().append(&WalRecord {
            seqno,
            op: WalOp::Put { key: key.to_vec(), value: value.to_vec() },
        })?;

        {
            let mut mem = self.mem.lock().unwrap();
            mem.active.put(key.to_vec(), value.to_vec(), seqno)?;
        }
        self.maybe_rotate()?;
        Ok(())
    }

    /// Records a tombstone for `key` at the next seqno.
    pub fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        self.check_open()?;
        validate_key(key)?;

        let _guard = self.write_lock.lock().unwrap();
        let seqno = self.seqno.fetch_add(1, AtomicOrdering::SeqCst) + 1;

        self.wal.lock().unwrap().append(&WalRecord { seqno, op: WalOp::Delete { key: key.to_vec() } })?;

        {
            let mut mem = self.mem.lock().unwrap();
            mem.active.delete(key.to_vec(), seqno)?;
        }
        self.maybe_rotate()?;
        Ok(())
    }

    /// Deletes every key in `[start, end)`. Implemented as a sequence of
    /// point tombstones rather than a single range-tombstone record;
    /// adequate for the bounded ranges this engine expects, at the cost
    /// of one WAL record per covered key already present in memory.
    ///
    /// Only keys currently visible (in the active/immutable memtables or
    /// any live SSTable) are tombstoned; this does not shadow future
    /// writes outside of the normal seqno ordering.
    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<usize, EngineError> {
        self.check_open()?;
        if start >= end {
            return Err(EngineError::InvalidArgument("delete_range start must be < end".into()));
        }
        let keys: Vec<Vec<u8>> = self
            .scan(start, end)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys.len())
    }

    /// Point lookup. Returns `None` if the key is absent or has been
    /// deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.check_open()?;
        validate_key(key)?;

        let (active_hit, immutable) = {
            let mem = self.mem.lock().unwrap();
            (mem.active.get(key).cloned(), mem.immutable.clone())
        };
        if let Some(entry) = active_hit {
            return Ok(entry.value);
        }
        if let Some(imm) = immutable {
            if let Some(entry) = imm.get(key) {
                return Ok(entry.value.clone());
            }
        }

        for level in 0u8..=255 {
            let candidates = self.manifest.candidates_for(level, key);
            if candidates.is_empty() {
                continue;
            }
            // Level 0 entries may overlap; check newest (highest id) first.
            let mut ordered = candidates;
            ordered.sort_by(|a, b| b.id.cmp(&a.id));
            for entry in ordered {
                let sst = self.open_sstable(&entry)?;
                match sst.get(key)? {
                    LookupResult::Found(v) => return Ok(Some(v)),
                    LookupResult::Tombstone => return Ok(None),
                    LookupResult::NotFound => continue,
                }
            }
        }
        Ok(None)
    }

    /// Returns every live key/value pair in `[start, end)`, newest
    /// version only, in ascending key order. Supplemental to the
    /// minimal point-access interface.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        self.check_open()?;
        if start >= end {
            return Ok(Vec::new());
        }

        let mut per_source: Vec<Vec<Record>> = Vec::new();

        {
            let mem = self.mem.lock().unwrap();
            per_source.push(memtable_range(&mem.active, start, end, 0));
            if let Some(imm) = &mem.immutable {
                per_source.push(memtable_range(imm, start, end, 1));
            }
        }

        let live = self.manifest.live_sstables();
        for (idx, entry) in live.iter().enumerate() {
            if entry.max_key.as_slice() < start || entry.min_key.as_slice() >= end {
                continue;
            }
            let sst = self.open_sstable(entry)?;
            let scanned = crate::sstable::ScanIterator::new(sst, start, end.to_vec())?;
            let mut records = Vec::new();
            for item in scanned {
                let e = item?;
                records.push(Record { key: e.key, seqno: e.seqno, value: e.value, source: 0 });
            }
            per_source.push(records);
        }

        let merged = MergeIterator::new(per_source.into_iter().map(|v| v.into_iter()).collect());
        Ok(merged.filter_map(|r| r.value.map(|v| (r.key, v))).collect())
    }

    fn open_sstable(&self, entry: &SstableEntry) -> Result<Arc<SSTable>, EngineError> {
        let mut cache = self.sstable_cache.lock().unwrap();
        if let Some(sst) = cache.get(&entry.id) {
            return Ok(Arc::clone(sst));
        }
        let path = self.data_dir.join(&entry.file_name);
        let sst = Arc::new(SSTable::open(path)?);
        cache.insert(entry.id, Arc::clone(&sst));
        Ok(sst)
    }

    fn maybe_rotate(&self) -> Result<(), EngineError> {
        let task = {
            let mut mem = self.mem.lock().unwrap();
            if mem.active.approximate_size() < self.config.write_buffer_size {
                return Ok(());
            }
            if mem.immutable.is_some() {
                // A flush is already in flight; let this memtable keep
                // growing rather than queuing a second one out of order.
                return Ok(());
            }
            let rotated = Arc::new(std::mem::replace(&mut mem.active, Memtable::new()));
            mem.immutable = Some(Arc::clone(&rotated));
            rotated
        };

        let retire_through = self.segment_id.load(AtomicOrdering::SeqCst);
        let new_segment = self.segment_id.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        self.wal.lock().unwrap().rotate_to(segment_path(&self.wal_dir, new_segment))?;

        let seq = self.flush_seq.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let _ = self.flush_tx.send(FlushTask { seq, memtable: task, retire_through });
        Ok(())
    }

    /// Runs a single compaction of `input_ids` into `target_level`,
    /// dropping spent tombstones only if `is_bottommost` is set by the
    /// caller's scheduling policy.
    pub fn compact(
        &self,
        input_ids: &[u64],
        target_level: u8,
        is_bottommost: bool,
    ) -> Result<CompactionOutcome, EngineError> {
        self.check_open()?;
        let outcome = compaction::compact(
            &self.data_dir,
            &self.manifest,
            input_ids,
            target_level,
            self.config.bloom_false_positive_rate,
            self.config.block_size,
            is_bottommost,
        )?;
        let mut cache = self.sstable_cache.lock().unwrap();
        for id in &outcome.removed_ids {
            cache.remove(id);
        }
        Ok(outcome)
    }

    /// Ids of every SSTable the manifest currently considers live,
    /// ordered by (level, id). Intended for compaction scheduling
    /// policies built on top of this engine.
    pub fn live_sstable_ids(&self) -> Vec<u64> {
        self.manifest.live_sstables().into_iter().map(|e| e.id).collect()
    }

    /// Snapshot of coarse engine counters.
    pub fn stats(&self) -> EngineStats {
        let mem = self.mem.lock().unwrap();
        let (completed_lock, _) = &*self.flush_completed;
        let live = self.manifest.live_sstables();
        EngineStats {
            next_seqno: self.seqno.load(AtomicOrdering::SeqCst),
            active_memtable_entries: mem.active.len(),
            active_memtable_bytes: mem.active.approximate_size(),
            live_sstables: live.len(),
            live_sstable_bytes: live.iter().map(|e| e.file_size).sum(),
            flushes_completed: *completed_lock.lock().unwrap(),
        }
    }

    /// Flushes the active memtable (if non-empty) and waits for every
    /// queued flush to publish, then shuts down the WAL writer thread.
    /// Idempotent.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }

        let pending_seq = {
            let mut mem = self.mem.lock().unwrap();
            if !mem.active.is_empty() && mem.immutable.is_none() {
                let rotated = Arc::new(std::mem::replace(&mut mem.active, Memtable::new()));
                mem.immutable = Some(Arc::clone(&rotated));
                let retire_through = self.segment_id.load(AtomicOrdering::SeqCst);
                let seq = self.flush_seq.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                let _ = self.flush_tx.send(FlushTask { seq, memtable: rotated, retire_through });
                seq
            } else {
                self.flush_seq.load(AtomicOrdering::SeqCst)
            }
        };

        let (lock, cvar) = &*self.flush_completed;
        let mut completed = lock.lock().unwrap();
        while *completed < pending_seq {
            completed = cvar.wait(completed).unwrap();
        }
        drop(completed);

        self.wal.lock().unwrap().close()?;
        info!("engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn memtable_range(mem: &Memtable, start: &[u8], end: &[u8], source: usize) -> Vec<Record> {
    mem.iter_sorted()
        .filter(|(k, _)| *k >= start && *k < end)
        .map(|(k, e)| Record { key: k.to_vec(), seqno: e.seqno, value: e.value.clone(), source })
        .collect()
}

fn run_flush(
    data_dir: &Path,
    wal_dir: &Path,
    manifest: &Manifest,
    task: &FlushTask,
    config: &EngineConfig,
) -> Result<(), EngineError> {
    if task.memtable.is_empty() {
        for id in 1..=task.retire_through {
            let _ = fs::remove_file(segment_path(wal_dir, id));
        }
        return Ok(());
    }

    let entries: Vec<BlockEntry> = task
        .memtable
        .iter_sorted()
        .map(|(k, e)| BlockEntry { key: k.to_vec(), value: e.value.clone(), seqno: e.seqno })
        .collect();

    let id = manifest.allocate_id();
    let path = data_dir.join(format!("{id}.sst"));
    let meta = SstWriter::build(&path, 0, &entries, config.bloom_false_positive_rate, config.block_size)?;

    manifest.add_sstable(SstableEntry {
        id,
        level: 0,
        min_key: meta.min_key,
        max_key: meta.max_key,
        file_name: path.file_name().unwrap().to_string_lossy().into_owned(),
        entry_count: meta.entry_count,
        file_size: meta.file_size,
        created_at: meta.created_at,
    })?;

    for segment_id in 1..=task.retire_through {
        let _ = fs::remove_file(segment_path(wal_dir, segment_id));
    }

    debug!(sstable_id = id, entries = entries.len(), "memtable flushed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tiny_config() -> EngineConfig {
        EngineConfig { write_buffer_size: 256, ..EngineConfig::default() }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put(b"k", b"v").unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn overwrite_uses_highest_seqno() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put(b"k", b"v1").unwrap();
        engine.put(b"k", b"v2").unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn delete_shadows_prior_put() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put(b"k", b"v").unwrap();
        engine.delete(b"k").unwrap();
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn flush_then_reopen_recovers_data() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(dir.path(), tiny_config()).unwrap();
            for i in 0..50u32 {
                engine.put(format!("key-{i:04}").as_bytes(), &vec![0u8; 20]).unwrap();
            }
            engine.close().unwrap();
        }
        let engine = Engine::open(dir.path(), tiny_config()).unwrap();
        assert_eq!(engine.get(b"key-0000").unwrap(), Some(vec![0u8; 20]));
        assert_eq!(engine.get(b"key-0049").unwrap(), Some(vec![0u8; 20]));
    }

    #[test]
    fn scan_returns_sorted_live_entries() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.put(b"c", b"3").unwrap();
        engine.delete(b"b").unwrap();
        let results = engine.scan(b"a", b"d").unwrap();
        assert_eq!(results, vec![(b"a".to_vec(), b"1".to_vec()), (b"c".to_vec(), b"3".to_vec())]);
    }

    #[test]
    fn rejects_empty_key() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        assert!(engine.put(b"", b"v").is_err());
    }

    #[test]
    fn operations_after_close_are_rejected() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.close().unwrap();
        assert!(matches!(engine.put(b"k", b"v"), Err(EngineError::Closed)));
    }
}
