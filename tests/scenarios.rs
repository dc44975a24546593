//! End-to-end scenarios exercising the engine as a whole, as opposed to
//! the per-module unit tests colocated with each subsystem.

use std::fs;

use segmentdb::config::EngineConfig;
use segmentdb::engine::Engine;
use tempfile::tempdir;

fn tiny_config() -> EngineConfig {
    EngineConfig { write_buffer_size: 4 * 1024, ..EngineConfig::default() }
}

#[test]
fn s1_round_trip() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(engine.get(b"c").unwrap(), None);
}

#[test]
fn s2_overwrite_wins_by_seqno() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.put(b"k", b"v1").unwrap();
    engine.put(b"k", b"v2").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn s3_tombstone() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    engine.put(b"k", b"v").unwrap();
    engine.delete(b"k").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), None);
}

/// Simulates a crash (e.g. SIGKILL) before any graceful shutdown runs,
/// then reopens and checks every acknowledged write survived via WAL
/// replay alone.
#[test]
fn s4_crash_durability() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        for i in 0..10_000u32 {
            engine.put(format!("key-{i:06}").as_bytes(), format!("value-{i}").as_bytes()).unwrap();
        }
        // Skip close() (and its Drop-triggered graceful flush/WAL
        // shutdown): every put() already fsync'd through the WAL by the
        // time it returned, so recovery below must work from WAL replay
        // alone, not a graceful shutdown.
        std::mem::forget(engine);
    }

    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    for i in 0..10_000u32 {
        let expected = format!("value-{i}").into_bytes();
        assert_eq!(engine.get(format!("key-{i:06}").as_bytes()).unwrap(), Some(expected));
    }
}

#[test]
fn s5_flush_and_compact() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), tiny_config()).unwrap();

    // Force several level-0 flushes by writing past the tiny write buffer
    // budget multiple times.
    for round in 0..3u32 {
        for i in 0..200u32 {
            let key = format!("r{round}-k{i:05}");
            engine.put(key.as_bytes(), &vec![0u8; 64]).unwrap();
        }
    }
    engine.close().unwrap();

    let engine = Engine::open(dir.path(), tiny_config()).unwrap();
    let before_ids: Vec<u64> = engine.live_sstable_ids();
    assert!(before_ids.len() >= 2, "expected multiple level-0 SSTables before compaction");

    let total_size_before: u64 = before_ids
        .iter()
        .map(|id| fs::metadata(dir.path().join(format!("{id}.sst"))).unwrap().len())
        .sum();

    let outcome = engine.compact(&before_ids, 1, true).unwrap();
    assert_eq!(outcome.removed_ids.len(), before_ids.len());

    // get() still resolves every key correctly after compaction.
    for round in 0..3u32 {
        for i in 0..200u32 {
            let key = format!("r{round}-k{i:05}");
            assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(vec![0u8; 64]));
        }
    }

    let after_ids = engine.live_sstable_ids();
    assert_eq!(after_ids.len(), 1, "manifest should list only the level-1 output");

    for id in &before_ids {
        assert!(!dir.path().join(format!("{id}.sst")).exists(), "level-0 input {id} should be deleted");
    }

    let total_size_after: u64 = fs::metadata(dir.path().join(format!("{}.sst", after_ids[0]))).unwrap().len();
    assert!(total_size_after <= total_size_before);
}

#[test]
fn s6_tail_torn_wal_replay_stops_cleanly() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        for i in 0..20u32 {
            engine.put(format!("k{i:04}").as_bytes(), format!("v{i}").as_bytes()).unwrap();
        }
        // Simulate a crash: skip close() (and its Drop-triggered flush)
        // so the WAL segment survives on disk, un-flushed, for the torn
        // tail this test inflicts on it.
        std::mem::forget(engine);
    }

    let wal_dir = dir.path().join("wal");
    let mut segments: Vec<_> = fs::read_dir(&wal_dir).unwrap().map(|e| e.unwrap().path()).collect();
    segments.sort();
    let last_segment = segments.last().expect("at least one WAL segment should exist");

    let mut bytes = fs::read(last_segment).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(last_segment, &bytes).unwrap();

    // Reopening must succeed despite the torn tail, recovering every
    // record up to (not including) the damaged one.
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    assert_eq!(engine.get(b"k0000").unwrap(), Some(b"v0".to_vec()));
}
