//! SegmentDB: an embedded, single-node, ordered key-value store built
//! as a log-structured merge tree.
//!
//! ```text
//! put/delete ──▶ WAL (group-commit) ──▶ active memtable
//!                                              │ rotate at write_buffer_size
//!                                              ▼
//!                                     immutable memtable
//!                                              │ background flush thread
//!                                              ▼
//!                              level-0 SSTable ──▶ manifest (JSON)
//!                                              │
//!                                     compact(input_ids, target_level)
//!                                              ▼
//!                                     level-1..255 SSTables
//! ```
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`error`] | Crate-wide error kinds and the [`error::EngineError`] facade |
//! | [`config`] | [`config::EngineConfig`] tuning knobs |
//! | [`codec`] | Big-endian primitive read/write helpers |
//! | [`bloom`] | Fixed-hash bloom filter used by every SSTable |
//! | [`block`] | Compressed, checksummed data block codec |
//! | [`wal`] | Durable, group-committed write-ahead log |
//! | [`memtable`] | Sorted in-memory write buffer |
//! | [`sstable`] | Immutable on-disk table: writer, reader, scan iterator |
//! | [`manifest`] | Authoritative live-SSTable listing |
//! | [`compaction`] | Merge/dedup mechanism for rewriting tables into a target level |
//! | [`engine`] | The [`engine::Engine`] facade tying every subsystem together |
//!
//! Parsing configuration files, wiring up a CLI or a network listener,
//! and choosing *when* and *what* to compact are all left to the
//! embedding application; this crate provides the storage mechanism,
//! not a server.
//!
//! # Quick start
//!
//! ```no_run
//! use segmentdb::config::EngineConfig;
//! use segmentdb::engine::Engine;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::open("./data", EngineConfig::default())?;
//! engine.put(b"user:1", b"alice")?;
//! assert_eq!(engine.get(b"user:1")?, Some(b"alice".to_vec()));
//! engine.delete(b"user:1")?;
//! assert_eq!(engine.get(b"user:1")?, None);
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod bloom;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStats};
pub use error::EngineError;
