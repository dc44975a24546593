//! In-process engine configuration.
//!
//! Parsing a configuration file (TOML, environment variables, CLI flags)
//! is an external collaborator's job; [`EngineConfig`] is just the plain
//! struct the embedding application fills in and passes to
//! [`crate::engine::Engine::open`].

/// Tuning knobs for a [`crate::engine::Engine`] instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Memtable byte budget before rotation. Default 4 MiB.
    pub write_buffer_size: u64,

    /// Target false-positive rate for SSTable bloom filters.
    pub bloom_false_positive_rate: f64,

    /// Maximum number of WAL records folded into a single fsync'd batch.
    pub wal_batch_size: usize,

    /// Target size in bytes of a decompressed data block before the
    /// writer starts a new one.
    pub block_size: usize,
}

/// LZ4 high-compression level used for every data block. Fixed by the
/// format, not a caller-tunable knob.
pub const LZ4_COMPRESSION_LEVEL: i32 = 4;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024 * 1024,
            bloom_false_positive_rate: 0.01,
            wal_batch_size: 256,
            block_size: 4096,
        }
    }
}
