//! SSTable writer: streams sorted entries into a sibling temp file, then
//! publishes it atomically (flush + fsync file + fsync directory +
//! rename), matching the reference engine's SSTable publication
//! discipline applied to the on-disk layout of §4.3.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::block::{self, BlockEntry};
use crate::bloom::BloomFilter;
use crate::codec;

use super::{encode_index, IndexEntry, SstableError, FORMAT_VERSION, MAGIC};

/// Metadata the caller (engine/manifest) needs about a freshly written
/// SSTable. Not stored redundantly inside the file itself.
#[derive(Debug, Clone)]
pub struct SstMetadata {
    pub level: u8,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub entry_count: u32,
    pub file_size: u64,
    pub created_at: u64,
}

pub struct SstWriter;

impl SstWriter {
    /// Builds a complete SSTable at `path` from `entries`, which must
    /// already be sorted by key with no duplicate keys (the caller is
    /// responsible for merge/dedup — see the compaction module).
    ///
    /// `fpr` is the bloom filter's target false-positive rate; `block_size`
    /// is the target decompressed size of each data block.
    pub fn build(
        path: impl AsRef<Path>,
        level: u8,
        entries: &[BlockEntry],
        fpr: f64,
        block_size: usize,
    ) -> Result<SstMetadata, SstableError> {
        if entries.is_empty() {
            return Err(SstableError::Internal(
                "refusing to build an SSTable with zero entries".into(),
            ));
        }

        let path = path.as_ref();
        let tmp_path = sibling_tmp_path(path);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut w = BufWriter::new(file);

        // Header
        let mut header = Vec::with_capacity(super::HEADER_SIZE);
        codec::put_bytes(&mut header, MAGIC);
        codec::put_u32(&mut header, FORMAT_VERSION);
        codec::put_u8(&mut header, level);
        codec::put_u32(&mut header, entries.len() as u32);
        w.write_all(&header)?;

        // Data blocks
        let groups = block::partition_into_blocks(entries, block_size);
        let mut index = Vec::with_capacity(groups.len());
        let mut offset = super::HEADER_SIZE as u64;

        for group in &groups {
            let first_key = group[0].key.clone();
            let raw = block::encode_entries(group);
            let framed = block::compress_block(&raw);
            w.write_all(&framed)?;
            index.push(IndexEntry { first_key, block_offset: offset });
            offset += framed.len() as u64;
        }

        // Sparse index
        let index_bytes = encode_index(&index);
        let index_offset = offset;
        w.write_all(&index_bytes)?;
        offset += index_bytes.len() as u64;

        // Bloom filter
        let bloom = BloomFilter::build(entries.iter().map(|e| e.key.as_slice()), fpr);
        let bloom_bytes = bloom.encode();
        let bloom_offset = offset;
        w.write_all(&bloom_bytes)?;

        // Footer
        let mut footer = Vec::with_capacity(super::FOOTER_SIZE);
        codec::put_u64(&mut footer, index_offset);
        codec::put_u32(&mut footer, index_bytes.len() as u32);
        codec::put_u64(&mut footer, bloom_offset);
        codec::put_u32(&mut footer, bloom_bytes.len() as u32);
        codec::put_bytes(&mut footer, MAGIC);
        w.write_all(&footer)?;

        w.flush()?;
        let file = w.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let file_size = file.metadata()?.len();
        drop(file);

        fs::rename(&tmp_path, path)?;
        fsync_parent_dir(path)?;

        info!(path = %path.display(), entries = entries.len(), level, "published SSTable");

        let created_at = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

        Ok(SstMetadata {
            level,
            min_key: entries.first().unwrap().key.clone(),
            max_key: entries.last().unwrap().key.clone(),
            entry_count: entries.len() as u32,
            file_size,
            created_at,
        })
    }
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn fsync_parent_dir(path: &Path) -> Result<(), SstableError> {
    let parent = path.parent().ok_or_else(|| {
        SstableError::Internal("SSTable path has no parent directory".into())
    })?;
    let dir = File::open(parent)?;
    dir.sync_all()?;
    Ok(())
}
