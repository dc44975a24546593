//! SSTable on-disk format, reader, and atomic writer (§4.3).
//!
//! ```text
//! Header (17 B):  magic "SEGMTSST" | version u32 BE | level u8 | entry_count u32 BE
//! Data blocks:    as in the block codec, concatenated
//! Sparse index:   index_entry_count u32 BE,
//!                 then entry_count records of { block_offset u64 BE, key_len u16 BE, key[key_len] }
//! Bloom filter:   serialized form from the bloom module
//! Footer (32 B):  index_offset u64 BE | index_size u32 BE |
//!                 bloom_offset u64 BE | bloom_size u32 BE | magic "SEGMTSST"
//! ```
//!
//! All multi-byte integers are big-endian. The footer's trailing magic
//! both validates the footer and disambiguates truncation.

pub mod builder;
pub mod iterator;

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::block::{self, BlockEntry, BlockError};
use crate::bloom::{BloomError, BloomFilter};
use crate::codec::{self, Reader};
use crate::error::ErrorKind;

pub use builder::{SstMetadata, SstWriter};
pub use iterator::ScanIterator;

/// ASCII magic stamped at the start of the header and the end of the footer.
pub const MAGIC: &[u8; 8] = b"SEGMTSST";

/// Current on-disk format version. Opening a file with a higher version
/// fails with [`SstableError::UnsupportedVersion`].
pub const FORMAT_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 17;
pub const FOOTER_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum SstableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block error: {0}")]
    Block(#[from] BlockError),

    #[error("bloom error: {0}")]
    Bloom(#[from] BloomError),

    #[error("bad magic in SSTable header or footer")]
    BadMagic,

    #[error("unsupported SSTable format version {0}")]
    UnsupportedVersion(u32),

    #[error("SSTable file truncated or too small")]
    Truncated,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl SstableError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SstableError::Io(_) => ErrorKind::Io,
            SstableError::Block(_) | SstableError::Bloom(_) | SstableError::BadMagic | SstableError::Truncated => {
                ErrorKind::Corruption
            }
            SstableError::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            SstableError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// A single entry in the sparse index: the first key of a block and that
/// block's byte offset.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub first_key: Vec<u8>,
    pub block_offset: u64,
}

/// Result of a point lookup within a single SSTable.
#[derive(Debug, Clone)]
pub enum LookupResult {
    /// The key was found with a live value.
    Found(Vec<u8>),
    /// The key was found but is a tombstone; the caller must not look in
    /// older sources.
    Tombstone,
    /// The key is absent from this table.
    NotFound,
}

/// An open, immutable SSTable reader.
///
/// The sparse index and bloom filter are loaded fully into memory at
/// open time; data blocks are read lazily, zero-copy, off a shared
/// memory map.
pub struct SSTable {
    pub level: u8,
    pub entry_count: u32,
    mmap: Mmap,
    index: Vec<IndexEntry>,
    bloom: BloomFilter,
}

impl SSTable {
    /// Opens an existing, fully-published SSTable file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstableError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(SstableError::Truncated);
        }

        let mut hr = Reader::new(&mmap[0..HEADER_SIZE]);
        let magic = hr.get_bytes(8).map_err(|_| SstableError::Truncated)?;
        if magic != MAGIC {
            return Err(SstableError::BadMagic);
        }
        let version = hr.get_u32().map_err(|_| SstableError::Truncated)?;
        if version > FORMAT_VERSION {
            return Err(SstableError::UnsupportedVersion(version));
        }
        let level = hr.get_u8().map_err(|_| SstableError::Truncated)?;
        let entry_count = hr.get_u32().map_err(|_| SstableError::Truncated)?;

        let footer_start = mmap.len() - FOOTER_SIZE;
        let mut fr = Reader::new(&mmap[footer_start..]);
        let index_offset = fr.get_u64().map_err(|_| SstableError::Truncated)?;
        let index_size = fr.get_u32().map_err(|_| SstableError::Truncated)? as usize;
        let bloom_offset = fr.get_u64().map_err(|_| SstableError::Truncated)?;
        let bloom_size = fr.get_u32().map_err(|_| SstableError::Truncated)? as usize;
        let footer_magic = fr.get_bytes(8).map_err(|_| SstableError::Truncated)?;
        if footer_magic != MAGIC {
            return Err(SstableError::BadMagic);
        }

        let index_bytes = mmap
            .get(index_offset as usize..index_offset as usize + index_size)
            .ok_or(SstableError::Truncated)?;
        let index = decode_index(index_bytes)?;

        let bloom_bytes = mmap
            .get(bloom_offset as usize..bloom_offset as usize + bloom_size)
            .ok_or(SstableError::Truncated)?;
        let bloom = BloomFilter::decode(bloom_bytes)?;

        Ok(Self {
            level,
            entry_count,
            mmap,
            index,
            bloom,
        })
    }

    /// Returns the first key of the first block, if any.
    pub fn min_key(&self) -> Option<&[u8]> {
        self.index.first().map(|e| e.first_key.as_slice())
    }

    /// Binary-searches the sparse index for the rightmost entry whose key
    /// is ≤ `key`. Returns `None` if `key` precedes the first block.
    fn find_block_index(&self, key: &[u8]) -> Option<usize> {
        if self.index.is_empty() {
            return None;
        }
        match self.index.binary_search_by(|e| e.first_key.as_slice().cmp(key)) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    fn read_block_at(&self, offset: u64) -> Result<Vec<BlockEntry>, SstableError> {
        let offset = offset as usize;
        let header = self.mmap.get(offset..offset + 8).ok_or(SstableError::Truncated)?;
        let compressed_size = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
        let frame_len = 12 + compressed_size;
        let framed = self
            .mmap
            .get(offset..offset + frame_len)
            .ok_or(SstableError::Truncated)?;
        let raw = block::decompress_block(framed)?;
        Ok(block::decode_entries(&raw)?)
    }

    /// Point lookup. Returns the latest (and, by construction, only)
    /// version of `key` stored in this table.
    pub fn get(&self, key: &[u8]) -> Result<LookupResult, SstableError> {
        if !self.bloom.contains(key) {
            return Ok(LookupResult::NotFound);
        }

        let Some(block_idx) = self.find_block_index(key) else {
            return Ok(LookupResult::NotFound);
        };

        let entries = self.read_block_at(self.index[block_idx].block_offset)?;
        for entry in entries {
            if entry.key == key {
                return Ok(match entry.value {
                    Some(v) => LookupResult::Found(v),
                    None => LookupResult::Tombstone,
                });
            }
        }
        Ok(LookupResult::NotFound)
    }

    /// Number of data blocks.
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Reads and decodes block `i` (0-indexed into the sparse index).
    pub(crate) fn read_block(&self, i: usize) -> Result<Vec<BlockEntry>, SstableError> {
        self.read_block_at(self.index[i].block_offset)
    }

    pub(crate) fn index_len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn first_key_of_block(&self, i: usize) -> &[u8] {
        &self.index[i].first_key
    }
}

fn decode_index(buf: &[u8]) -> Result<Vec<IndexEntry>, SstableError> {
    let mut r = Reader::new(buf);
    let count = r.get_u32().map_err(|_| SstableError::Truncated)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let block_offset = r.get_u64().map_err(|_| SstableError::Truncated)?;
        let key_len = r.get_u16().map_err(|_| SstableError::Truncated)? as usize;
        let first_key = r.get_bytes(key_len).map_err(|_| SstableError::Truncated)?.to_vec();
        out.push(IndexEntry { first_key, block_offset });
    }
    Ok(out)
}

pub(crate) fn encode_index(entries: &[IndexEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    codec::put_u32(&mut buf, entries.len() as u32);
    for e in entries {
        codec::put_u64(&mut buf, e.block_offset);
        codec::put_u16(&mut buf, e.first_key.len() as u16);
        codec::put_bytes(&mut buf, &e.first_key);
    }
    buf
}
