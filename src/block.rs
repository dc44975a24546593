//! Block codec: compress/decompress a run of sorted entries as a unit,
//! with CRC32 integrity (§4.2).
//!
//! On-disk block framing:
//!
//! ```text
//! compressed_size   : u32 BE
//! uncompressed_size : u32 BE
//! compressed_payload: bytes[compressed_size]
//! crc32             : u32 BE   (over the 8-byte header + payload)
//! ```
//!
//! Within a decompressed block, entries are packed back to back:
//!
//! ```text
//! entry_length : u32   (total following this field)
//! seqno        : u64
//! key_len      : u16
//! val_len      : u32
//! tombstone    : u8    (0 = value, 1 = tombstone; if 1, val_len must be 0)
//! key          : bytes[key_len]
//! value        : bytes[val_len]
//! ```

use thiserror::Error;

use crate::codec::{self, Reader};
use crate::error::ErrorKind;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block checksum mismatch")]
    ChecksumMismatch,

    #[error("block buffer truncated")]
    Truncated,

    #[error("lz4 decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("malformed entry: {0}")]
    MalformedEntry(String),
}

impl BlockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlockError::ChecksumMismatch => ErrorKind::Corruption,
            BlockError::Truncated => ErrorKind::Corruption,
            BlockError::Decompress(_) => ErrorKind::Corruption,
            BlockError::MalformedEntry(_) => ErrorKind::Corruption,
        }
    }
}

/// A single logical record inside a decompressed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub key: Vec<u8>,
    /// `None` represents a tombstone.
    pub value: Option<Vec<u8>>,
    pub seqno: u64,
}

fn encode_entry(buf: &mut Vec<u8>, entry: &BlockEntry) {
    let tombstone = entry.value.is_none();
    let val_len = entry.value.as_deref().map(|v| v.len()).unwrap_or(0) as u32;

    // entry_length covers everything after the entry_length field itself.
    let body_len = 8 /* seqno */
        + 2 /* key_len */
        + 4 /* val_len */
        + 1 /* tombstone */
        + entry.key.len()
        + val_len as usize;

    codec::put_u32(buf, body_len as u32);
    codec::put_u64(buf, entry.seqno);
    codec::put_u16(buf, entry.key.len() as u16);
    codec::put_u32(buf, val_len);
    codec::put_u8(buf, tombstone as u8);
    codec::put_bytes(buf, &entry.key);
    if let Some(v) = &entry.value {
        codec::put_bytes(buf, v);
    }
}

fn decode_entry(r: &mut Reader<'_>) -> Result<BlockEntry, BlockError> {
    let entry_length = r.get_u32().map_err(|_| BlockError::Truncated)? as usize;
    let start = r.position();

    let seqno = r.get_u64().map_err(|_| BlockError::Truncated)?;
    let key_len = r.get_u16().map_err(|_| BlockError::Truncated)? as usize;
    let val_len = r.get_u32().map_err(|_| BlockError::Truncated)? as usize;
    let tombstone = r.get_u8().map_err(|_| BlockError::Truncated)?;

    if tombstone == 1 && val_len != 0 {
        return Err(BlockError::MalformedEntry(
            "tombstone entry carries a non-zero value length".into(),
        ));
    }

    let key = r.get_bytes(key_len).map_err(|_| BlockError::Truncated)?.to_vec();
    let value = if tombstone == 1 {
        None
    } else {
        Some(r.get_bytes(val_len).map_err(|_| BlockError::Truncated)?.to_vec())
    };

    if r.position() - start != entry_length {
        return Err(BlockError::MalformedEntry(format!(
            "entry_length {} did not match decoded body length {}",
            entry_length,
            r.position() - start
        )));
    }

    Ok(BlockEntry { key, value, seqno })
}

/// Serializes `entries` into the raw (uncompressed) entry stream used as
/// the compression input.
pub fn encode_entries(entries: &[BlockEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for entry in entries {
        encode_entry(&mut buf, entry);
    }
    buf
}

/// Parses a raw (uncompressed) entry stream back into entries.
pub fn decode_entries(buf: &[u8]) -> Result<Vec<BlockEntry>, BlockError> {
    let mut r = Reader::new(buf);
    let mut out = Vec::new();
    while r.remaining() > 0 {
        out.push(decode_entry(&mut r)?);
    }
    Ok(out)
}

/// Compresses a raw entry stream and frames it per §4.2.
pub fn compress_block(raw: &[u8]) -> Vec<u8> {
    // lz4_flex's block compressor does not expose discrete HC levels the
    // way the C liblz4 does; its single compression mode is used here as
    // the concrete LZ4 implementation for the "LZ4 HC level 4" format
    // slot (see DESIGN.md). The on-disk framing and round-trip contract
    // are identical regardless of which LZ4 variant produced the bytes.
    let compressed = lz4_flex::block::compress(raw);

    let mut framed = Vec::with_capacity(12 + compressed.len());
    codec::put_u32(&mut framed, compressed.len() as u32);
    codec::put_u32(&mut framed, raw.len() as u32);
    codec::put_bytes(&mut framed, &compressed);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&framed);
    let crc = hasher.finalize();
    codec::put_u32(&mut framed, crc);

    framed
}

/// Validates and decompresses a framed block, returning the raw entry
/// stream. A CRC mismatch fails the read with [`BlockError::ChecksumMismatch`]
/// rather than retrying.
pub fn decompress_block(framed: &[u8]) -> Result<Vec<u8>, BlockError> {
    if framed.len() < 12 {
        return Err(BlockError::Truncated);
    }
    let header_and_payload_len = framed.len() - 4;
    let (header_and_payload, crc_bytes) = framed.split_at(header_and_payload_len);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_and_payload);
    let computed = hasher.finalize();
    let stored = u32::from_be_bytes(crc_bytes.try_into().unwrap());
    if computed != stored {
        return Err(BlockError::ChecksumMismatch);
    }

    let mut r = Reader::new(header_and_payload);
    let compressed_size = r.get_u32().map_err(|_| BlockError::Truncated)? as usize;
    let uncompressed_size = r.get_u32().map_err(|_| BlockError::Truncated)? as usize;
    let payload = r
        .get_bytes(compressed_size)
        .map_err(|_| BlockError::Truncated)?;

    let raw = lz4_flex::block::decompress(payload, uncompressed_size)?;
    Ok(raw)
}

/// Greedily partitions sorted entries into blocks of at most `target_size`
/// decompressed bytes each. A single entry larger than `target_size`
/// still occupies its own block.
pub fn partition_into_blocks(entries: &[BlockEntry], target_size: usize) -> Vec<&[BlockEntry]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut running = 0usize;

    for (i, entry) in entries.iter().enumerate() {
        let approx = 19 + entry.key.len() + entry.value.as_deref().map(|v| v.len()).unwrap_or(0);
        if running > 0 && running + approx > target_size {
            out.push(&entries[start..i]);
            start = i;
            running = 0;
        }
        running += approx;
    }
    if start < entries.len() {
        out.push(&entries[start..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<BlockEntry> {
        vec![
            BlockEntry { key: b"a".to_vec(), value: Some(b"1".to_vec()), seqno: 1 },
            BlockEntry { key: b"b".to_vec(), value: Some(b"2".to_vec()), seqno: 2 },
            BlockEntry { key: b"c".to_vec(), value: None, seqno: 3 },
        ]
    }

    #[test]
    fn round_trip_entries() {
        let entries = sample_entries();
        let raw = encode_entries(&entries);
        let decoded = decode_entries(&raw).unwrap();
        assert_eq!(entries, decoded);
    }

    #[test]
    fn round_trip_compressed_block() {
        let entries = sample_entries();
        let raw = encode_entries(&entries);
        let framed = compress_block(&raw);
        let decompressed = decompress_block(&framed).unwrap();
        assert_eq!(raw, decompressed);
        assert_eq!(decode_entries(&decompressed).unwrap(), entries);
    }

    #[test]
    fn detects_corrupted_block() {
        let entries = sample_entries();
        let raw = encode_entries(&entries);
        let mut framed = compress_block(&raw);
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        assert!(matches!(
            decompress_block(&framed),
            Err(BlockError::ChecksumMismatch)
        ));
    }

    #[test]
    fn tombstone_rejects_nonzero_value_len() {
        let entries = sample_entries();
        let raw = encode_entries(&entries);
        // Flip a byte in a spot cheap enough to corrupt structure for this
        // unit test would be brittle; instead directly exercise decode_entry
        // invariants via a hand-built buffer.
        let mut buf = Vec::new();
        codec::put_u32(&mut buf, 8 + 2 + 4 + 1 + 1); // body length
        codec::put_u64(&mut buf, 1);
        codec::put_u16(&mut buf, 1);
        codec::put_u32(&mut buf, 1); // val_len = 1, but tombstone = 1
        codec::put_u8(&mut buf, 1);
        codec::put_bytes(&mut buf, b"k");
        let err = decode_entries(&buf).unwrap_err();
        assert!(matches!(err, BlockError::MalformedEntry(_)));
        let _ = raw;
    }

    #[test]
    fn partitions_respect_target_size() {
        let entries: Vec<BlockEntry> = (0..100)
            .map(|i| BlockEntry {
                key: format!("key-{i:04}").into_bytes(),
                value: Some(vec![0u8; 50]),
                seqno: i as u64,
            })
            .collect();
        let blocks = partition_into_blocks(&entries, 512);
        assert!(blocks.len() > 1);
        let total: usize = blocks.iter().map(|b| b.len()).sum();
        assert_eq!(total, entries.len());
    }
}
