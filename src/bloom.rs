//! Probabilistic membership filter used by every SSTable.
//!
//! `contains(key)` never returns `false` for a key that was inserted
//! (no false negatives); it may return `true` for a key that was not
//! inserted, at a bounded rate set at construction time.
//!
//! The hash is a fixed-seed xxh3-64 ([`xxhash_rust::xxh3`]), never a
//! per-process randomized seed — determinism across restarts and
//! machines is part of the on-disk contract (§4.1, §9). Two independent
//! 64-bit hashes (obtained from the same xxh3 digest split in half) are
//! combined via double hashing (Kirsch-Mitzenmacher) to derive the `k`
//! probe positions, avoiding `k` separate hash computations per key.

use thiserror::Error;

use crate::error::ErrorKind;

/// Fixed seed baked into every bloom filter this crate writes. Changing
/// this value would silently invalidate every SSTable ever written, so
/// it is never derived from configuration.
const HASH_SEED: u64 = 0x5345_474d_5453_5354; // "SEGMTST" folded to 8 bytes

/// Identifies the hashing scheme used to build this filter. Persisted so
/// that a reader refuses to trust a filter built with an incompatible
/// hash rather than silently mis-answering membership queries.
const HASH_ID: u32 = 1;

#[derive(Debug, Error)]
pub enum BloomError {
    #[error("bloom filter hash id mismatch: expected {expected}, found {found}")]
    HashIdMismatch { expected: u32, found: u32 },

    #[error("bloom filter buffer truncated")]
    Truncated,
}

impl BloomError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Corruption
    }
}

/// A serializable bloom filter over byte-string keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes a filter for `n` expected insertions at false-positive rate
    /// `fpr`, using the classical optimum `m = -n ln(fpr) / (ln 2)^2`,
    /// `k = (m/n) ln 2`.
    pub fn with_capacity(n: usize, fpr: f64) -> Self {
        let n = n.max(1) as f64;
        let ln2_sq = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let m = (-n * fpr.ln() / ln2_sq).ceil().max(8.0);
        let k = ((m / n) * std::f64::consts::LN_2).round().max(1.0) as u32;

        let num_bits = m as u64;
        let num_bytes = num_bits.div_ceil(8) as usize;

        Self {
            bits: vec![0u8; num_bytes],
            num_bits,
            num_hashes: k,
        }
    }

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        let h = xxhash_rust::xxh3::xxh3_128_with_seed(key, HASH_SEED);
        let lo = (h & 0xFFFF_FFFF_FFFF_FFFF) as u64;
        let hi = (h >> 64) as u64;
        (lo, hi)
    }

    fn bit_positions(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let (h1, h2) = Self::hash_pair(key);
        let num_bits = self.num_bits.max(1);
        (0..self.num_hashes).map(move |i| {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            combined % num_bits
        })
    }

    /// Inserts `key` into the filter.
    pub fn insert(&mut self, key: &[u8]) {
        for pos in self.bit_positions(key) {
            let byte = (pos / 8) as usize;
            let bit = (pos % 8) as u8;
            self.bits[byte] |= 1 << bit;
        }
    }

    /// Returns `false` only if `key` was definitely never inserted.
    pub fn contains(&self, key: &[u8]) -> bool {
        if self.num_bits == 0 {
            return false;
        }
        self.bit_positions(key).all(|pos| {
            let byte = (pos / 8) as usize;
            let bit = (pos % 8) as u8;
            self.bits[byte] & (1 << bit) != 0
        })
    }

    /// Serializes this filter: `hash_id u32 BE | num_bits u64 BE |
    /// num_hashes u32 BE | bits`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.bits.len());
        crate::codec::put_u32(&mut out, HASH_ID);
        crate::codec::put_u64(&mut out, self.num_bits);
        crate::codec::put_u32(&mut out, self.num_hashes);
        crate::codec::put_bytes(&mut out, &self.bits);
        out
    }

    /// Deserializes a filter written by [`Self::encode`]. Refuses to
    /// load a filter whose embedded hash identifier does not match this
    /// build's hashing scheme.
    pub fn decode(buf: &[u8]) -> Result<Self, BloomError> {
        let mut r = crate::codec::Reader::new(buf);
        let hash_id = r.get_u32().map_err(|_| BloomError::Truncated)?;
        if hash_id != HASH_ID {
            return Err(BloomError::HashIdMismatch {
                expected: HASH_ID,
                found: hash_id,
            });
        }
        let num_bits = r.get_u64().map_err(|_| BloomError::Truncated)?;
        let num_hashes = r.get_u32().map_err(|_| BloomError::Truncated)?;
        let num_bytes = num_bits.div_ceil(8) as usize;
        let bits = r
            .get_bytes(num_bytes)
            .map_err(|_| BloomError::Truncated)?
            .to_vec();

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    /// Builds a filter from a complete key set in one pass.
    pub fn build<'a>(keys: impl Iterator<Item = &'a [u8]> + Clone, fpr: f64) -> Self {
        let n = keys.clone().count();
        let mut filter = Self::with_capacity(n, fpr);
        for k in keys {
            filter.insert(k);
        }
        filter
    }
}
