//! Manifest: the authoritative record of which SSTables currently make
//! up the database and at which level each lives (§4.6).
//!
//! Stored as a single JSON file so it can be inspected and diffed by
//! hand; key boundaries are base64-encoded since JSON strings must be
//! valid UTF-8 and keys are arbitrary bytes. Every mutation rewrites the
//! whole file atomically: write to a sibling temp file, fsync it,
//! `rename` over the live path, then fsync the containing directory —
//! the same tmp+fsync+rename+dir-fsync discipline the SSTable writer
//! uses for its own publication.
//!
//! If the manifest file is missing or fails to parse, [`Manifest::recover`]
//! falls back to scanning the data directory for `*.sst` files and
//! rebuilding the table list from their own headers/footers, and removes
//! any stray `*.tmp` files left behind by an interrupted rewrite.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::sstable::{SSTable, SstableError};

pub const MANIFEST_FILE_NAME: &str = "MANIFEST.json";
const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest JSON malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("manifest key encoding malformed: {0}")]
    BadEncoding(#[from] base64::DecodeError),

    #[error("sstable error during recovery scan: {0}")]
    Sstable(#[from] SstableError),

    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u32),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl ManifestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManifestError::Io(_) => ErrorKind::Io,
            ManifestError::Malformed(_) | ManifestError::BadEncoding(_) => ErrorKind::Corruption,
            ManifestError::Sstable(e) => e.kind(),
            ManifestError::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            ManifestError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// One live SSTable as recorded in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SstableEntry {
    pub id: u64,
    pub level: u8,
    #[serde(with = "base64_bytes")]
    pub min_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub max_key: Vec<u8>,
    pub file_name: String,
    pub entry_count: u32,
    pub file_size: u64,
    pub created_at: u64,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        BASE64.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestData {
    version: u32,
    next_sstable_id: u64,
    sstables: Vec<SstableEntry>,
}

impl Default for ManifestData {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            next_sstable_id: 1,
            sstables: Vec::new(),
        }
    }
}

/// The live manifest for one database directory.
pub struct Manifest {
    path: PathBuf,
    data: Mutex<ManifestData>,
}

impl Manifest {
    /// Opens the manifest in `dir`, recovering by directory scan if the
    /// manifest file is absent or unparsable.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref();
        let path = dir.join(MANIFEST_FILE_NAME);

        let data = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<ManifestData>(&bytes) {
                Ok(data) => {
                    if data.version > CURRENT_VERSION {
                        return Err(ManifestError::UnsupportedVersion(data.version));
                    }
                    data
                }
                Err(e) => {
                    warn!(error = %e, "manifest JSON malformed, recovering by directory scan");
                    Self::recover(dir)?
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("manifest absent, recovering by directory scan");
                Self::recover(dir)?
            }
            Err(e) => return Err(e.into()),
        };

        let manifest = Self { path, data: Mutex::new(data) };
        manifest.rewrite()?;
        cleanup_stray_tmp_files(dir)?;
        Ok(manifest)
    }

    /// Rebuilds manifest state by scanning `dir` for `*.sst` files and
    /// reading each one's header and sparse index directly.
    fn recover(dir: &Path) -> Result<ManifestData, ManifestError> {
        let mut sstables = Vec::new();
        let mut max_id = 0u64;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sst") {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let id: u64 = file_name
                .trim_end_matches(".sst")
                .parse()
                .unwrap_or(0);
            max_id = max_id.max(id);

            let sst = SSTable::open(&path)?;
            let Some(min_key) = sst.min_key().map(|k| k.to_vec()) else {
                continue;
            };
            let max_key = (0..sst.block_count())
                .last()
                .and_then(|last| sst.read_block(last).ok())
                .and_then(|entries| entries.last().map(|e| e.key.clone()))
                .unwrap_or_else(|| min_key.clone());

            let meta = entry.metadata()?;
            let file_size = meta.len();
            let created_at = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            sstables.push(SstableEntry {
                id,
                level: sst.level,
                min_key,
                max_key,
                file_name,
                entry_count: sst.entry_count,
                file_size,
                created_at,
            });
        }

        sstables.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(ManifestData {
            version: CURRENT_VERSION,
            next_sstable_id: max_id + 1,
            sstables,
        })
    }

    /// Allocates the next SSTable id, reserving it immediately (a crash
    /// before the corresponding file is published just burns an id).
    pub fn allocate_id(&self) -> u64 {
        let mut data = self.data.lock().unwrap();
        let id = data.next_sstable_id;
        data.next_sstable_id += 1;
        id
    }

    /// Adds a newly published SSTable and atomically rewrites the
    /// manifest file.
    pub fn add_sstable(&self, entry: SstableEntry) -> Result<(), ManifestError> {
        {
            let mut data = self.data.lock().unwrap();
            data.sstables.push(entry);
            data.sstables.sort_by(|a, b| (a.level, a.id).cmp(&(b.level, b.id)));
        }
        self.rewrite()
    }

    /// Atomically swaps `removed_ids` out for `added` in one manifest
    /// rewrite, the transaction boundary a flush or compaction commit
    /// needs.
    pub fn swap(&self, removed_ids: &[u64], added: Vec<SstableEntry>) -> Result<(), ManifestError> {
        {
            let mut data = self.data.lock().unwrap();
            data.sstables.retain(|e| !removed_ids.contains(&e.id));
            data.sstables.extend(added);
            data.sstables.sort_by(|a, b| (a.level, a.id).cmp(&(b.level, b.id)));
        }
        self.rewrite()
    }

    /// Snapshot of the currently live SSTables, ordered by (level, id).
    pub fn live_sstables(&self) -> Vec<SstableEntry> {
        self.data.lock().unwrap().sstables.clone()
    }

    /// SSTables at `level` whose key range could contain `key`. Level 0
    /// entries always qualify, since they may overlap each other; levels
    /// 1 and up are non-overlapping, so the match (if any) is found by
    /// binary search on `min_key` rather than a linear scan.
    pub fn candidates_for(&self, level: u8, key: &[u8]) -> Vec<SstableEntry> {
        let data = self.data.lock().unwrap();
        if level == 0 {
            return data.sstables.iter().filter(|e| e.level == 0).cloned().collect();
        }

        let mut level_entries: Vec<&SstableEntry> = data.sstables.iter().filter(|e| e.level == level).collect();
        level_entries.sort_by(|a, b| a.min_key.cmp(&b.min_key));

        match level_entries.binary_search_by(|e| {
            if key < e.min_key.as_slice() {
                std::cmp::Ordering::Greater
            } else if key > e.max_key.as_slice() {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        }) {
            Ok(i) => vec![level_entries[i].clone()],
            Err(_) => Vec::new(),
        }
    }

    fn rewrite(&self) -> Result<(), ManifestError> {
        let data = self.data.lock().unwrap().clone();
        let bytes = serde_json::to_vec_pretty(&data)?;

        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("json.tmp");

        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        fsync_dir(self.path.parent().ok_or_else(|| {
            ManifestError::Internal("manifest path has no parent directory".into())
        })?)?;

        Ok(())
    }
}

fn fsync_dir(dir: &Path) -> Result<(), ManifestError> {
    let f = File::open(dir)?;
    f.sync_all()?;
    Ok(())
}

fn cleanup_stray_tmp_files(dir: &Path) -> Result<(), ManifestError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            warn!(path = %path.display(), "removing stray temp file left by interrupted rewrite");
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}
