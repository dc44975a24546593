//! Write-ahead log: append-only segment files with CRC-protected,
//! big-endian record framing, entry-count batched group commit, and
//! tail-torn-tolerant replay (§4.4).
//!
//! ```text
//! length : u32 BE          (length of payload)
//! seqno  : u64 BE
//! op     : u8              (0 = put, 1 = delete)
//! key_len : u16 BE
//! val_len : u32 BE         (must be 0 if op = delete)
//! key, value : bytes
//! crc32  : u32 BE          (over the framed fields preceding the CRC)
//! ```
//!
//! Exactly one writer thread owns the active segment file; every `append`
//! blocks the calling thread only until that thread's next fsync'd batch
//! completes, matching the concurrency model's single-writer-per-WAL rule.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{self, Reader};
use crate::error::ErrorKind;

/// Maximum number of records folded into a single write + fsync.
pub const DEFAULT_BATCH_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WAL writer thread is no longer running")]
    WriterGone,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl WalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WalError::Io(_) => ErrorKind::Io,
            WalError::WriterGone | WalError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// The mutation recorded by a single WAL entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A single WAL record: a mutation plus the seqno it was assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub seqno: u64,
    pub op: WalOp,
}

fn encode_record(record: &WalRecord) -> Vec<u8> {
    let (op_byte, key, val): (u8, &[u8], &[u8]) = match &record.op {
        WalOp::Put { key, value } => (0, key, value),
        WalOp::Delete { key } => (1, key, &[]),
    };

    let payload_len = 8 + 1 + 2 + 4 + key.len() + val.len();
    let mut buf = Vec::with_capacity(4 + payload_len + 4);

    codec::put_u32(&mut buf, payload_len as u32);
    codec::put_u64(&mut buf, record.seqno);
    codec::put_u8(&mut buf, op_byte);
    codec::put_u16(&mut buf, key.len() as u16);
    codec::put_u32(&mut buf, val.len() as u32);
    codec::put_bytes(&mut buf, key);
    codec::put_bytes(&mut buf, val);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    codec::put_u32(&mut buf, crc);

    buf
}

/// Reads one record from `r`, returning `Ok(None)` at a clean EOF and
/// `Err` for any tail-torn or corrupted record — the caller interprets
/// `Err` as "stop replaying here", not as a fatal error.
fn decode_record(r: &mut impl Read) -> Result<Option<WalRecord>, ()> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(_) => return Err(()),
    }
    let payload_len = u32::from_be_bytes(len_buf) as usize;

    let mut rest = vec![0u8; payload_len + 4];
    if r.read_exact(&mut rest).is_err() {
        return Err(());
    }

    let (payload, crc_bytes) = rest.split_at(payload_len);
    let stored_crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len_buf);
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(());
    }

    let mut pr = Reader::new(payload);
    let seqno = pr.get_u64().map_err(|_| ())?;
    let op_byte = pr.get_u8().map_err(|_| ())?;
    let key_len = pr.get_u16().map_err(|_| ())? as usize;
    let val_len = pr.get_u32().map_err(|_| ())? as usize;
    let key = pr.get_bytes(key_len).map_err(|_| ())?.to_vec();
    let val = pr.get_bytes(val_len).map_err(|_| ())?.to_vec();

    let op = match op_byte {
        0 => WalOp::Put { key, value: val },
        1 => {
            if !val.is_empty() {
                return Err(());
            }
            WalOp::Delete { key }
        }
        _ => return Err(()),
    };

    Ok(Some(WalRecord { seqno, op }))
}

enum WalCommand {
    Append(Vec<u8>, Sender<Result<(), WalError>>),
    Rotate(PathBuf, Sender<Result<(), WalError>>),
    Shutdown(Sender<()>),
}

/// A durable, append-only log with batched group commit.
///
/// `Wal` owns a single background writer thread that drains enqueued
/// records in batches of up to [`DEFAULT_BATCH_SIZE`], performs one
/// `write` + one `fsync` per batch, then signals every record's
/// completion handle.
pub struct Wal {
    sender: Sender<WalCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
    path: Mutex<PathBuf>,
    batch_size: usize,
}

struct WriterState {
    file: File,
    path: PathBuf,
}

fn writer_loop(receiver: Receiver<WalCommand>, mut state: WriterState, batch_size: usize) {
    'outer: loop {
        let first = match receiver.recv() {
            Ok(c) => c,
            Err(_) => break,
        };

        let mut pending: Vec<(Vec<u8>, Sender<Result<(), WalError>>)> = Vec::new();
        let mut control: Option<WalCommand> = None;

        match first {
            WalCommand::Append(bytes, done) => pending.push((bytes, done)),
            other => control = Some(other),
        }

        if control.is_none() {
            while pending.len() < batch_size {
                match receiver.try_recv() {
                    Ok(WalCommand::Append(bytes, done)) => pending.push((bytes, done)),
                    Ok(other) => {
                        control = Some(other);
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break,
                }
            }
        }

        if !pending.is_empty() {
            let result = flush_batch(&mut state.file, &pending);
            for (_, done) in pending {
                let _ = done.send(result.clone());
            }
        }

        match control {
            None => {}
            Some(WalCommand::Rotate(new_path, done)) => {
                let result = rotate(&mut state, new_path);
                let _ = done.send(result);
            }
            Some(WalCommand::Shutdown(done)) => {
                let _ = state.file.sync_all();
                let _ = done.send(());
                break 'outer;
            }
            Some(WalCommand::Append(..)) => unreachable!("handled above"),
        }
    }
}

fn flush_batch(file: &mut File, batch: &[(Vec<u8>, Sender<Result<(), WalError>>)]) -> Result<(), WalError> {
    for (bytes, _) in batch {
        file.write_all(bytes)?;
    }
    file.sync_all()?;
    debug!(records = batch.len(), "WAL batch committed");
    Ok(())
}

fn rotate(state: &mut WriterState, new_path: PathBuf) -> Result<(), WalError> {
    state.file.sync_all()?;
    let file = OpenOptions::new().create(true).append(true).open(&new_path)?;
    state.file = file;
    state.path = new_path;
    Ok(())
}

impl Wal {
    /// Opens (creating if absent) the WAL segment at `path` and spawns
    /// its dedicated writer thread.
    pub fn open(path: impl AsRef<Path>, batch_size: usize) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (sender, receiver) = channel::bounded(batch_size.max(1));
        let state = WriterState { file, path: path.clone() };
        let thread = std::thread::Builder::new()
            .name("wal-writer".into())
            .spawn(move || writer_loop(receiver, state, batch_size))
            .map_err(WalError::Io)?;

        info!(path = %path.display(), "WAL segment opened");

        Ok(Self {
            sender,
            thread: Mutex::new(Some(thread)),
            path: Mutex::new(path),
            batch_size,
        })
    }

    /// Appends `record`, blocking the caller until its batch is durably
    /// fsync'd.
    pub fn append(&self, record: &WalRecord) -> Result<(), WalError> {
        let bytes = encode_record(record);
        let (done_tx, done_rx) = channel::bounded(1);
        self.sender
            .send(WalCommand::Append(bytes, done_tx))
            .map_err(|_| WalError::WriterGone)?;
        done_rx.recv().map_err(|_| WalError::WriterGone)?
    }

    /// Switches the writer thread to a new segment file at `new_path`,
    /// serialized with any in-flight batch.
    pub fn rotate_to(&self, new_path: impl AsRef<Path>) -> Result<(), WalError> {
        let new_path = new_path.as_ref().to_path_buf();
        let (done_tx, done_rx) = channel::bounded(1);
        self.sender
            .send(WalCommand::Rotate(new_path.clone(), done_tx))
            .map_err(|_| WalError::WriterGone)?;
        done_rx.recv().map_err(|_| WalError::WriterGone)??;
        *self.path.lock().unwrap() = new_path;
        Ok(())
    }

    /// Enqueues the shutdown sentinel and waits for the writer thread to
    /// drain and exit. Idempotent.
    pub fn close(&self) -> Result<(), WalError> {
        let mut guard = self.thread.lock().unwrap();
        let Some(thread) = guard.take() else {
            return Ok(());
        };
        let (done_tx, done_rx) = channel::bounded(1);
        if self.sender.send(WalCommand::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
        thread.join().map_err(|_| WalError::Internal("WAL writer thread panicked".into()))?;
        Ok(())
    }

    /// Replays every well-formed record from `path` in order. Stops at
    /// (and does not report as an error) the first truncated or
    /// corrupted record — that tail is treated as "in flight when the
    /// process crashed".
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<WalRecord>, WalError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut out = Vec::new();

        loop {
            match decode_record(&mut reader) {
                Ok(Some(record)) => out.push(record),
                Ok(None) => break,
                Err(()) => {
                    warn!(path = %path.display(), records = out.len(), "WAL replay stopped at torn/corrupt tail");
                    break;
                }
            }
        }
        Ok(out)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn current_path(&self) -> PathBuf {
        self.path.lock().unwrap().clone()
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_replay_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.log");
        let wal = Wal::open(&path, 4).unwrap();

        for i in 0..10u64 {
            wal.append(&WalRecord {
                seqno: i + 1,
                op: WalOp::Put { key: format!("k{i}").into_bytes(), value: format!("v{i}").into_bytes() },
            })
            .unwrap();
        }
        wal.append(&WalRecord { seqno: 11, op: WalOp::Delete { key: b"k3".to_vec() } }).unwrap();
        wal.close().unwrap();

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 11);
        assert_eq!(records[0].seqno, 1);
        assert_eq!(records[10].op, WalOp::Delete { key: b"k3".to_vec() });
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000002.log");
        let wal = Wal::open(&path, 256).unwrap();
        for i in 0..5u64 {
            wal.append(&WalRecord {
                seqno: i + 1,
                op: WalOp::Put { key: format!("k{i}").into_bytes(), value: b"v".to_vec() },
            })
            .unwrap();
        }
        wal.close().unwrap();

        // Corrupt the last byte to simulate a crash mid-write.
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 4);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.log");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn rotate_starts_a_fresh_segment() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("000001.log");
        let second = dir.path().join("000002.log");
        let wal = Wal::open(&first, 256).unwrap();
        wal.append(&WalRecord { seqno: 1, op: WalOp::Put { key: b"a".to_vec(), value: b"1".to_vec() } }).unwrap();
        wal.rotate_to(&second).unwrap();
        wal.append(&WalRecord { seqno: 2, op: WalOp::Put { key: b"b".to_vec(), value: b"2".to_vec() } }).unwrap();
        wal.close().unwrap();

        assert_eq!(Wal::replay(&first).unwrap().len(), 1);
        assert_eq!(Wal::replay(&second).unwrap().len(), 1);
    }
}
