//! Durable change log
//!
//! An ordered key/value store whose only write operation is an atomic batch.
//! The node state is a typed view over it (see `state.rs`).
//!
//! File format: one record per batch
//! `[MAGIC][SEQUENCE][LEN][BATCH JSON][CRC32]`.
//! On open the file is replayed into memory. A torn or corrupted tail record
//! ends the replay and is cut off, so a batch is either fully there or absent.

use crate::common::{crc32, Error, Result, WalSyncPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: [u8; 4] = [0x43, 0x4C, 0x47, 0x31]; // "CLG1"

/// Largest batch payload; matches the node's request body limit
const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// One edit inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum LogOp {
    Put { key: String, value: Value },
    Delete { key: String },
}

/// Edits committed together or not at all
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    ops: Vec<LogOp>,
}

impl LogBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.ops.push(LogOp::Put {
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(LogOp::Delete { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[LogOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn apply_to(&self, map: &mut BTreeMap<String, Value>) {
        for op in &self.ops {
            match op {
                LogOp::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                LogOp::Delete { key } => {
                    map.remove(key);
                }
            }
        }
    }
}

/// Storage backing a node's change state
pub trait ChangeLog: Send {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Durably apply every edit of `batch` in one atomic step
    fn apply(&mut self, batch: LogBatch) -> Result<()>;

    /// Drop every record
    fn reset(&mut self) -> Result<()>;
}

/// In-memory log (tests, throwaway nodes)
#[derive(Debug, Default)]
pub struct MemoryChangeLog {
    map: BTreeMap<String, Value>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChangeLog for MemoryChangeLog {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.get(key).cloned())
    }

    fn apply(&mut self, batch: LogBatch) -> Result<()> {
        batch.apply_to(&mut self.map);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.map.clear();
        Ok(())
    }
}

/// Append-only file log
pub struct FileChangeLog {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    sync_policy: WalSyncPolicy,
    map: BTreeMap<String, Value>,
}

impl FileChangeLog {
    /// Open or create the log file and replay it
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut map = BTreeMap::new();
        let (next_sequence, valid_len) = Self::replay(&path, |batch| {
            batch.apply_to(&mut map);
            Ok(())
        })?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "Cutting torn tail of change log {} at offset {}",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence,
            sync_policy,
            map,
        })
    }

    /// Replay every complete record in order.
    /// Returns the next sequence number and the length of the valid prefix.
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<(u64, u64)>
    where
        F: FnMut(LogBatch) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut next_sequence = 0;
        let mut valid_len = 0;

        loop {
            match Self::read_record(&mut reader) {
                Ok(Some((sequence, batch, len))) => {
                    callback(batch)?;
                    next_sequence = sequence + 1;
                    valid_len += len;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Change log replay stopped at corrupted record: {}", e);
                    break;
                }
            }
        }

        Ok((next_sequence, valid_len))
    }

    fn read_record<R: Read>(reader: &mut R) -> Result<Option<(u64, LogBatch, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != LOG_MAGIC {
            return Err(Error::Log("Invalid change log magic".into()));
        }

        let mut seq_bytes = [0u8; 8];
        reader.read_exact(&mut seq_bytes)?;
        let sequence = u64::from_le_bytes(seq_bytes);

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        // bounded before allocating: the checksum is verified only after the read
        if len > MAX_RECORD_BYTES {
            return Err(Error::Corrupted(format!(
                "change log record of {} bytes exceeds the {} byte limit",
                len, MAX_RECORD_BYTES
            )));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let mut checksum_data = Vec::with_capacity(12 + len);
        checksum_data.extend_from_slice(&seq_bytes);
        checksum_data.extend_from_slice(&len_bytes);
        checksum_data.extend_from_slice(&payload);

        let computed_checksum = crc32(&checksum_data);
        if computed_checksum != stored_checksum {
            return Err(Error::ChecksumMismatch {
                expected: format!("{:08x}", stored_checksum),
                actual: format!("{:08x}", computed_checksum),
            });
        }

        let batch: LogBatch = serde_json::from_slice(&payload)
            .map_err(|e| Error::Corrupted(format!("undecodable change log batch: {}", e)))?;

        Ok(Some((sequence, batch, (4 + 8 + 4 + len + 4) as u64)))
    }

    fn write_record(&mut self, sequence: u64, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_RECORD_BYTES {
            return Err(Error::Log("change log batch too large".into()));
        }
        let len = payload.len() as u32;

        let mut record = Vec::with_capacity(payload.len() + 20);
        record.extend_from_slice(&LOG_MAGIC);
        record.extend_from_slice(&sequence.to_le_bytes());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(payload);

        let checksum = crc32(&record[4..]);
        record.extend_from_slice(&checksum.to_le_bytes());

        self.writer.write_all(&record)?;
        Ok(())
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            WalSyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_all()?;
            }
            WalSyncPolicy::Interval => {
                self.writer.flush()?;
            }
            WalSyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChangeLog for FileChangeLog {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.get(key).cloned())
    }

    fn apply(&mut self, batch: LogBatch) -> Result<()> {
        let payload = serde_json::to_vec(&batch)?;
        let sequence = self.next_sequence;

        self.write_record(sequence, &payload)?;
        self.maybe_sync()?;

        self.next_sequence += 1;
        batch.apply_to(&mut self.map);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.sync_all()?;
        drop(file);

        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.next_sequence = 0;
        self.map.clear();
        Ok(())
    }
}

impl Drop for FileChangeLog {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Sled-backed log
#[cfg(feature = "sled-backend")]
pub struct SledChangeLog {
    db: sled::Db,
    sync_policy: WalSyncPolicy,
}

#[cfg(feature = "sled-backend")]
impl SledChangeLog {
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db, sync_policy })
    }
}

#[cfg(feature = "sled-backend")]
impl ChangeLog for SledChangeLog {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                Error::Corrupted(format!("undecodable value for {}: {}", key, e))
            })?)),
            None => Ok(None),
        }
    }

    fn apply(&mut self, batch: LogBatch) -> Result<()> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops() {
            match op {
                LogOp::Put { key, value } => {
                    sled_batch.insert(key.as_bytes(), serde_json::to_vec(value)?);
                }
                LogOp::Delete { key } => sled_batch.remove(key.as_bytes()),
            }
        }
        self.db.apply_batch(sled_batch)?;
        if self.sync_policy != WalSyncPolicy::Never {
            self.db.flush()?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }
}
