//! File-backed persistence for keyserver store operations.
//!
//! Operations are appended as JSONL (one record per line) under an
//! exclusive file lock. Every `snapshot_every` records the materialized
//! store is written atomically (temp file + rename) so replay only has to
//! read the tail of the log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::handle::StoreOpsPersistence;
use super::store_ops::{process_store_operations, KeyserverStore, KeyserverStoreOperation};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredOperation {
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub operation: KeyserverStoreOperation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub sequence: u64,
    pub snapshot_at: DateTime<Utc>,
    pub store: KeyserverStore,
}

#[derive(Debug, Clone)]
pub struct FileOpsLog {
    pub log_path: PathBuf,
    pub snapshot_path: PathBuf,
    /// Snapshot after every N records (0 = disabled).
    pub snapshot_every: u64,
}

impl FileOpsLog {
    pub fn new(log_path: PathBuf, snapshot_path: PathBuf, snapshot_every: u64) -> Self {
        Self {
            log_path,
            snapshot_path,
            snapshot_every,
        }
    }

    /// Log and snapshot stored side by side in `dir`.
    pub fn in_dir(dir: &Path, snapshot_every: u64) -> Self {
        Self::new(
            dir.join("keyserver-ops.jsonl"),
            dir.join("keyserver-snapshot.json"),
            snapshot_every,
        )
    }

    /// Appends `ops` and returns the sequence of the last record written.
    pub fn append(&self, ops: &[KeyserverStoreOperation]) -> Result<u64> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open ops log: {}", self.log_path.display()))?;
        file.lock_exclusive()
            .context("Failed to lock ops log for writing")?;

        let mut sequence = read_last_sequence(&file)?;
        for op in ops {
            sequence += 1;
            let record = StoredOperation {
                sequence,
                recorded_at: Utc::now(),
                operation: op.clone(),
            };
            let line = serde_json::to_string(&record)?;
            writeln!(file, "{}", line)?;
        }
        file.flush()?;
        file.sync_all()?;
        Ok(sequence)
    }

    /// Rebuilds the store from the latest snapshot plus the records after it.
    pub fn load(&self) -> Result<KeyserverStore> {
        let (mut store, snapshot_sequence) = match load_snapshot(&self.snapshot_path)? {
            Some(snapshot) => (snapshot.store, snapshot.sequence),
            None => (KeyserverStore::default(), 0),
        };
        let tail: Vec<KeyserverStoreOperation> = self
            .read_records()?
            .into_iter()
            .filter(|record| record.sequence > snapshot_sequence)
            .map(|record| record.operation)
            .collect();
        store = process_store_operations(&store, &tail);
        Ok(store)
    }

    pub fn read_records(&self) -> Result<Vec<StoredOperation>> {
        let file = match File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to open ops log: {}", self.log_path.display())
                })
            }
        };
        file.lock_shared()
            .context("Failed to lock ops log for reading")?;

        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: StoredOperation = serde_json::from_str(&line)
                .with_context(|| format!("Corrupt ops log record at line {}", idx + 1))?;
            records.push(record);
        }
        Ok(records)
    }

    fn should_snapshot(&self, first: u64, last: u64) -> bool {
        if self.snapshot_every == 0 {
            return false;
        }
        (first..=last).any(|seq| seq % self.snapshot_every == 0)
    }
}

impl StoreOpsPersistence for FileOpsLog {
    fn persist(&self, ops: &[KeyserverStoreOperation], store: &KeyserverStore) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let last = self.append(ops)?;
        let first = last + 1 - ops.len() as u64;
        if self.should_snapshot(first, last) {
            save_snapshot(
                &self.snapshot_path,
                &StoredSnapshot {
                    sequence: last,
                    snapshot_at: Utc::now(),
                    store: store.clone(),
                },
            )?;
        }
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<Option<StoredSnapshot>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read snapshot: {}", path.display()))
        }
    };
    let snapshot = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;
    Ok(Some(snapshot))
}

fn save_snapshot(path: &Path, snapshot: &StoredSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string(snapshot)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;
    Ok(())
}

fn read_last_sequence(file: &File) -> Result<u64> {
    let mut reader = BufReader::new(file.try_clone()?);
    reader.seek(SeekFrom::Start(0))?;
    let mut last_sequence = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: StoredOperation = serde_json::from_str(&line)?;
        last_sequence = record.sequence;
    }
    Ok(last_sequence)
}

#[cfg(test)]
#[path = "tests/ops_log_tests.rs"]
mod tests;
