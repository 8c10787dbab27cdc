//! File persistence for the store.
//!
//! The whole store is written as one CBOR snapshot. A commit writes
//! `<path>.tmp`, syncs it, renames it over `<path>` and syncs the directory,
//! so a crash leaves either the old or the new snapshot, never a mix.
//! `<path>.lock` is held exclusively for as long as the store is open.

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::model::{AuditEntry, RetryTicket, SyncCursor, Tables};
use driftsync_protocol::{ChangeRecord, SyncableRecord};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current on-disk format.
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format_version: u32,
    records: Vec<SyncableRecord>,
    outbox: Vec<ChangeRecord>,
    tickets: Vec<RetryTicket>,
    cursor: Option<SyncCursor>,
    audit: Vec<AuditEntry>,
    next_sequence: u64,
    #[serde(default)]
    audit_sequence: u64,
}

impl Snapshot {
    fn capture(tables: &Tables) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            records: tables.records.values().cloned().collect(),
            outbox: tables.outbox.values().cloned().collect(),
            tickets: tables.tickets.values().cloned().collect(),
            cursor: tables.cursor,
            audit: tables.audit.clone(),
            next_sequence: tables.next_sequence,
            audit_sequence: tables.audit_sequence,
        }
    }

    fn into_tables(self) -> Tables {
        let last_audit = self.audit.last().map_or(0, |entry| entry.sequence);
        Tables {
            records: self.records.into_iter().map(|r| (r.key(), r)).collect(),
            outbox: self.outbox.into_iter().map(|c| (c.key(), c)).collect(),
            tickets: self
                .tickets
                .into_iter()
                .map(|t| (t.change_id.clone(), t))
                .collect(),
            cursor: self.cursor,
            audit: self.audit,
            next_sequence: self.next_sequence,
            audit_sequence: self.audit_sequence.max(last_audit),
        }
    }
}

/// An open, locked snapshot file.
#[derive(Debug)]
pub(crate) struct SnapshotFile {
    path: PathBuf,
    temp_path: PathBuf,
    sync_on_commit: bool,
    _lock_file: File,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl SnapshotFile {
    /// Locks and loads the snapshot at `path`.
    pub(crate) fn open(path: &Path, config: &StoreConfig) -> StoreResult<(Self, Tables)> {
        let exists = path.exists();
        if !exists && !config.create_if_missing {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let lock_path = sibling(path, ".lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(path.to_path_buf()));
        }

        let file = Self {
            path: path.to_path_buf(),
            temp_path: sibling(path, ".tmp"),
            sync_on_commit: config.sync_on_commit,
            _lock_file: lock_file,
        };

        let tables = if exists {
            file.load()?
        } else {
            let tables = Tables::default();
            file.save(&tables)?;
            tables
        };
        Ok((file, tables))
    }

    fn load(&self) -> StoreResult<Tables> {
        let bytes = fs::read(&self.path)?;
        let snapshot: Snapshot = ciborium::from_reader(bytes.as_slice())
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        if snapshot.format_version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedFormat(snapshot.format_version));
        }
        Ok(snapshot.into_tables())
    }

    /// Atomically replaces the snapshot with `tables`.
    pub(crate) fn save(&self, tables: &Tables) -> StoreResult<()> {
        let mut data = Vec::new();
        ciborium::into_writer(&Snapshot::capture(tables), &mut data)
            .map_err(|e| StoreError::Encode(e.to_string()))?;

        let mut file = File::create(&self.temp_path)?;
        file.write_all(&data)?;
        if self.sync_on_commit {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&self.temp_path, &self.path)?;
        if self.sync_on_commit {
            self.sync_directory()?;
        }
        Ok(())
    }

    /// Path of the snapshot.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StoreResult<()> {
        Ok(())
    }
}
