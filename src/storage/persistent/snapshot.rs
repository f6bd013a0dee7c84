//! Compacted snapshot of the persisted state.
//!
//! A snapshot holds the full credential set and command ledger as of a
//! compaction. It is replaced atomically: written to a uniquely named
//! temporary file, fsynced, then renamed over the previous snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::credential::{CredentialId, CredentialRecord};

use super::codec;

/// File name of the live snapshot inside the data directory.
pub const SNAPSHOT_FILE: &str = "state.snap";

/// Everything needed to rebuild the in-memory indexes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotData {
    /// When the snapshot was taken.
    pub created_at: Option<DateTime<Utc>>,
    /// Credential cache.
    pub credentials: BTreeMap<CredentialId, CredentialRecord>,
    /// Command ledger: command id to actuation time.
    pub ledger: HashMap<String, DateTime<Utc>>,
}

impl SnapshotData {
    /// Total number of stored entries.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        (self.credentials.len() + self.ledger.len()) as u64
    }
}

/// Path of the snapshot file in `dir`.
#[must_use]
pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILE)
}

/// Loads the snapshot in `dir`, or empty data if none was ever written.
pub fn load(dir: &Path) -> IoResult<SnapshotData> {
    let path = snapshot_path(dir);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SnapshotData::default()),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let _version = codec::read_header(&mut reader)?;
    codec::decode(&mut reader)
}

/// Writes `data` as the new snapshot in `dir`.
///
/// The previous snapshot stays in place until the rename, so a crash at
/// any point leaves either the old or the new snapshot, never a mix.
pub fn write(dir: &Path, data: &SnapshotData) -> IoResult<PathBuf> {
    let final_path = snapshot_path(dir);
    let temp_path = dir.join(format!("{SNAPSHOT_FILE}.tmp.{}", Uuid::new_v4()));

    let result = write_temp(&temp_path, data).and_then(|()| fs::rename(&temp_path, &final_path));
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    sync_dir(dir);
    Ok(final_path)
}

fn write_temp(path: &Path, data: &SnapshotData) -> IoResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    codec::write_header(&mut writer)?;
    writer.write_all(&codec::encode(data)?)?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    // Persist the rename itself; failure only weakens durability of this
    // one compaction, the WAL still holds the data until truncation.
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Removes temporary files left behind by a crash during [`write`].
pub fn remove_stale_temps(dir: &Path) -> IoResult<usize> {
    let prefix = format!("{SNAPSHOT_FILE}.tmp.");
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let stale = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(&prefix));
        if stale && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
