//! Write-ahead log for the credential store and the command ledger.
//!
//! Every mutation is appended (and optionally fsynced) before it becomes
//! visible to readers. On open the log is replayed on top of the latest
//! snapshot.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-framed WalEntry]
//! [ENTRY 2: codec-framed WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::credential::{CredentialId, CredentialRecord};

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number since the last truncation.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The mutation being logged.
    pub kind: WalEntryKind,
}

/// The mutation carried by a WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// A credential record was inserted or replaced.
    CredentialUpsert(CredentialRecord),
    /// A credential record was removed.
    CredentialRemove {
        /// Removed key.
        id: CredentialId,
    },
    /// A command was recorded in the ledger.
    CommandActuated {
        /// Command id.
        command_id: String,
        /// When it was actuated.
        actuated_at: DateTime<Utc>,
    },
    /// Ledger entries older than `before` were dropped.
    LedgerPrune {
        /// Retention cut-off.
        before: DateTime<Utc>,
    },
}

struct WalState {
    writer: BufWriter<File>,
    sequence: u64,
}

/// Append-only write-ahead log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Opens or creates a WAL file.
    ///
    /// Existing files are scanned to recover the last good sequence number.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let sequence = if file.metadata()?.len() >= codec::HEADER_LEN {
            Self::last_good_sequence(path)?
        } else {
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                writer: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<std::sync::MutexGuard<'_, WalState>> {
        self.state
            .lock()
            .map_err(|_| std::io::Error::new(ErrorKind::Other, "poisoned lock: wal"))
    }

    /// Appends an entry and returns its sequence number.
    ///
    /// The sequence only advances once the bytes are flushed (and synced
    /// when configured), so a failed append leaves the counter untouched.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut state = self.lock()?;
        let sequence = state.sequence + 1;
        let entry = WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        };
        let encoded = codec::encode(&entry)?;

        state.writer.write_all(&encoded)?;
        state.writer.flush()?;
        if self.sync_on_write {
            state.writer.get_ref().sync_data()?;
        }

        state.sequence = sequence;
        Ok(sequence)
    }

    /// Iterates over all entries, for replay.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last appended entry.
    pub fn current_sequence(&self) -> u64 {
        self.lock().map(|s| s.sequence).unwrap_or(0)
    }

    /// WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Empties the log, leaving only the header.
    ///
    /// Only call this after the state it covers has been written to a
    /// durable snapshot.
    pub fn truncate(&self) -> IoResult<()> {
        let mut state = self.lock()?;
        state.writer.flush()?;
        {
            let file = state.writer.get_mut();
            file.set_len(0)?;
            codec::write_header(file)?;
            if self.sync_on_write {
                file.sync_all()?;
            }
        }
        state.sequence = 0;
        Ok(())
    }

    fn last_good_sequence(path: &Path) -> IoResult<u64> {
        let mut last = 0;
        for entry in WalIterator::new(path)? {
            match entry {
                Ok(entry) => last = entry.sequence,
                Err(e) => {
                    warn!(path = %path.display(), after_sequence = last, error = %e, "WAL scan stopped at damaged entry");
                    break;
                }
            }
        }
        Ok(last)
    }
}

/// Iterator over WAL entries.
///
/// Yields an error for a damaged entry, including a frame cut short by a
/// crash mid-write, and stops after it.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
    done: bool,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let _version = codec::read_header(&mut reader)?;
        Ok(Self {
            reader,
            file_size,
            done: false,
        })
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.stream_position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn upsert(id: &str) -> WalEntryKind {
        WalEntryKind::CredentialUpsert(CredentialRecord::new(id, "r", "Main", Utc::now()))
    }

    #[test]
    fn test_append_and_replay_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");

        {
            let wal = WriteAheadLog::open(&path, true).unwrap();
            wal.append(upsert("a")).unwrap();
            wal.append(WalEntryKind::CommandActuated {
                command_id: "c1".to_string(),
                actuated_at: Utc::now(),
            })
            .unwrap();
            assert_eq!(wal.current_sequence(), 2);
        }

        let wal = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(wal.current_sequence(), 2);

        let entries: Vec<_> = wal.iter().unwrap().map(Result::unwrap).collect();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, WalEntryKind::CredentialUpsert(_)));
        assert!(matches!(entries[1].kind, WalEntryKind::CommandActuated { .. }));
    }

    #[test]
    fn test_truncate_keeps_header_and_accepts_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");
        let wal = WriteAheadLog::open(&path, false).unwrap();

        wal.append(upsert("a")).unwrap();
        wal.append(upsert("b")).unwrap();
        wal.truncate().unwrap();

        assert_eq!(wal.size_bytes().unwrap(), codec::HEADER_LEN);
        assert_eq!(wal.current_sequence(), 0);

        assert_eq!(wal.append(upsert("c")).unwrap(), 1);
        let entries: Vec<_> = wal.iter().unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_cut_tail_is_reported_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.wal");
        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            wal.append(upsert("a")).unwrap();
            wal.append(upsert("b")).unwrap();
        }

        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 4).unwrap();

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence(), 1);

        let results: Vec<_> = wal.iter().unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
