//! Persistent store implementations.
//!
//! Both stores share one write-ahead log and one data directory:
//! - an in-memory index serves every read
//! - every mutation is appended to the WAL before it touches the index
//! - compaction folds the indexes into a snapshot and empties the WAL

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::credential::{CredentialId, CredentialRecord};
use crate::storage::traits::{CommandLedger, CredentialStore, StoreError};

use super::file_lock::DirLock;
use super::snapshot::{self, SnapshotData};
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

/// File name of the write-ahead log inside the data directory.
const WAL_FILE: &str = "state.wal";

type CredentialIndex = BTreeMap<CredentialId, CredentialRecord>;
type LedgerIndex = HashMap<String, DateTime<Utc>>;

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

fn io_err(context: &str, e: &IoError) -> StoreError {
    if e.kind() == ErrorKind::InvalidData {
        StoreError::Corrupted {
            message: format!("{context}: {e}"),
        }
    } else {
        StoreError::unavailable(format!("{context}: {e}"))
    }
}

struct Shared {
    dir: PathBuf,
    _lock: DirLock,
    wal: WriteAheadLog,
    credentials: RwLock<CredentialIndex>,
    ledger: RwLock<LedgerIndex>,
    compaction: Mutex<()>,
    config: PersistentConfig,
}

impl Shared {
    fn read_both(
        &self,
    ) -> Result<(RwLockReadGuard<'_, CredentialIndex>, RwLockReadGuard<'_, LedgerIndex>), StoreError>
    {
        // Credentials before ledger; writers only ever hold one of the two.
        let credentials = self.credentials.read().map_err(|_| lock_err("compaction.credentials"))?;
        let ledger = self.ledger.read().map_err(|_| lock_err("compaction.ledger"))?;
        Ok((credentials, ledger))
    }

    /// Writes a snapshot and truncates the WAL.
    ///
    /// Both index read locks are held throughout, so no mutation can land
    /// in the WAL between the snapshot and the truncation.
    fn compact(&self, force: bool) -> Result<CompactionResult, StoreError> {
        let _guard = self.compaction.lock().map_err(|_| lock_err("compaction"))?;
        let (credentials, ledger) = self.read_both()?;

        let wal_size_before = self.wal.size_bytes().map_err(|e| io_err("WAL size", &e))?;
        if !force && self.wal.current_sequence() == 0 {
            return Ok(CompactionResult {
                entries_compacted: 0,
                snapshot_path: None,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let data = SnapshotData {
            created_at: Some(Utc::now()),
            credentials: credentials.clone(),
            ledger: ledger.clone(),
        };
        let entries_compacted = data.entry_count();

        let snapshot_path =
            snapshot::write(&self.dir, &data).map_err(|e| io_err("failed to write snapshot", &e))?;
        self.wal.truncate().map_err(|e| io_err("failed to truncate WAL", &e))?;
        let wal_size_after = self.wal.size_bytes().map_err(|e| io_err("WAL size", &e))?;

        info!(
            entries = entries_compacted,
            wal_size_before,
            wal_size_after,
            "compacted gateway state"
        );

        Ok(CompactionResult {
            entries_compacted,
            snapshot_path: Some(snapshot_path),
            wal_size_before,
            wal_size_after,
        })
    }

    /// Compacts once the WAL outgrows its limit. Failures are logged and
    /// left for the next mutation to retry; the WAL still holds the data.
    fn maybe_compact(&self) {
        let Ok(size) = self.wal.size_bytes() else {
            return;
        };
        if size <= self.config.max_wal_size {
            return;
        }
        if let Err(e) = self.compact(false) {
            warn!(error = %e, wal_size = size, "automatic compaction failed");
        }
    }
}

/// Persistent credential store handle.
#[derive(Clone)]
pub struct PersistentCredentialStore {
    shared: Arc<Shared>,
}

impl CredentialStore for PersistentCredentialStore {
    fn upsert(&self, record: CredentialRecord) -> Result<(), StoreError> {
        {
            let mut index = self
                .shared
                .credentials
                .write()
                .map_err(|_| lock_err("credentials.upsert"))?;
            self.shared
                .wal
                .append(WalEntryKind::CredentialUpsert(record.clone()))
                .map_err(|e| io_err("WAL append failed", &e))?;
            index.insert(record.credential_id.clone(), record);
        }
        self.shared.maybe_compact();
        Ok(())
    }

    fn remove(&self, id: &CredentialId) -> Result<Option<CredentialRecord>, StoreError> {
        let removed = {
            let mut index = self
                .shared
                .credentials
                .write()
                .map_err(|_| lock_err("credentials.remove"))?;
            if !index.contains_key(id) {
                return Ok(None);
            }
            self.shared
                .wal
                .append(WalEntryKind::CredentialRemove { id: id.clone() })
                .map_err(|e| io_err("WAL append failed", &e))?;
            index.remove(id)
        };
        self.shared.maybe_compact();
        Ok(removed)
    }

    fn lookup(&self, id: &CredentialId) -> Result<Option<CredentialRecord>, StoreError> {
        let index = self
            .shared
            .credentials
            .read()
            .map_err(|_| lock_err("credentials.lookup"))?;
        Ok(index.get(id).cloned())
    }

    fn snapshot(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let index = self
            .shared
            .credentials
            .read()
            .map_err(|_| lock_err("credentials.snapshot"))?;
        Ok(index.values().cloned().collect())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let index = self
            .shared
            .credentials
            .read()
            .map_err(|_| lock_err("credentials.len"))?;
        Ok(index.len())
    }
}

/// Persistent command ledger handle.
#[derive(Clone)]
pub struct PersistentCommandLedger {
    shared: Arc<Shared>,
}

impl CommandLedger for PersistentCommandLedger {
    fn contains(&self, command_id: &str) -> Result<bool, StoreError> {
        let index = self.shared.ledger.read().map_err(|_| lock_err("ledger.contains"))?;
        Ok(index.contains_key(command_id))
    }

    fn record(&self, command_id: &str, actuated_at: DateTime<Utc>) -> Result<bool, StoreError> {
        {
            let mut index = self.shared.ledger.write().map_err(|_| lock_err("ledger.record"))?;
            if index.contains_key(command_id) {
                return Ok(false);
            }
            self.shared
                .wal
                .append(WalEntryKind::CommandActuated {
                    command_id: command_id.to_string(),
                    actuated_at,
                })
                .map_err(|e| io_err("WAL append failed", &e))?;
            index.insert(command_id.to_string(), actuated_at);
        }
        self.shared.maybe_compact();
        Ok(true)
    }

    fn actuated_at(&self, command_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let index = self.shared.ledger.read().map_err(|_| lock_err("ledger.actuated_at"))?;
        Ok(index.get(command_id).copied())
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let pruned = {
            let mut index = self.shared.ledger.write().map_err(|_| lock_err("ledger.prune"))?;
            if !index.values().any(|at| *at < cutoff) {
                return Ok(0);
            }
            self.shared
                .wal
                .append(WalEntryKind::LedgerPrune { before: cutoff })
                .map_err(|e| io_err("WAL append failed", &e))?;
            let before = index.len();
            index.retain(|_, at| *at >= cutoff);
            before - index.len()
        };
        self.shared.maybe_compact();
        Ok(pruned)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let index = self.shared.ledger.read().map_err(|_| lock_err("ledger.len"))?;
        Ok(index.len())
    }
}

/// Both persistent stores over one data directory.
///
/// The directory stays locked until every handle is dropped.
pub struct PersistentStores {
    /// Credential cache.
    pub credentials: PersistentCredentialStore,
    /// Command dedup ledger.
    pub ledger: PersistentCommandLedger,
    shared: Arc<Shared>,
}

impl PersistentStores {
    /// Opens or creates the stores in `dir`.
    ///
    /// Loads the latest snapshot and replays the WAL on top of it. A WAL
    /// with a damaged or cut tail is replayed up to the damage and then
    /// compacted right away, so new appends never land after garbage.
    ///
    /// # Errors
    /// - `StoreError::Locked` if another process holds the directory
    /// - `StoreError::Corrupted` if the snapshot fails validation
    /// - `StoreError::Unavailable` for any other I/O failure
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| io_err("failed to create data directory", &e))?;

        let lock = DirLock::acquire(dir).map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock {
                StoreError::Locked {
                    message: format!("{}: {e}", dir.display()),
                }
            } else {
                io_err("failed to acquire lock", &e)
            }
        })?;

        match snapshot::remove_stale_temps(dir) {
            Ok(0) => {}
            Ok(n) => debug!(removed = n, "removed stale snapshot temp files"),
            Err(e) => warn!(error = %e, "failed to scan for stale snapshot temp files"),
        }

        let data = snapshot::load(dir).map_err(|e| io_err("failed to load snapshot", &e))?;
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| io_err("failed to open WAL", &e))?;

        let shared = Arc::new(Shared {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            credentials: RwLock::new(data.credentials),
            ledger: RwLock::new(data.ledger),
            compaction: Mutex::new(()),
            config,
        });

        let replay = replay_wal(&shared)?;
        info!(
            dir = %dir.display(),
            replayed = replay.applied,
            damaged = replay.damaged,
            "opened gateway state"
        );
        if replay.damaged {
            shared.compact(true)?;
        }

        Ok(Self {
            credentials: PersistentCredentialStore {
                shared: Arc::clone(&shared),
            },
            ledger: PersistentCommandLedger {
                shared: Arc::clone(&shared),
            },
            shared,
        })
    }

    /// Folds the WAL into a fresh snapshot.
    ///
    /// Safe to call at any time: if it fails partway the WAL still holds
    /// every mutation and is replayed on the next open.
    pub fn compact(&self) -> Result<CompactionResult, StoreError> {
        self.shared.compact(false)
    }

    /// Current WAL size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.shared.wal.size_bytes().unwrap_or(0)
    }

    /// The data directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }
}

impl std::fmt::Debug for PersistentStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStores")
            .field("dir", &self.shared.dir)
            .finish_non_exhaustive()
    }
}

/// Result of a compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Number of entries written to the snapshot.
    pub entries_compacted: u64,
    /// Path of the snapshot, if one was written.
    pub snapshot_path: Option<PathBuf>,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

struct ReplayStats {
    applied: usize,
    damaged: bool,
}

fn replay_wal(shared: &Shared) -> Result<ReplayStats, StoreError> {
    let iter = shared.wal.iter().map_err(|e| io_err("failed to iterate WAL", &e))?;
    let mut credentials = shared.credentials.write().map_err(|_| lock_err("replay.credentials"))?;
    let mut ledger = shared.ledger.write().map_err(|_| lock_err("replay.ledger"))?;

    let mut stats = ReplayStats {
        applied: 0,
        damaged: false,
    };
    for entry in iter {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(after = stats.applied, error = %e, "WAL replay stopped at damaged entry");
                stats.damaged = true;
                break;
            }
        };

        match entry.kind {
            WalEntryKind::CredentialUpsert(record) => {
                credentials.insert(record.credential_id.clone(), record);
            }
            WalEntryKind::CredentialRemove { id } => {
                credentials.remove(&id);
            }
            WalEntryKind::CommandActuated {
                command_id,
                actuated_at,
            } => {
                ledger.entry(command_id).or_insert(actuated_at);
            }
            WalEntryKind::LedgerPrune { before } => {
                ledger.retain(|_, at| *at >= before);
            }
        }
        stats.applied += 1;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn small_config() -> PersistentConfig {
        PersistentConfig {
            max_wal_size: 4 * 1024,
            sync_on_write: false,
        }
    }

    #[test]
    fn test_open_write_reopen() {
        let dir = tempdir().unwrap();
        let t0 = Utc::now();
        {
            let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
            stores.credentials.upsert(CredentialRecord::new("a", "r1", "Main", t0)).unwrap();
            stores.credentials.upsert(CredentialRecord::new("b", "r2", "Main", t0)).unwrap();
            stores.credentials.remove(&CredentialId::new("a")).unwrap();
            assert!(stores.ledger.record("c1", t0).unwrap());
        }

        let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
        assert_eq!(stores.credentials.len().unwrap(), 1);
        assert!(stores.credentials.lookup(&CredentialId::new("b")).unwrap().is_some());
        assert!(!stores.ledger.record("c1", t0).unwrap());
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();

        let err = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap_err();
        assert!(matches!(err, StoreError::Locked { .. }));
    }

    #[test]
    fn test_compaction_empty_wal() {
        let dir = tempdir().unwrap();
        let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();

        let result = stores.compact().unwrap();
        assert_eq!(result.entries_compacted, 0);
        assert!(result.snapshot_path.is_none());
    }

    #[test]
    fn test_data_survives_compaction_and_reopen() {
        let dir = tempdir().unwrap();
        let t0 = Utc::now();
        {
            let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
            for i in 0..10 {
                stores
                    .credentials
                    .upsert(CredentialRecord::new(format!("tag{i}"), "r", "Main", t0))
                    .unwrap();
            }
            stores.ledger.record("c1", t0).unwrap();

            let result = stores.compact().unwrap();
            assert_eq!(result.entries_compacted, 11);
            assert!(result.wal_size_after < result.wal_size_before);

            stores.credentials.remove(&CredentialId::new("tag0")).unwrap();
        }

        let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
        assert_eq!(stores.credentials.len().unwrap(), 9);
        assert!(stores.ledger.contains("c1").unwrap());
    }

    #[test]
    fn test_wal_over_limit_compacts_automatically() {
        let dir = tempdir().unwrap();
        let stores = PersistentStores::open(dir.path(), small_config()).unwrap();
        let t0 = Utc::now();

        for i in 0..200 {
            stores
                .credentials
                .upsert(CredentialRecord::new(format!("tag{i}"), "resident", "Main", t0))
                .unwrap();
        }

        assert!(stores.wal_size() <= 4 * 1024);
        assert!(snapshot::snapshot_path(dir.path()).exists());
        assert_eq!(stores.credentials.len().unwrap(), 200);
    }

    #[test]
    fn test_prune_survives_reopen() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        {
            let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
            stores.ledger.record("old", now - Duration::hours(48)).unwrap();
            stores.ledger.record("new", now).unwrap();
            assert_eq!(stores.ledger.prune_before(now - Duration::hours(24)).unwrap(), 1);
            assert_eq!(stores.ledger.prune_before(now - Duration::hours(24)).unwrap(), 0);
        }

        let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
        assert_eq!(stores.ledger.len().unwrap(), 1);
        assert!(stores.ledger.contains("new").unwrap());
    }

    #[test]
    fn test_damaged_tail_is_compacted_on_open() {
        let dir = tempdir().unwrap();
        let t0 = Utc::now();
        {
            let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
            stores.credentials.upsert(CredentialRecord::new("a", "r", "Main", t0)).unwrap();
            stores.credentials.upsert(CredentialRecord::new("b", "r", "Main", t0)).unwrap();
        }

        let wal_path = dir.path().join(WAL_FILE);
        let len = fs::metadata(&wal_path).unwrap().len();
        OpenOptions::new().write(true).open(&wal_path).unwrap().set_len(len - 3).unwrap();

        {
            let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
            assert_eq!(stores.credentials.len().unwrap(), 1);
            stores.credentials.upsert(CredentialRecord::new("c", "r", "Main", t0)).unwrap();
        }

        let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
        let ids: Vec<_> = stores
            .credentials
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|r| r.credential_id.to_string())
            .collect();
        assert_eq!(ids, vec!["A", "C"]);
    }
}
