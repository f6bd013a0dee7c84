//! Persistent storage backend.
//!
//! Durable, crash-safe storage for the credential cache and the command
//! ledger:
//! - write-ahead log shared by both stores
//! - snapshot compaction once the log grows past a limit
//! - CRC32 checksums for corruption detection
//! - an exclusive lock on the data directory
//!
//! # Layout
//!
//! ```text
//! <data dir>/
//!   gatewarden.lock   exclusive process lock
//!   state.snap        last compacted snapshot
//!   state.wal         mutations since the snapshot
//! ```

mod codec;
mod file_lock;
mod snapshot;
mod stores;
mod wal;

pub use file_lock::DirLock;
pub use snapshot::SnapshotData;
pub use stores::{CompactionResult, PersistentCommandLedger, PersistentCredentialStore, PersistentStores};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::storage::traits::StoreError;

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// WAL size in bytes that triggers compaction.
    pub max_wal_size: u64,
    /// Whether to fsync after every write.
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 16 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // below this compaction would run on nearly every write

    /// Checks the configuration.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ConfigError::invalid(
                "store.max_wal_size",
                format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            ));
        }
        Ok(self)
    }
}

/// Opens or creates the gateway's persistent stores in `path`.
///
/// # Errors
/// - `StoreError::Backend` if the configuration is invalid
/// - any error from [`PersistentStores::open`]
///
/// # Example
/// ```no_run
/// use gatewarden::storage::persistent::open_database;
/// use gatewarden::storage::CredentialStore;
///
/// let stores = open_database("/var/lib/gatewarden", None)?;
/// println!("{} cached credentials", stores.credentials.len()?);
/// # Ok::<(), gatewarden::storage::StoreError>(())
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<PersistentStores, StoreError> {
    let cfg = config
        .unwrap_or_default()
        .validate()
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    PersistentStores::open(path.as_ref(), cfg)
}
