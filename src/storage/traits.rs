//! Abstract storage traits for the gateway.
//!
//! Two stores live on the edge node:
//! - the credential store, a read cache of the remote credential set
//!   written only by the sync engine
//! - the command ledger, the dedup record of actuated command ids written
//!   only by the command processor
//!
//! Every mutator is a single-key operation and must be atomic with respect
//! to concurrent readers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::credential::{CredentialId, CredentialRecord};

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Persistence I/O failed; the operation may succeed later.
    #[error("Store unavailable: {message}")]
    Unavailable {
        message: String,
    },

    /// Persisted data failed validation.
    #[error("Store corrupted: {message}")]
    Corrupted {
        message: String,
    },

    /// Another process holds the data directory.
    #[error("Store locked: {message}")]
    Locked {
        message: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Returns true for the retryable `StoreUnavailable` case.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Storage trait for the credential cache.
pub trait CredentialStore: Send + Sync {
    /// Inserts or replaces the record keyed by its credential id.
    fn upsert(&self, record: CredentialRecord) -> Result<(), StoreError>;

    /// Removes a record, returning it if it was present.
    fn remove(&self, id: &CredentialId) -> Result<Option<CredentialRecord>, StoreError>;

    /// Looks up a record.
    fn lookup(&self, id: &CredentialId) -> Result<Option<CredentialRecord>, StoreError>;

    /// All records, ordered by credential id.
    fn snapshot(&self) -> Result<Vec<CredentialRecord>, StoreError>;

    /// Number of records.
    fn len(&self) -> Result<usize, StoreError>;

    /// Returns true if the store holds no records.
    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Storage trait for the command dedup ledger.
pub trait CommandLedger: Send + Sync {
    /// Returns true if the command id was already actuated.
    fn contains(&self, command_id: &str) -> Result<bool, StoreError>;

    /// Records an actuation. Returns false, leaving the ledger unchanged,
    /// if the id is already present.
    ///
    /// The check and the insert happen under one write lock so concurrent
    /// callers cannot both win.
    fn record(&self, command_id: &str, actuated_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// When the command id was actuated, if it was.
    fn actuated_at(&self, command_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Drops entries actuated before `cutoff`. Returns how many were dropped.
    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Number of entries.
    fn len(&self) -> Result<usize, StoreError>;
}

/// Read-only view over a credential store.
///
/// The access evaluator only ever holds this view, so the sync engine
/// stays the single writer.
#[derive(Clone)]
pub struct CredentialView {
    inner: Arc<dyn CredentialStore>,
}

impl CredentialView {
    /// Wraps a store.
    #[must_use]
    pub fn new(inner: Arc<dyn CredentialStore>) -> Self {
        Self { inner }
    }

    /// Looks up a record.
    pub fn lookup(&self, id: &CredentialId) -> Result<Option<CredentialRecord>, StoreError> {
        self.inner.lookup(id)
    }

    /// All records, ordered by credential id.
    pub fn snapshot(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        self.inner.snapshot()
    }

    /// Number of records.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.inner.len()
    }
}

impl std::fmt::Debug for CredentialView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialView").finish_non_exhaustive()
    }
}
