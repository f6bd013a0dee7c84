//! In-memory storage backend.
//!
//! Thread-safe implementations of the storage traits without durability.
//! Used by tests, benches, and as the reference for the persistent backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::credential::{CredentialId, CredentialRecord};
use crate::storage::traits::{CommandLedger, CredentialStore, StoreError};

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend(format!("poisoned lock: {context}"))
}

/// In-memory credential store.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    records: RwLock<BTreeMap<CredentialId, CredentialRecord>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn upsert(&self, record: CredentialRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| lock_err("credentials.upsert"))?;
        records.insert(record.credential_id.clone(), record);
        Ok(())
    }

    fn remove(&self, id: &CredentialId) -> Result<Option<CredentialRecord>, StoreError> {
        let mut records = self.records.write().map_err(|_| lock_err("credentials.remove"))?;
        Ok(records.remove(id))
    }

    fn lookup(&self, id: &CredentialId) -> Result<Option<CredentialRecord>, StoreError> {
        let records = self.records.read().map_err(|_| lock_err("credentials.lookup"))?;
        Ok(records.get(id).cloned())
    }

    fn snapshot(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let records = self.records.read().map_err(|_| lock_err("credentials.snapshot"))?;
        Ok(records.values().cloned().collect())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let records = self.records.read().map_err(|_| lock_err("credentials.len"))?;
        Ok(records.len())
    }
}

/// In-memory command ledger.
#[derive(Debug, Default)]
pub struct InMemoryCommandLedger {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl CommandLedger for InMemoryCommandLedger {
    fn contains(&self, command_id: &str) -> Result<bool, StoreError> {
        let entries = self.entries.read().map_err(|_| lock_err("ledger.contains"))?;
        Ok(entries.contains_key(command_id))
    }

    fn record(&self, command_id: &str, actuated_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(|_| lock_err("ledger.record"))?;
        if entries.contains_key(command_id) {
            return Ok(false);
        }
        entries.insert(command_id.to_string(), actuated_at);
        Ok(true)
    }

    fn actuated_at(&self, command_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let entries = self.entries.read().map_err(|_| lock_err("ledger.actuated_at"))?;
        Ok(entries.get(command_id).copied())
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().map_err(|_| lock_err("ledger.prune"))?;
        let before = entries.len();
        entries.retain(|_, at| *at >= cutoff);
        Ok(before - entries.len())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let entries = self.entries.read().map_err(|_| lock_err("ledger.len"))?;
        Ok(entries.len())
    }
}

/// Aggregate of in-memory stores.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    /// Credential cache.
    pub credentials: InMemoryCredentialStore,
    /// Command dedup ledger.
    pub ledger: InMemoryCommandLedger,
}
