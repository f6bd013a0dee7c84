//! Sync engine: folds credential change events into the local store.
//!
//! Conflict policy is last-write-wins on `last_updated`. Removals carry no
//! timestamp, so the engine remembers the timestamp of each record it
//! removed (a tombstone) and ignores re-adds that are not newer. Every
//! subscription opens with a snapshot; when it completes, local records
//! the snapshot did not mention are removed, which recovers deletions
//! missed while disconnected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backoff::{retry_store, BackoffPolicy};
use crate::credential::{CredentialId, CredentialRecord};
use crate::error::GatewayResult;
use crate::feed::ChangeEvent;
use crate::shutdown::ShutdownSignal;
use crate::storage::{CredentialStore, StoreError};
use crate::watchdog::FeedHandler;

/// Sync engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Backoff between store retries.
    pub retry: BackoffPolicy,
    /// Attempts before a store failure becomes fatal.
    pub max_attempts: u32,
    /// Stored ids are truncated to this many characters, matching what the
    /// tag reader reports.
    pub key_len: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: BackoffPolicy::default(),
            max_attempts: 8,
            key_len: None,
        }
    }
}

/// What applying one event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The record was inserted or replaced.
    Upserted,
    /// The record was removed.
    Removed,
    /// Stale, duplicate, or nothing to remove.
    Ignored,
    /// A snapshot completed; `removed` local records were absent from it.
    Reconciled {
        /// Records removed by the pass.
        removed: usize,
    },
}

/// Applies change events to the credential store. The only writer of it.
pub struct SyncEngine {
    store: Arc<dyn CredentialStore>,
    config: SyncConfig,
    shutdown: ShutdownSignal,
    tombstones: HashMap<CredentialId, DateTime<Utc>>,
    snapshot_ids: Option<HashSet<CredentialId>>,
}

impl SyncEngine {
    /// Creates an engine over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, config: SyncConfig, shutdown: ShutdownSignal) -> Self {
        Self {
            store,
            config,
            shutdown,
            tombstones: HashMap::new(),
            snapshot_ids: None,
        }
    }

    /// Marks the start of a fresh subscription. Ids seen from now until
    /// `SnapshotComplete` form the snapshot set used for reconciliation.
    pub fn begin_subscription(&mut self) {
        self.snapshot_ids = Some(HashSet::new());
    }

    /// Returns true between `begin_subscription` and `SnapshotComplete`.
    #[must_use]
    pub const fn in_snapshot(&self) -> bool {
        self.snapshot_ids.is_some()
    }

    /// Applies one event.
    ///
    /// # Errors
    /// `FatalStoreFailure` once store retries are exhausted, `Shutdown` if
    /// shutdown fires while waiting to retry, or the store error itself if
    /// it is not retryable.
    pub fn apply(&mut self, event: ChangeEvent) -> GatewayResult<ApplyOutcome> {
        match event {
            ChangeEvent::Added(record) | ChangeEvent::Modified(record) => self.apply_upsert(record),
            ChangeEvent::Removed(id) => self.apply_remove(id.keyed(self.config.key_len)),
            ChangeEvent::SnapshotComplete => self.complete_snapshot(),
        }
    }

    fn with_retry<T>(
        &self,
        operation: &str,
        mut f: impl FnMut(&dyn CredentialStore) -> Result<T, StoreError>,
    ) -> GatewayResult<T> {
        let store = self.store.as_ref();
        retry_store(
            self.config.retry,
            self.config.max_attempts,
            &self.shutdown,
            operation,
            || f(store),
        )
    }

    fn apply_upsert(&mut self, mut record: CredentialRecord) -> GatewayResult<ApplyOutcome> {
        record.credential_id = record.credential_id.keyed(self.config.key_len);
        let id = record.credential_id.clone();
        if let Some(seen) = self.snapshot_ids.as_mut() {
            seen.insert(id.clone());
        }

        if let Some(removed_at) = self.tombstones.get(&id) {
            if record.last_updated <= *removed_at {
                debug!(credential = %id, "ignoring re-add older than removal");
                return Ok(ApplyOutcome::Ignored);
            }
        }

        let current = self.with_retry("credentials.lookup", |s| s.lookup(&id))?;
        if let Some(current) = current {
            if !record.supersedes(&current) {
                debug!(credential = %id, "ignoring stale or duplicate update");
                return Ok(ApplyOutcome::Ignored);
            }
        }

        self.with_retry("credentials.upsert", |s| s.upsert(record.clone()))?;
        self.tombstones.remove(&id);
        debug!(credential = %id, active = record.active, "credential upserted");
        Ok(ApplyOutcome::Upserted)
    }

    fn apply_remove(&mut self, id: CredentialId) -> GatewayResult<ApplyOutcome> {
        if let Some(seen) = self.snapshot_ids.as_mut() {
            seen.remove(&id);
        }

        let removed = self.with_retry("credentials.remove", |s| s.remove(&id))?;
        match removed {
            Some(record) => {
                self.tombstones.insert(id.clone(), record.last_updated);
                debug!(credential = %id, "credential removed");
                Ok(ApplyOutcome::Removed)
            }
            None => Ok(ApplyOutcome::Ignored),
        }
    }

    fn complete_snapshot(&mut self) -> GatewayResult<ApplyOutcome> {
        let Some(seen) = self.snapshot_ids.take() else {
            debug!("snapshot marker outside a fresh subscription");
            return Ok(ApplyOutcome::Ignored);
        };

        let local = self.with_retry("credentials.snapshot", |s| s.snapshot())?;
        let mut removed = 0;
        for record in local {
            if seen.contains(&record.credential_id) {
                continue;
            }
            let id = record.credential_id;
            if self.with_retry("credentials.remove", |s| s.remove(&id))?.is_some() {
                removed += 1;
            }
        }

        // The snapshot is authoritative; older removals can no longer race it.
        self.tombstones.clear();
        info!(snapshot = seen.len(), removed, "reconciled credential cache");
        Ok(ApplyOutcome::Reconciled { removed })
    }
}

impl FeedHandler<ChangeEvent> for SyncEngine {
    fn on_subscribed(&mut self) -> GatewayResult<()> {
        self.begin_subscription();
        Ok(())
    }

    fn handle(&mut self, event: ChangeEvent) -> GatewayResult<()> {
        self.apply(event).map(|_| ())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("tombstones", &self.tombstones.len())
            .field("in_snapshot", &self.in_snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use crate::error::GatewayError;
    use crate::shutdown;
    use crate::storage::InMemoryCredentialStore;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            retry: BackoffPolicy::fixed_ratio(Duration::from_millis(1), Duration::from_millis(2)),
            max_attempts: 3,
            key_len: None,
        }
    }

    fn engine() -> (SyncEngine, Arc<InMemoryCredentialStore>, shutdown::ShutdownTrigger) {
        let store = Arc::new(InMemoryCredentialStore::default());
        let (trigger, signal) = shutdown::channel();
        (SyncEngine::new(store.clone(), fast_config(), signal), store, trigger)
    }

    fn ids(store: &InMemoryCredentialStore) -> Vec<String> {
        store
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|r| r.credential_id.to_string())
            .collect()
    }

    #[test]
    fn test_last_write_wins_in_any_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut events = Vec::new();
        for key in ["a", "b", "c", "d"] {
            for (i, secs) in [3, 9, 1, 6].into_iter().enumerate() {
                let record = CredentialRecord::new(key, format!("r{i}"), "Main", at(secs))
                    .with_active(secs % 2 == 1);
                events.push(ChangeEvent::Modified(record));
            }
            // Same timestamp as the newest write; only the tiebreak decides.
            for (resident, address, active) in [("r1", "Main", false), ("r0", "Side", true), ("r1", "Side", true)] {
                let record = CredentialRecord::new(key, resident, address, at(9)).with_active(active);
                events.push(ChangeEvent::Modified(record));
            }
        }

        let expected: Vec<_> = ["A", "B", "C", "D"]
            .iter()
            .map(|k| (k.to_string(), "r1".to_string(), "Side".to_string(), true))
            .collect();

        for _ in 0..20 {
            events.shuffle(&mut rng);
            let (mut engine, store, _trigger) = engine();
            for event in events.clone() {
                engine.apply(event).unwrap();
            }
            let state: Vec<_> = store
                .snapshot()
                .unwrap()
                .into_iter()
                .map(|r| (r.credential_id.to_string(), r.resident_id, r.address_id, r.active))
                .collect();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_replayed_event_is_a_no_op() {
        let (mut engine, store, _trigger) = engine();
        let record = CredentialRecord::new("a", "r", "Main", at(5));

        assert_eq!(engine.apply(ChangeEvent::Added(record.clone())).unwrap(), ApplyOutcome::Upserted);
        let before = store.snapshot().unwrap();
        assert_eq!(engine.apply(ChangeEvent::Added(record)).unwrap(), ApplyOutcome::Ignored);
        assert_eq!(store.snapshot().unwrap(), before);

        let remove = ChangeEvent::Removed(CredentialId::new("a"));
        assert_eq!(engine.apply(remove.clone()).unwrap(), ApplyOutcome::Removed);
        assert_eq!(engine.apply(remove).unwrap(), ApplyOutcome::Ignored);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_stale_re_add_after_removal_is_ignored() {
        let (mut engine, store, _trigger) = engine();
        let record = CredentialRecord::new("a", "r", "Main", at(5));
        engine.apply(ChangeEvent::Added(record.clone())).unwrap();
        engine.apply(ChangeEvent::Removed(CredentialId::new("a"))).unwrap();

        assert_eq!(engine.apply(ChangeEvent::Added(record)).unwrap(), ApplyOutcome::Ignored);
        assert!(store.is_empty().unwrap());

        let newer = CredentialRecord::new("a", "r", "Main", at(6));
        assert_eq!(engine.apply(ChangeEvent::Added(newer)).unwrap(), ApplyOutcome::Upserted);
    }

    #[test]
    fn test_reconnect_snapshot_removes_missed_deletions() {
        let (mut engine, store, _trigger) = engine();

        engine.begin_subscription();
        engine
            .apply(ChangeEvent::Added(CredentialRecord::new("a", "r", "Main", at(1))))
            .unwrap();
        assert!(engine.in_snapshot());
        assert_eq!(
            engine.apply(ChangeEvent::SnapshotComplete).unwrap(),
            ApplyOutcome::Reconciled { removed: 0 }
        );
        assert_eq!(ids(&store), vec!["A"]);

        engine.begin_subscription();
        assert_eq!(
            engine.apply(ChangeEvent::SnapshotComplete).unwrap(),
            ApplyOutcome::Reconciled { removed: 1 }
        );
        assert!(store.is_empty().unwrap());
        assert!(!engine.in_snapshot());
    }

    #[test]
    fn test_ignored_snapshot_entries_still_count_as_present() {
        let (mut engine, store, _trigger) = engine();
        let record = CredentialRecord::new("a", "r", "Main", at(1));
        engine.apply(ChangeEvent::Added(record.clone())).unwrap();

        engine.begin_subscription();
        assert_eq!(engine.apply(ChangeEvent::Added(record)).unwrap(), ApplyOutcome::Ignored);
        engine.apply(ChangeEvent::SnapshotComplete).unwrap();

        assert_eq!(ids(&store), vec!["A"]);
    }

    #[test]
    fn test_snapshot_marker_outside_subscription_is_ignored() {
        let (mut engine, store, _trigger) = engine();
        engine
            .apply(ChangeEvent::Added(CredentialRecord::new("a", "r", "Main", at(1))))
            .unwrap();
        assert_eq!(engine.apply(ChangeEvent::SnapshotComplete).unwrap(), ApplyOutcome::Ignored);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_ids_are_keyed_to_reader_length() {
        let store = Arc::new(InMemoryCredentialStore::default());
        let (_trigger, signal) = shutdown::channel();
        let config = SyncConfig {
            key_len: Some(4),
            ..fast_config()
        };
        let mut engine = SyncEngine::new(store.clone(), config, signal);

        engine
            .apply(ChangeEvent::Added(CredentialRecord::new("abcdef", "r", "Main", at(1))))
            .unwrap();
        assert!(store.lookup(&CredentialId::new("ABCD")).unwrap().is_some());

        engine.apply(ChangeEvent::Removed(CredentialId::new("abcdef"))).unwrap();
        assert!(store.is_empty().unwrap());
    }

    struct FlakyStore {
        inner: InMemoryCredentialStore,
        failures_left: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: InMemoryCredentialStore::default(),
                failures_left: AtomicUsize::new(failures),
            }
        }

        fn gate(&self) -> Result<(), StoreError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::unavailable("disk full"));
            }
            Ok(())
        }
    }

    impl CredentialStore for FlakyStore {
        fn upsert(&self, record: CredentialRecord) -> Result<(), StoreError> {
            self.gate()?;
            self.inner.upsert(record)
        }

        fn remove(&self, id: &CredentialId) -> Result<Option<CredentialRecord>, StoreError> {
            self.gate()?;
            self.inner.remove(id)
        }

        fn lookup(&self, id: &CredentialId) -> Result<Option<CredentialRecord>, StoreError> {
            self.inner.lookup(id)
        }

        fn snapshot(&self) -> Result<Vec<CredentialRecord>, StoreError> {
            self.inner.snapshot()
        }

        fn len(&self) -> Result<usize, StoreError> {
            self.inner.len()
        }
    }

    #[test]
    fn test_transient_store_failures_are_retried() {
        let store = Arc::new(FlakyStore::new(2));
        let (_trigger, signal) = shutdown::channel();
        let mut engine = SyncEngine::new(store.clone(), fast_config(), signal);

        let outcome = engine
            .apply(ChangeEvent::Added(CredentialRecord::new("a", "r", "Main", at(1))))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Upserted);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_persistent_store_failure_is_fatal() {
        let store = Arc::new(FlakyStore::new(usize::MAX));
        let (_trigger, signal) = shutdown::channel();
        let mut engine = SyncEngine::new(store, fast_config(), signal);

        let err = engine
            .apply(ChangeEvent::Added(CredentialRecord::new("a", "r", "Main", at(1))))
            .unwrap_err();
        assert!(matches!(err, GatewayError::FatalStoreFailure { attempts: 3, .. }));
        assert!(err.is_fatal());
    }
}
