//! Credential sync through the supervised feed, end to end.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use gatewarden::backoff::BackoffPolicy;
use gatewarden::clock::SystemClock;
use gatewarden::feed::{ChangeEvent, FeedClient, FeedKind, ScriptedRemote};
use gatewarden::shutdown::{self, ShutdownTrigger};
use gatewarden::storage::{open_database, CredentialStore, InMemoryCredentialStore};
use gatewarden::sync::{SyncConfig, SyncEngine};
use gatewarden::watchdog::{run_supervised, ConnectionHandle, FeedStatus, FeedWatchdog, WatchdogConfig};
use gatewarden::{CredentialId, CredentialRecord, GatewayResult};

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn at(secs: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, secs).unwrap()
}

struct Running {
    trigger: ShutdownTrigger,
    connection: ConnectionHandle,
    worker: JoinHandle<GatewayResult<()>>,
}

impl Running {
    fn stop(self) {
        self.trigger.fire();
        self.worker.join().unwrap().unwrap();
    }
}

fn start(remote: &ScriptedRemote, store: Arc<dyn CredentialStore>) -> Running {
    let config = WatchdogConfig {
        heartbeat_timeout: Duration::from_secs(60),
        poll_interval: Duration::from_millis(10),
        backoff: BackoffPolicy::fixed_ratio(Duration::from_millis(5), Duration::from_millis(20)),
    };
    let mut dog = FeedWatchdog::new(FeedKind::Credentials, config, Arc::new(SystemClock));
    let connection = dog.connection();
    let (trigger, signal) = shutdown::channel();
    let remote = remote.clone();

    let worker = thread::spawn(move || {
        let mut client: FeedClient<ChangeEvent> = FeedClient::new(Arc::new(remote), None);
        let mut engine = SyncEngine::new(store, SyncConfig::default(), signal.clone());
        run_supervised(&mut client, &mut dog, &mut engine, &signal)
    });

    Running {
        trigger,
        connection,
        worker,
    }
}

#[test]
fn test_remote_changes_reach_the_cache() {
    let remote = ScriptedRemote::new();
    remote.put_credential(CredentialRecord::new("A", "r1", "Main", at(0)));
    let store = Arc::new(InMemoryCredentialStore::default());
    let running = start(&remote, store.clone());

    assert!(wait_for(|| store.len().unwrap() == 1));

    remote.put_credential(CredentialRecord::new("B", "r2", "Main", at(1)));
    remote.put_credential(CredentialRecord::new("A", "r1", "Side", at(2)));
    assert!(wait_for(|| store.len().unwrap() == 2));
    assert!(wait_for(|| {
        store
            .lookup(&CredentialId::new("A"))
            .unwrap()
            .is_some_and(|r| r.address_id == "Side")
    }));

    // A late, older copy must not undo the newer one.
    remote.push_change(ChangeEvent::Modified(CredentialRecord::new("A", "r1", "Main", at(1))));
    remote.delete_credential("B");
    assert!(wait_for(|| store.len().unwrap() == 1));
    assert_eq!(store.lookup(&CredentialId::new("A")).unwrap().unwrap().address_id, "Side");

    running.stop();
}

#[test]
fn test_delete_missed_while_offline_is_reconciled() {
    let remote = ScriptedRemote::new();
    remote.put_credential(CredentialRecord::new("A", "r1", "Main", at(0)));
    remote.put_credential(CredentialRecord::new("B", "r2", "Main", at(0)));
    let store = Arc::new(InMemoryCredentialStore::default());
    let running = start(&remote, store.clone());

    assert!(wait_for(|| store.len().unwrap() == 2));

    remote.go_offline();
    assert!(wait_for(|| running.connection.status() == FeedStatus::Reconnecting));
    remote.silent_delete("A");

    // Still cached while disconnected.
    assert!(store.lookup(&CredentialId::new("A")).unwrap().is_some());

    remote.go_online();
    assert!(wait_for(|| store.len().unwrap() == 1));
    assert!(store.lookup(&CredentialId::new("A")).unwrap().is_none());
    assert!(store.lookup(&CredentialId::new("B")).unwrap().is_some());
    assert_eq!(running.connection.status(), FeedStatus::Connected);

    running.stop();
}

#[test]
fn test_synced_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let remote = ScriptedRemote::new();
    remote.put_credential(CredentialRecord::new("0A1B2C3D4E5F", "r1", "Main", at(0)));

    {
        let stores = open_database(dir.path(), None).unwrap();
        let running = start(&remote, Arc::new(stores.credentials.clone()));
        assert!(wait_for(|| stores.credentials.len().unwrap() == 1));
        running.stop();
    }

    remote.go_offline();
    let stores = open_database(dir.path(), None).unwrap();
    let record = stores
        .credentials
        .lookup(&CredentialId::new("0a1b2c3d4e5f"))
        .unwrap()
        .unwrap();
    assert_eq!(record.resident_id, "r1");
    assert!(record.active);
}
