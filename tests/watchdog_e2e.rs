//! Feed supervision against a scripted remote.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gatewarden::backoff::BackoffPolicy;
use gatewarden::clock::{Clock, ManualClock, SystemClock};
use gatewarden::feed::{ChangeEvent, FeedClient, FeedKind, ScriptedRemote};
use gatewarden::shutdown;
use gatewarden::watchdog::{run_supervised, FeedHandler, FeedStatus, FeedWatchdog, WatchdogConfig};
use gatewarden::{GatewayError, GatewayResult};

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

#[derive(Default)]
struct Counting {
    subscribed: Arc<AtomicUsize>,
    items: Arc<AtomicUsize>,
    fail_on_item: bool,
}

impl FeedHandler<ChangeEvent> for Counting {
    fn on_subscribed(&mut self) -> GatewayResult<()> {
        self.subscribed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handle(&mut self, _item: ChangeEvent) -> GatewayResult<()> {
        self.items.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_item {
            return Err(GatewayError::FatalStoreFailure {
                attempts: 8,
                message: "disk gone".to_string(),
            });
        }
        Ok(())
    }
}

fn config(heartbeat: Duration) -> WatchdogConfig {
    WatchdogConfig {
        heartbeat_timeout: heartbeat,
        poll_interval: Duration::from_millis(10),
        backoff: BackoffPolicy::fixed_ratio(Duration::from_millis(5), Duration::from_millis(20)),
    }
}

#[test]
fn test_sixty_one_seconds_of_silence_resubscribes() {
    let remote = ScriptedRemote::new();
    let clock = Arc::new(ManualClock::default());
    let mut dog = FeedWatchdog::new(FeedKind::Credentials, config(Duration::from_secs(60)), clock.clone());
    let connection = dog.connection();
    let (trigger, signal) = shutdown::channel();

    let worker = {
        let remote = remote.clone();
        thread::spawn(move || {
            let mut client: FeedClient<ChangeEvent> = FeedClient::new(Arc::new(remote), None);
            let mut handler = Counting::default();
            run_supervised(&mut client, &mut dog, &mut handler, &signal)
        })
    };

    assert!(wait_for(|| connection.status() == FeedStatus::Connected));
    assert_eq!(remote.credential_subscriptions(), 1);

    clock.advance(Duration::from_secs(30));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(remote.credential_subscriptions(), 1);

    clock.advance(Duration::from_secs(31));
    assert!(wait_for(|| remote.credential_subscriptions() == 2));
    assert!(wait_for(|| connection.status() == FeedStatus::Connected));
    assert_eq!(connection.state().last_heartbeat, Some(clock.now()));
    assert_eq!(remote.open_credential_subscriptions(), 1);

    trigger.fire();
    worker.join().unwrap().unwrap();
    assert_eq!(connection.status(), FeedStatus::Disconnected);
}

#[test]
fn test_keepalives_prevent_resubscribe() {
    let remote = ScriptedRemote::new();
    let mut dog = FeedWatchdog::new(FeedKind::Credentials, config(Duration::from_millis(200)), Arc::new(SystemClock));
    let connection = dog.connection();
    let (trigger, signal) = shutdown::channel();

    let worker = {
        let remote = remote.clone();
        thread::spawn(move || {
            let mut client: FeedClient<ChangeEvent> = FeedClient::new(Arc::new(remote), None);
            let mut handler = Counting::default();
            run_supervised(&mut client, &mut dog, &mut handler, &signal)
        })
    };

    assert!(wait_for(|| connection.status() == FeedStatus::Connected));
    for _ in 0..10 {
        remote.keepalive();
        thread::sleep(Duration::from_millis(40));
    }
    assert_eq!(remote.credential_subscriptions(), 1);

    trigger.fire();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_outage_backs_off_until_remote_returns() {
    let remote = ScriptedRemote::new();
    let mut dog = FeedWatchdog::new(FeedKind::Credentials, config(Duration::from_secs(60)), Arc::new(SystemClock));
    let connection = dog.connection();
    let (trigger, signal) = shutdown::channel();
    let subscribed = Arc::new(AtomicUsize::new(0));

    let worker = {
        let remote = remote.clone();
        let subscribed = Arc::clone(&subscribed);
        thread::spawn(move || {
            let mut client: FeedClient<ChangeEvent> = FeedClient::new(Arc::new(remote), None);
            let mut handler = Counting {
                subscribed,
                ..Counting::default()
            };
            run_supervised(&mut client, &mut dog, &mut handler, &signal)
        })
    };

    assert!(wait_for(|| connection.status() == FeedStatus::Connected));
    remote.go_offline();
    assert!(wait_for(|| connection.state().reconnect_attempts >= 3));
    assert_eq!(connection.status(), FeedStatus::Reconnecting);

    remote.go_online();
    assert!(wait_for(|| connection.status() == FeedStatus::Connected));
    assert_eq!(connection.state().reconnect_attempts, 0);
    assert_eq!(subscribed.load(Ordering::SeqCst), 2);

    trigger.fire();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_fatal_handler_error_ends_supervision() {
    let remote = ScriptedRemote::new();
    let mut dog = FeedWatchdog::new(FeedKind::Credentials, config(Duration::from_secs(60)), Arc::new(SystemClock));
    let (_trigger, signal) = shutdown::channel();

    let mut client: FeedClient<ChangeEvent> = FeedClient::new(Arc::new(remote.clone()), None);
    let mut handler = Counting {
        fail_on_item: true,
        ..Counting::default()
    };

    // The snapshot marker is the first item of every subscription.
    let err = run_supervised(&mut client, &mut dog, &mut handler, &signal).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(dog.connection().status(), FeedStatus::Disconnected);
    assert_eq!(remote.open_credential_subscriptions(), 0);
}
