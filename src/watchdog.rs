//! Connection watchdog for the two feed subscriptions.
//!
//! Per feed:
//!
//! ```text
//! Disconnected --subscribe ok--> Connected
//! Connected --error | heartbeat timeout--> Reconnecting
//! Reconnecting --subscribe ok--> Connected
//! Reconnecting --subscribe fails--> Reconnecting (after backoff)
//! any --shutdown--> Disconnected
//! ```
//!
//! Reconnection never gives up; only shutdown ends supervision. The
//! watchdog owns the [`ConnectionState`]; everything else reads it through
//! a [`ConnectionHandle`].

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::clock::Clock;
use crate::error::{FeedError, GatewayError, GatewayResult};
use crate::feed::{FeedClient, FeedItem, FeedKind, FeedMessage};
use crate::shutdown::ShutdownSignal;

/// Liveness of one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    /// Subscribed and recently heard from.
    Connected,
    /// Not subscribed and not trying (startup, shutdown).
    Disconnected,
    /// Waiting to resubscribe after a fault.
    Reconnecting,
}

/// Snapshot of one feed's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// Current status.
    pub feed: FeedStatus,
    /// Wall time of the last event or keepalive, for display. Deadlines
    /// are tracked on the monotonic clock.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Failed attempts since the last successful subscribe.
    pub reconnect_attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            feed: FeedStatus::Disconnected,
            last_heartbeat: None,
            reconnect_attempts: 0,
        }
    }
}

/// Read-only accessor for a feed's connection state.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    kind: FeedKind,
    state: Arc<RwLock<ConnectionState>>,
}

impl ConnectionHandle {
    /// The feed this handle observes.
    #[must_use]
    pub const fn kind(&self) -> FeedKind {
        self.kind
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        self.state().feed
    }
}

/// Watchdog settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Silence longer than this forces a resubscribe.
    #[serde(rename = "heartbeat_timeout_ms", with = "crate::config::duration_ms")]
    pub heartbeat_timeout: Duration,
    /// Longest a receive call blocks; bounds shutdown latency.
    #[serde(rename = "poll_interval_ms", with = "crate::config::duration_ms")]
    pub poll_interval: Duration,
    /// Backoff between resubscribe attempts.
    pub backoff: BackoffPolicy,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What the supervision loop should do after a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Keep reading.
    Continue,
    /// Drop the subscription and open a new one.
    Resubscribe,
}

/// Tracks one feed's liveness and drives its state transitions.
#[derive(Debug)]
pub struct FeedWatchdog {
    kind: FeedKind,
    config: WatchdogConfig,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<ConnectionState>>,
    backoff: Backoff,
    last_seen: Option<Duration>,
}

impl FeedWatchdog {
    /// Creates a watchdog in the `Disconnected` state.
    #[must_use]
    pub fn new(kind: FeedKind, config: WatchdogConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            kind,
            config,
            clock,
            state: Arc::new(RwLock::new(ConnectionState::default())),
            backoff: Backoff::new(config.backoff),
            last_seen: None,
        }
    }

    /// Accessor for other components.
    #[must_use]
    pub fn connection(&self) -> ConnectionHandle {
        ConnectionHandle {
            kind: self.kind,
            state: Arc::clone(&self.state),
        }
    }

    /// Settings in effect.
    #[must_use]
    pub const fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    fn update(&self, f: impl FnOnce(&mut ConnectionState)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = state.feed;
        f(&mut state);
        if state.feed != before {
            info!(feed = %self.kind, from = ?before, to = ?state.feed, "feed connection state changed");
        }
    }

    /// A subscription was opened.
    pub fn on_subscribed(&mut self) {
        let now = self.clock.now();
        self.last_seen = Some(self.clock.monotonic());
        self.backoff.reset();
        self.update(|s| {
            s.feed = FeedStatus::Connected;
            s.last_heartbeat = Some(now);
            s.reconnect_attempts = 0;
        });
    }

    /// An event or keepalive arrived.
    pub fn observe(&mut self) {
        let now = self.clock.now();
        self.last_seen = Some(self.clock.monotonic());
        self.update(|s| s.last_heartbeat = Some(now));
    }

    /// The subscription reported an error. Returns how long to wait before
    /// resubscribing.
    pub fn on_error(&mut self, error: &FeedError) -> Duration {
        warn!(feed = %self.kind, error = %error, "feed error");
        self.update(|s| s.feed = FeedStatus::Reconnecting);
        self.next_backoff()
    }

    /// A subscribe attempt failed. Returns how long to wait before the
    /// next one.
    pub fn on_subscribe_failed(&mut self, error: &FeedError) -> Duration {
        let delay = self.next_backoff();
        warn!(
            feed = %self.kind,
            attempt = self.backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "resubscribe failed"
        );
        self.update(|s| s.feed = FeedStatus::Reconnecting);
        delay
    }

    /// Advances the backoff and returns the next delay.
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.backoff.next_delay();
        let attempts = self.backoff.attempts();
        self.update(|s| s.reconnect_attempts = attempts);
        delay
    }

    /// Checks the heartbeat deadline of a connected feed.
    pub fn check(&self) -> WatchdogAction {
        let silent = self
            .last_seen
            .map_or(Duration::MAX, |at| self.clock.monotonic().saturating_sub(at));
        let mut action = WatchdogAction::Continue;
        self.update(|s| {
            if s.feed != FeedStatus::Connected {
                return;
            }
            if silent > self.config.heartbeat_timeout {
                warn!(
                    feed = %self.kind,
                    silent_ms = silent.as_millis() as u64,
                    timeout_ms = self.config.heartbeat_timeout.as_millis() as u64,
                    "heartbeat missed, forcing resubscribe"
                );
                s.feed = FeedStatus::Reconnecting;
                action = WatchdogAction::Resubscribe;
            }
        });
        action
    }

    /// Supervision ended.
    pub fn on_shutdown(&self) {
        self.update(|s| s.feed = FeedStatus::Disconnected);
    }
}

/// Consumer side of a supervised feed.
pub trait FeedHandler<T> {
    /// Called after every successful (re)subscribe, before the first item.
    fn on_subscribed(&mut self) -> GatewayResult<()>;

    /// Called for every item in delivery order.
    fn handle(&mut self, item: T) -> GatewayResult<()>;
}

/// Runs a feed under watchdog supervision until shutdown.
///
/// Subscribes, hands items to `handler`, and resubscribes after errors
/// (with backoff) or missed heartbeats (immediately).
///
/// # Errors
/// Returns the first handler error other than `Shutdown`; feed errors
/// are never returned.
pub fn run_supervised<T: FeedItem>(
    client: &mut FeedClient<T>,
    watchdog: &mut FeedWatchdog,
    handler: &mut dyn FeedHandler<T>,
    shutdown: &ShutdownSignal,
) -> GatewayResult<()> {
    let result = supervise(client, watchdog, handler, shutdown);
    client.close();
    watchdog.on_shutdown();
    match result {
        Err(GatewayError::Shutdown) => Ok(()),
        other => other,
    }
}

fn supervise<T: FeedItem>(
    client: &mut FeedClient<T>,
    watchdog: &mut FeedWatchdog,
    handler: &mut dyn FeedHandler<T>,
    shutdown: &ShutdownSignal,
) -> GatewayResult<()> {
    let poll = watchdog.config().poll_interval;
    while !shutdown.is_triggered() {
        if !client.is_subscribed() {
            if let Err(e) = client.subscribe() {
                let delay = watchdog.on_subscribe_failed(&e);
                if shutdown.wait_timeout(delay) {
                    break;
                }
                continue;
            }
            watchdog.on_subscribed();
            handler.on_subscribed()?;
        }

        match client.next(poll) {
            Ok(Some(FeedMessage::Item(item))) => {
                watchdog.observe();
                handler.handle(item)?;
            }
            Ok(Some(FeedMessage::Keepalive)) => watchdog.observe(),
            Ok(None) => {}
            Err(e) => {
                let delay = watchdog.on_error(&e);
                if shutdown.wait_timeout(delay) {
                    break;
                }
                continue;
            }
        }

        if watchdog.check() == WatchdogAction::Resubscribe {
            client.close();
        }
    }
    debug!(feed = %client.kind(), "feed supervision stopped");
    Ok(())
}
