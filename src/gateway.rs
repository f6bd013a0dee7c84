//! Gateway orchestration.
//!
//! [`Gateway::start`] wires the components together and spawns the
//! long-lived threads:
//!
//! - `gatewarden-sync`: credential feed -> [`SyncEngine`] under a watchdog
//! - `gatewarden-commands`: command feed -> [`CommandProcessor`] under a
//!   watchdog (only when remote commands are enabled)
//! - `gatewarden-reader`: tag reader -> [`AccessEvaluator`]
//!
//! The reader thread only touches the local cache, so scans keep being
//! answered while both feeds are reconnecting.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::access::{run_reader_loop, AccessEvaluator, AccessLogEntry, AuditSink};
use crate::clock::Clock;
use crate::command::CommandEnvelope;
use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::feed::{ChangeEvent, FeedClient, FeedKind, RemoteStore};
use crate::hardware::{Actuator, TagReader};
use crate::outbox::Outbox;
use crate::processor::{ack_outbox, CommandProcessor};
use crate::shutdown::{self, ShutdownSignal, ShutdownTrigger};
use crate::storage::{CommandLedger, CredentialStore, CredentialView};
use crate::sync::SyncEngine;
use crate::watchdog::{run_supervised, ConnectionHandle, FeedWatchdog};

/// Process health as seen by the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// All components running or recovering on their own.
    Healthy,
    /// A component failed in a way only a restart can fix.
    Fatal(String),
}

impl Health {
    /// Returns true for `Fatal`.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Shared health cell. The first fatal report wins.
#[derive(Debug, Clone)]
pub struct HealthHandle {
    inner: Arc<RwLock<Health>>,
}

impl Default for HealthHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Health::Healthy)),
        }
    }
}

impl HealthHandle {
    /// Current health.
    #[must_use]
    pub fn get(&self) -> Health {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns true once a fatal failure was reported.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.get().is_fatal()
    }

    /// Records a fatal failure.
    pub fn mark_fatal(&self, reason: impl Into<String>) {
        let mut health = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !health.is_fatal() {
            let reason = reason.into();
            error!(reason = %reason, "gateway health is fatal");
            *health = Health::Fatal(reason);
        }
    }
}

/// External collaborators the gateway runs against.
pub struct GatewayParts {
    /// Local credential cache.
    pub credentials: Arc<dyn CredentialStore>,
    /// Command dedup ledger.
    pub ledger: Arc<dyn CommandLedger>,
    /// Remote store.
    pub remote: Arc<dyn RemoteStore>,
    /// Relay actuator.
    pub actuator: Arc<dyn Actuator>,
    /// Tag reader; no reader thread runs without one.
    pub reader: Option<Box<dyn TagReader>>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for GatewayParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayParts")
            .field("reader", &self.reader.is_some())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Entry point.
#[derive(Debug)]
pub struct Gateway;

impl Gateway {
    /// Starts every component and returns a handle to the running gateway.
    ///
    /// # Errors
    /// `Config` if `config` fails validation.
    ///
    /// # Panics
    /// If a worker thread cannot be spawned.
    pub fn start(config: &GatewayConfig, parts: GatewayParts) -> GatewayResult<GatewayHandle> {
        let config = config.clone().validate()?;
        let (trigger, signal) = shutdown::channel();
        let health = HealthHandle::default();

        let audit = config.remote.audit.then(|| audit_outbox(&parts.remote, &config));
        let mut evaluator = AccessEvaluator::new(
            CredentialView::new(Arc::clone(&parts.credentials)),
            Arc::clone(&parts.actuator),
            Arc::clone(&parts.clock),
            config.access_config(),
        );
        if let Some(audit) = &audit {
            evaluator = evaluator.with_audit(Arc::clone(audit));
        }
        let evaluator = Arc::new(evaluator);

        let community = config.site.community.clone();
        let mut workers = Vec::new();

        let mut credentials_dog = FeedWatchdog::new(FeedKind::Credentials, config.feed, Arc::clone(&parts.clock));
        let credentials_connection = credentials_dog.connection();
        {
            let mut client: FeedClient<ChangeEvent> = FeedClient::new(Arc::clone(&parts.remote), community.clone());
            let mut engine = SyncEngine::new(Arc::clone(&parts.credentials), config.sync_config(), signal.clone());
            let signal = signal.clone();
            let health = health.clone();
            let join = thread::Builder::new()
                .name("gatewarden-sync".to_string())
                .spawn(move || {
                    if let Err(e) = run_supervised(&mut client, &mut credentials_dog, &mut engine, &signal) {
                        health.mark_fatal(format!("credential sync stopped: {e}"));
                    }
                })
                .expect("failed to spawn gatewarden sync thread");
            workers.push(("sync", join));
        }

        let mut commands_dog = FeedWatchdog::new(FeedKind::Commands, config.feed, Arc::clone(&parts.clock));
        let commands_connection = commands_dog.connection();
        if config.commands.enabled {
            let acks = ack_outbox(Arc::clone(&parts.remote), config.commands.acks);
            let mut processor = CommandProcessor::new(
                Arc::clone(&parts.ledger),
                Arc::clone(&parts.actuator),
                Arc::clone(&parts.clock),
                acks,
                config.processor_config(),
                signal.clone(),
            );
            if let Some(audit) = &audit {
                processor = processor.with_audit(Arc::clone(audit));
            }
            let mut client: FeedClient<CommandEnvelope> = FeedClient::new(Arc::clone(&parts.remote), community);
            let signal = signal.clone();
            let health = health.clone();
            let join = thread::Builder::new()
                .name("gatewarden-commands".to_string())
                .spawn(move || {
                    if let Err(e) = run_supervised(&mut client, &mut commands_dog, &mut processor, &signal) {
                        health.mark_fatal(format!("command processing stopped: {e}"));
                    }
                })
                .expect("failed to spawn gatewarden command thread");
            workers.push(("commands", join));
        } else {
            info!("remote commands disabled");
        }

        let reader = parts.reader.map(|mut reader| {
            let evaluator = Arc::clone(&evaluator);
            let signal = signal.clone();
            let health = health.clone();
            thread::Builder::new()
                .name("gatewarden-reader".to_string())
                .spawn(move || {
                    if let Err(e) = run_reader_loop(reader.as_mut(), &evaluator, &signal) {
                        health.mark_fatal(format!("tag reader stopped: {e}"));
                    }
                })
                .expect("failed to spawn gatewarden reader thread")
        });
        if reader.is_none() {
            warn!("no tag reader configured, only remote commands will open gates");
        }

        info!(
            community = ?config.site.community,
            addresses = config.site.addresses.len(),
            cached_credentials = parts.credentials.len().unwrap_or(0),
            commands = config.commands.enabled,
            "gateway started"
        );

        Ok(GatewayHandle {
            evaluator,
            credentials_connection,
            commands_connection,
            health,
            trigger,
            signal,
            workers,
            reader,
            reader_grace: config.feed.poll_interval,
        })
    }
}

fn audit_outbox(remote: &Arc<dyn RemoteStore>, config: &GatewayConfig) -> AuditSink {
    let remote = Arc::clone(remote);
    Arc::new(Outbox::spawn(
        "audit",
        config.remote.audit_outbox,
        Box::new(move |entry: &AccessLogEntry| remote.log_access(entry)),
    ))
}

/// A running gateway.
///
/// Dropping the handle shuts the gateway down and waits for it.
pub struct GatewayHandle {
    evaluator: Arc<AccessEvaluator>,
    credentials_connection: ConnectionHandle,
    commands_connection: ConnectionHandle,
    health: HealthHandle,
    trigger: ShutdownTrigger,
    signal: ShutdownSignal,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    reader: Option<JoinHandle<()>>,
    reader_grace: Duration,
}

impl GatewayHandle {
    /// The evaluator answering scans.
    #[must_use]
    pub fn evaluator(&self) -> &AccessEvaluator {
        &self.evaluator
    }

    /// Credential feed connection state.
    #[must_use]
    pub fn credentials_connection(&self) -> ConnectionHandle {
        self.credentials_connection.clone()
    }

    /// Command feed connection state. Stays `Disconnected` when remote
    /// commands are disabled.
    #[must_use]
    pub fn commands_connection(&self) -> ConnectionHandle {
        self.commands_connection.clone()
    }

    /// Shared health cell.
    #[must_use]
    pub fn health(&self) -> HealthHandle {
        self.health.clone()
    }

    /// A trigger for signal handlers.
    #[must_use]
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Returns true once shutdown was requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.signal.is_triggered()
    }

    /// Requests shutdown of every thread.
    pub fn shutdown(&self) {
        info!("gateway shutdown requested");
        self.trigger.fire();
    }

    /// Waits for the feed threads to exit and returns the final health.
    ///
    /// Does not request shutdown itself. A reader blocked on its device is
    /// left behind after a short grace period.
    pub fn join(mut self) -> Health {
        self.join_workers();
        self.health.get()
    }

    fn join_workers(&mut self) {
        for (name, join) in self.workers.drain(..) {
            if join.join().is_err() {
                self.health.mark_fatal(format!("{name} thread panicked"));
            }
        }

        if let Some(reader) = self.reader.take() {
            let deadline = Instant::now() + self.reader_grace;
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if reader.is_finished() {
                if reader.join().is_err() {
                    self.health.mark_fatal("reader thread panicked");
                }
            } else {
                debug!("tag reader still blocked, not waiting for it");
            }
        }
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.trigger.fire();
        self.join_workers();
    }
}

impl fmt::Debug for GatewayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayHandle")
            .field("credentials", &self.credentials_connection.status())
            .field("commands", &self.commands_connection.status())
            .field("health", &self.health.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fatal_report_wins() {
        let health = HealthHandle::default();
        assert_eq!(health.get(), Health::Healthy);

        health.mark_fatal("store gone");
        health.mark_fatal("reader gone");
        assert_eq!(health.get(), Health::Fatal("store gone".to_string()));
        assert!(health.clone().is_fatal());
    }
}
