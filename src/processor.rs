//! Command processor: actuates remote commands at most once.
//!
//! Each command is filtered (community, kind, address, age), then its id is
//! recorded in the persisted ledger, and only then is the relay pulsed. A
//! crash between the two loses the actuation instead of repeating it on
//! redelivery. Acknowledgments go through an outbox so a slow remote never
//! holds up the next command.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::access::{AccessLogEntry, AccessSource, AuditSink};
use crate::backoff::{retry_store, BackoffPolicy};
use crate::clock::{elapsed_between, Clock};
use crate::command::{AckStatus, Command, CommandEnvelope};
use crate::error::{CommandRejection, GatewayResult};
use crate::feed::RemoteStore;
use crate::hardware::Actuator;
use crate::outbox::{Outbox, OutboxConfig};
use crate::shutdown::ShutdownSignal;
use crate::storage::CommandLedger;
use crate::watchdog::FeedHandler;

/// An acknowledgment waiting to be written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAck {
    /// Command being acknowledged.
    pub command_id: String,
    /// Status to report.
    pub status: AckStatus,
}

/// Shared acknowledgment queue.
pub type AckSink = Arc<Outbox<PendingAck>>;

/// Starts the acknowledgment worker for `remote`.
#[must_use]
pub fn ack_outbox(remote: Arc<dyn RemoteStore>, config: OutboxConfig) -> AckSink {
    Arc::new(Outbox::spawn(
        "acks",
        config,
        Box::new(move |ack: &PendingAck| remote.acknowledge(&ack.command_id, ack.status)),
    ))
}

/// Processor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Only commands for this community are accepted, when set.
    pub community: Option<String>,
    /// Addresses this gateway serves.
    pub addresses: Vec<String>,
    /// Address used when a command names none.
    pub default_address: Option<String>,
    /// Commands older than this are stale; ledger entries older than this
    /// are pruned. Both ages are measured from the later of `issued_at` and
    /// the local receive time.
    pub retention: Duration,
    /// Backoff between ledger retries.
    pub store_retry: BackoffPolicy,
    /// Ledger attempts before the failure is fatal.
    pub store_max_attempts: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            community: None,
            addresses: Vec::new(),
            default_address: None,
            retention: Duration::from_secs(24 * 60 * 60),
            store_retry: BackoffPolicy::default(),
            store_max_attempts: 8,
        }
    }
}

/// Result of processing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Recorded and actuated.
    Actuated(Command),
    /// Refused without actuation.
    Rejected(CommandRejection),
}

/// Consumes the command feed.
pub struct CommandProcessor {
    ledger: Arc<dyn CommandLedger>,
    actuator: Arc<dyn Actuator>,
    clock: Arc<dyn Clock>,
    acks: AckSink,
    audit: Option<AuditSink>,
    config: ProcessorConfig,
    shutdown: ShutdownSignal,
}

impl CommandProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn CommandLedger>,
        actuator: Arc<dyn Actuator>,
        clock: Arc<dyn Clock>,
        acks: AckSink,
        config: ProcessorConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            ledger,
            actuator,
            clock,
            acks,
            audit: None,
            config,
            shutdown,
        }
    }

    /// Audits every actuation to `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Called when a command subscription (re)starts. Prunes ledger entries
    /// that have aged out of the retention window.
    pub fn begin_subscription(&self) -> GatewayResult<usize> {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(self.config.retention).unwrap_or_else(|_| chrono::Duration::days(1));
        let pruned = retry_store(
            self.config.store_retry,
            self.config.store_max_attempts,
            &self.shutdown,
            "ledger.prune",
            || self.ledger.prune_before(cutoff),
        )?;
        if pruned > 0 {
            info!(pruned, "pruned expired command ledger entries");
        }
        Ok(pruned)
    }

    /// Processes one delivered command.
    ///
    /// # Errors
    /// Only ledger failures surface as errors; every rejection is an
    /// `Ok(CommandOutcome::Rejected)`.
    pub fn process(&self, envelope: CommandEnvelope) -> GatewayResult<CommandOutcome> {
        match self.admit(&envelope)? {
            Ok(command) => Ok(CommandOutcome::Actuated(self.actuate(command))),
            Err(rejection) => {
                self.reject(&rejection);
                Ok(CommandOutcome::Rejected(rejection))
            }
        }
    }

    fn admit(&self, envelope: &CommandEnvelope) -> GatewayResult<Result<Command, CommandRejection>> {
        if let (Some(ours), Some(theirs)) = (&self.config.community, &envelope.community) {
            if ours != theirs {
                return Ok(Err(CommandRejection::WrongCommunity {
                    command_id: envelope.command_id.clone(),
                    community: theirs.clone(),
                }));
            }
        }

        let kind = match envelope.parse_kind() {
            Ok(kind) => kind,
            Err(rejection) => return Ok(Err(rejection)),
        };

        let Some(address_id) = self.resolve_address(&envelope.address) else {
            return Ok(Err(CommandRejection::UnknownAddress {
                command_id: envelope.command_id.clone(),
                address: envelope.address.clone(),
            }));
        };

        let now = self.clock.now();
        let age = elapsed_between(envelope.issued_at, now);
        if age > self.config.retention {
            return Ok(Err(CommandRejection::StaleCommand {
                command_id: envelope.command_id.clone(),
                age_secs: i64::try_from(age.as_secs()).unwrap_or(i64::MAX),
            }));
        }

        // Stamped no earlier than `issued_at`: a command issued ahead of our
        // clock stays fresh past `now + retention` and must outlive pruning.
        let recorded_at = now.max(envelope.issued_at);
        let recorded = retry_store(
            self.config.store_retry,
            self.config.store_max_attempts,
            &self.shutdown,
            "ledger.record",
            || self.ledger.record(&envelope.command_id, recorded_at),
        )?;
        if !recorded {
            return Ok(Err(CommandRejection::DuplicateCommand {
                command_id: envelope.command_id.clone(),
            }));
        }

        Ok(Ok(Command {
            command_id: envelope.command_id.clone(),
            kind,
            address_id,
            issued_at: envelope.issued_at,
            consumed: true,
        }))
    }

    fn resolve_address(&self, requested: &str) -> Option<String> {
        let requested = requested.trim();
        if requested.is_empty() {
            return self.config.default_address.clone();
        }
        if self.config.addresses.is_empty() {
            return Some(requested.to_string());
        }
        self.config
            .addresses
            .iter()
            .find(|served| served.eq_ignore_ascii_case(requested))
            .cloned()
    }

    fn actuate(&self, command: Command) -> Command {
        let duration = command.kind.duration();
        info!(
            command = %command.command_id,
            kind = %command.kind,
            address = %command.address_id,
            duration_ms = duration.as_millis() as u64,
            "actuating remote command"
        );
        // Already in the ledger: a failed pulse is reported, never repeated.
        if let Err(e) = self.actuator.actuate(&command.address_id, duration) {
            warn!(command = %command.command_id, error = %e, "relay actuation failed");
        }

        self.acks.push(PendingAck {
            command_id: command.command_id.clone(),
            status: AckStatus::Processed,
        });
        if let Some(audit) = &self.audit {
            audit.push(AccessLogEntry {
                at: self.clock.now(),
                community: self.config.community.clone(),
                address_id: Some(command.address_id.clone()),
                credential_id: None,
                resident_id: None,
                command_id: Some(command.command_id.clone()),
                granted: true,
                deny_reason: None,
                source: AccessSource::Remote,
            });
        }
        command
    }

    fn reject(&self, rejection: &CommandRejection) {
        match rejection {
            CommandRejection::WrongCommunity { .. } => debug!(%rejection, "ignoring command"),
            CommandRejection::DuplicateCommand { .. } => info!(%rejection, "command already actuated"),
            _ => warn!(%rejection, "command rejected"),
        }
        if let Some(status) = AckStatus::for_rejection(rejection) {
            self.acks.push(PendingAck {
                command_id: rejection.command_id().to_string(),
                status,
            });
        }
    }
}

impl FeedHandler<CommandEnvelope> for CommandProcessor {
    fn on_subscribed(&mut self) -> GatewayResult<()> {
        self.begin_subscription().map(|_| ())
    }

    fn handle(&mut self, envelope: CommandEnvelope) -> GatewayResult<()> {
        self.process(envelope).map(|_| ())
    }
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("config", &self.config)
            .field("acks", &self.acks)
            .finish_non_exhaustive()
    }
}
