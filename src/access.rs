//! Access evaluation for scanned tags.
//!
//! Decisions are answered from the local credential cache only, so the
//! gate keeps working while every feed is reconnecting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::command::OPEN_GATE_PULSE;
use crate::credential::{CredentialId, CredentialRecord};
use crate::error::HardwareError;
use crate::hardware::{Actuator, TagReader};
use crate::outbox::Outbox;
use crate::shutdown::ShutdownSignal;
use crate::storage::CredentialView;

/// Shared queue of audit entries bound for the remote store.
pub type AuditSink = Arc<Outbox<AccessLogEntry>>;

/// Why a scan was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// No record for the tag.
    Unknown,
    /// The record exists but is not active.
    Inactive,
    /// The cache could not be read.
    StoreError,
}

/// Outcome of evaluating one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Open the gate.
    Grant(CredentialRecord),
    /// Keep it shut.
    Deny(DenyReason),
}

impl AccessDecision {
    /// Returns true for a grant.
    #[must_use]
    pub const fn is_grant(&self) -> bool {
        matches!(self, Self::Grant(_))
    }
}

/// Where an actuation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    /// A tag scanned at the local reader.
    Reader,
    /// A command from the remote store.
    Remote,
}

/// One audited access event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    /// When the decision was taken.
    pub at: DateTime<Utc>,
    /// Site community.
    pub community: Option<String>,
    /// Address opened or requested.
    pub address_id: Option<String>,
    /// Scanned tag, for reader events.
    pub credential_id: Option<CredentialId>,
    /// Resident owning the tag, when known.
    pub resident_id: Option<String>,
    /// Command id, for remote events.
    pub command_id: Option<String>,
    /// Whether the gate was opened.
    pub granted: bool,
    /// Set for denials.
    pub deny_reason: Option<DenyReason>,
    /// Origin of the event.
    pub source: AccessSource,
}

/// Evaluator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessConfig {
    /// Site community, copied into audit entries.
    pub community: Option<String>,
    /// Address opened for records that carry none.
    pub default_address: Option<String>,
    /// Ids are truncated to this many characters before lookup.
    pub key_len: Option<usize>,
    /// Relay pulse on grant.
    pub pulse: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            community: None,
            default_address: None,
            key_len: None,
            pulse: OPEN_GATE_PULSE,
        }
    }
}

/// Answers grant or deny for scanned tags.
pub struct AccessEvaluator {
    credentials: CredentialView,
    actuator: Arc<dyn Actuator>,
    clock: Arc<dyn Clock>,
    audit: Option<AuditSink>,
    config: AccessConfig,
}

impl AccessEvaluator {
    /// Creates an evaluator over a read-only view of the cache.
    #[must_use]
    pub fn new(
        credentials: CredentialView,
        actuator: Arc<dyn Actuator>,
        clock: Arc<dyn Clock>,
        config: AccessConfig,
    ) -> Self {
        Self {
            credentials,
            actuator,
            clock,
            audit: None,
            config,
        }
    }

    /// Ships every decision to `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Looks the tag up without side effects.
    ///
    /// A cache read failure denies; the gate fails closed.
    #[must_use]
    pub fn decide(&self, credential_id: &CredentialId) -> AccessDecision {
        let key = credential_id.clone().keyed(self.config.key_len);
        match self.credentials.lookup(&key) {
            Ok(Some(record)) if record.active => AccessDecision::Grant(record),
            Ok(Some(_)) => AccessDecision::Deny(DenyReason::Inactive),
            Ok(None) => AccessDecision::Deny(DenyReason::Unknown),
            Err(e) => {
                warn!(credential = %key, error = %e, "credential lookup failed, denying");
                AccessDecision::Deny(DenyReason::StoreError)
            }
        }
    }

    /// Evaluates a scanned tag, pulses the relay on grant, and audits the
    /// decision.
    pub fn evaluate(&self, credential_id: &CredentialId) -> AccessDecision {
        let decision = self.decide(credential_id);
        let address = match &decision {
            AccessDecision::Grant(record) => {
                let address = if record.address_id.is_empty() {
                    self.config.default_address.clone()
                } else {
                    Some(record.address_id.clone())
                };
                info!(credential = %credential_id, resident = %record.resident_id, address = ?address, "access granted");
                match &address {
                    Some(address) => {
                        if let Err(e) = self.actuator.actuate(address, self.config.pulse) {
                            warn!(credential = %credential_id, address = %address, error = %e, "relay actuation failed");
                        }
                    }
                    None => warn!(credential = %credential_id, "granted record has no address and no default is configured"),
                }
                address
            }
            AccessDecision::Deny(reason) => {
                info!(credential = %credential_id, reason = ?reason, "access denied");
                None
            }
        };
        self.audit(credential_id, &decision, address);
        decision
    }

    /// Normalizes raw tag text and evaluates it.
    pub fn scan(&self, raw_tag: &str) -> AccessDecision {
        self.evaluate(&CredentialId::new(raw_tag))
    }

    fn audit(&self, credential_id: &CredentialId, decision: &AccessDecision, address: Option<String>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let (resident_id, deny_reason) = match decision {
            AccessDecision::Grant(record) => (Some(record.resident_id.clone()), None),
            AccessDecision::Deny(reason) => (None, Some(*reason)),
        };
        audit.push(AccessLogEntry {
            at: self.clock.now(),
            community: self.config.community.clone(),
            address_id: address,
            credential_id: Some(credential_id.clone()),
            resident_id,
            command_id: None,
            granted: decision.is_grant(),
            deny_reason,
            source: AccessSource::Reader,
        });
    }
}

impl std::fmt::Debug for AccessEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessEvaluator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Feeds scanned tags to the evaluator until shutdown or reader failure.
///
/// # Errors
/// Returns the reader's error when it fails or closes.
pub fn run_reader_loop(
    reader: &mut dyn TagReader,
    evaluator: &AccessEvaluator,
    shutdown: &ShutdownSignal,
) -> Result<(), HardwareError> {
    info!("tag reader loop started");
    while !shutdown.is_triggered() {
        match reader.read_tag() {
            Ok(Some(tag)) => {
                evaluator.evaluate(&tag);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "tag reader failed");
                return Err(e);
            }
        }
    }
    debug!("tag reader loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clock::ManualClock;
    use crate::hardware::RecordingActuator;
    use crate::storage::{CredentialStore, InMemoryCredentialStore};

    fn setup(config: AccessConfig) -> (AccessEvaluator, Arc<InMemoryCredentialStore>, Arc<RecordingActuator>) {
        let store = Arc::new(InMemoryCredentialStore::default());
        let actuator = Arc::new(RecordingActuator::new());
        let evaluator = AccessEvaluator::new(
            CredentialView::new(store.clone()),
            actuator.clone(),
            Arc::new(ManualClock::default()),
            config,
        );
        (evaluator, store, actuator)
    }

    #[test]
    fn test_grant_pulses_resident_address() {
        let (evaluator, store, actuator) = setup(AccessConfig::default());
        store.upsert(CredentialRecord::new("abc", "r1", "harvey", Utc::now())).unwrap();

        let decision = evaluator.scan(" abc ");
        assert!(decision.is_grant());
        let calls = actuator.actuations();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].address_id, "harvey");
        assert_eq!(calls[0].duration, Duration::from_millis(500));
    }

    #[test]
    fn test_inactive_and_unknown_are_denied() {
        let (evaluator, store, actuator) = setup(AccessConfig::default());
        store
            .upsert(CredentialRecord::new("abc", "r1", "Main", Utc::now()).with_active(false))
            .unwrap();

        assert_eq!(evaluator.scan("abc"), AccessDecision::Deny(DenyReason::Inactive));
        assert_eq!(evaluator.scan("zzz"), AccessDecision::Deny(DenyReason::Unknown));
        assert_eq!(actuator.count(), 0);
    }

    #[test]
    fn test_lookup_uses_reader_key_length() {
        let config = AccessConfig {
            key_len: Some(3),
            ..AccessConfig::default()
        };
        let (evaluator, store, _) = setup(config);
        store.upsert(CredentialRecord::new("abc", "r1", "Main", Utc::now())).unwrap();

        assert!(evaluator.scan("abcdef").is_grant());
    }

    #[test]
    fn test_empty_address_uses_default() {
        let config = AccessConfig {
            default_address: Some("jones".to_string()),
            ..AccessConfig::default()
        };
        let (evaluator, store, actuator) = setup(config);
        store.upsert(CredentialRecord::new("abc", "r1", "", Utc::now())).unwrap();

        assert!(evaluator.scan("abc").is_grant());
        assert_eq!(actuator.actuations()[0].address_id, "jones");
    }

    #[test]
    fn test_actuator_fault_keeps_decision() {
        let (evaluator, store, actuator) = setup(AccessConfig::default());
        store.upsert(CredentialRecord::new("abc", "r1", "Main", Utc::now())).unwrap();
        actuator.fail_next(1);

        assert!(evaluator.scan("abc").is_grant());
        assert_eq!(actuator.count(), 0);
    }

    #[test]
    fn test_reader_loop_stops_when_reader_closes() {
        use crate::hardware::ScriptedTagReader;

        let (evaluator, store, actuator) = setup(AccessConfig::default());
        store.upsert(CredentialRecord::new("abc", "r1", "Main", Utc::now())).unwrap();
        let (tx, mut reader) = ScriptedTagReader::channel(13, Duration::from_millis(5));
        tx.send("#abc".to_string()).unwrap();
        tx.send("#nope".to_string()).unwrap();
        drop(tx);

        let (_trigger, signal) = crate::shutdown::channel();
        let err = run_reader_loop(&mut reader, &evaluator, &signal).unwrap_err();
        assert!(matches!(err, HardwareError::ReaderClosed));
        assert_eq!(actuator.count(), 1);
    }
}
