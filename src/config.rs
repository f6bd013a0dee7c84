//! Gateway configuration.
//!
//! Loaded from a JSON file. Every field has a default, so an empty object
//! is a valid (dry) configuration; `validate` enforces the minimums.
//!
//! ```json
//! {
//!   "site": { "community": "Transcore", "addresses": ["Jones House", "Harvey House"] },
//!   "store": { "data_dir": "/var/lib/gatewarden" },
//!   "hardware": {
//!     "device": "/dev/ttyUSB0",
//!     "relay": { "program": "/usr/local/bin/relay", "relays": { "Jones House": 1, "Harvey House": 2 } }
//!   },
//!   "remote": { "address": "resilive.local:7070" }
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::AccessConfig;
use crate::backoff::BackoffPolicy;
use crate::command::OPEN_GATE_PULSE;
use crate::error::ConfigError;
use crate::outbox::OutboxConfig;
use crate::processor::ProcessorConfig;
use crate::storage::PersistentConfig;
use crate::sync::SyncConfig;
use crate::watchdog::WatchdogConfig;

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserializes from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Site identity and the addresses this gateway serves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Community name; commands for other communities are ignored.
    pub community: Option<String>,
    /// Served addresses. Empty accepts any address.
    pub addresses: Vec<String>,
    /// Address used when a command or record names none.
    pub default_address: Option<String>,
}

/// Local persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the snapshot, WAL and lock file.
    pub data_dir: PathBuf,
    /// Storage engine settings.
    #[serde(flatten)]
    pub engine: PersistentConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/gatewarden"),
            engine: PersistentConfig::default(),
        }
    }
}

/// Bounded retries against the local store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff between attempts.
    pub backoff: BackoffPolicy,
    /// Attempts before the failure is fatal.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 8,
        }
    }
}

/// Remote command handling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Whether to subscribe to remote commands at all.
    pub enabled: bool,
    /// Staleness limit and ledger retention.
    #[serde(rename = "retention_ms", with = "duration_ms")]
    pub retention: Duration,
    /// Acknowledgment delivery.
    pub acks: OutboxConfig,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: Duration::from_secs(24 * 60 * 60),
            acks: OutboxConfig::default(),
        }
    }
}

/// Relay control program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Program invoked as `<program> <args...> <relay> <1|0>`.
    pub program: PathBuf,
    /// Leading arguments.
    pub args: Vec<String>,
    /// Address id to relay number.
    pub relays: HashMap<String, u8>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("relay"),
            args: Vec::new(),
            relays: HashMap::new(),
        }
    }
}

/// Reader and relay hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Tag reader device. No reader loop runs when unset.
    pub device: Option<PathBuf>,
    /// Frame tag length, including the leading `#`.
    pub tag_len: usize,
    /// Relay pulse for a granted scan.
    #[serde(rename = "pulse_ms", with = "duration_ms")]
    pub pulse: Duration,
    /// Relay program.
    pub relay: RelayConfig,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            device: None,
            tag_len: 13,
            pulse: OPEN_GATE_PULSE,
            relay: RelayConfig::default(),
        }
    }
}

impl HardwareConfig {
    /// Number of tag characters compared; stored ids are truncated to it.
    #[must_use]
    pub const fn key_len(&self) -> usize {
        self.tag_len.saturating_sub(1)
    }
}

/// Remote store endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// `host:port` of the line-delimited JSON endpoint.
    pub address: String,
    /// TCP connect timeout.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Timeout for one-shot requests.
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    /// Whether access decisions are shipped to the remote log.
    pub audit: bool,
    /// Audit delivery.
    pub audit_outbox: OutboxConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7070".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            audit: true,
            audit_outbox: OutboxConfig::default(),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Site identity.
    pub site: SiteConfig,
    /// Local persistence.
    pub store: StoreConfig,
    /// Watchdog settings shared by both feeds.
    pub feed: WatchdogConfig,
    /// Sync engine store retries.
    pub sync: RetryConfig,
    /// Remote commands.
    pub commands: CommandsConfig,
    /// Hardware.
    pub hardware: HardwareConfig,
    /// Remote store.
    pub remote: RemoteConfig,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: Option<String>,
}

impl GatewayConfig {
    const MIN_HEARTBEAT: Duration = Duration::from_secs(1);
    const MIN_RETENTION: Duration = Duration::from_secs(60);

    /// Reads and validates a JSON config file.
    ///
    /// # Errors
    /// `ConfigError::Io` if the file cannot be read, `Parse` if it is not
    /// valid JSON for this shape, `Invalid` if validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    /// `Parse` or `Invalid`.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the offending field.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        self.store.engine = self.store.engine.validate()?;

        if self.feed.heartbeat_timeout < Self::MIN_HEARTBEAT {
            return Err(ConfigError::invalid("feed.heartbeat_timeout_ms", "must be at least 1000"));
        }
        if self.feed.poll_interval.is_zero() || self.feed.poll_interval > self.feed.heartbeat_timeout {
            return Err(ConfigError::invalid(
                "feed.poll_interval_ms",
                "must be positive and no longer than the heartbeat timeout",
            ));
        }
        validate_backoff("feed.backoff", &self.feed.backoff)?;
        validate_backoff("sync.backoff", &self.sync.backoff)?;
        validate_backoff("commands.acks.retry", &self.commands.acks.retry)?;
        validate_backoff("remote.audit_outbox.retry", &self.remote.audit_outbox.retry)?;
        if self.sync.max_attempts == 0 {
            return Err(ConfigError::invalid("sync.max_attempts", "must be at least 1"));
        }
        if self.commands.retention < Self::MIN_RETENTION {
            return Err(ConfigError::invalid("commands.retention_ms", "must be at least 60000"));
        }
        if self.hardware.tag_len < 2 {
            return Err(ConfigError::invalid("hardware.tag_len", "must be at least 2"));
        }
        if let Some(default) = &self.site.default_address {
            if !self.site.addresses.is_empty()
                && !self.site.addresses.iter().any(|a| a.eq_ignore_ascii_case(default))
            {
                return Err(ConfigError::invalid(
                    "site.default_address",
                    format!("'{default}' is not one of site.addresses"),
                ));
            }
        }
        if self.remote.address.trim().is_empty() {
            return Err(ConfigError::invalid("remote.address", "must not be empty"));
        }
        Ok(self)
    }

    /// Sync engine settings.
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            retry: self.sync.backoff,
            max_attempts: self.sync.max_attempts,
            key_len: Some(self.hardware.key_len()),
        }
    }

    /// Command processor settings.
    #[must_use]
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            community: self.site.community.clone(),
            addresses: self.site.addresses.clone(),
            default_address: self.site.default_address.clone(),
            retention: self.commands.retention,
            store_retry: self.sync.backoff,
            store_max_attempts: self.sync.max_attempts,
        }
    }

    /// Access evaluator settings.
    #[must_use]
    pub fn access_config(&self) -> AccessConfig {
        AccessConfig {
            community: self.site.community.clone(),
            default_address: self.site.default_address.clone(),
            key_len: Some(self.hardware.key_len()),
            pulse: self.hardware.pulse,
        }
    }
}

fn validate_backoff(field: &str, policy: &BackoffPolicy) -> Result<(), ConfigError> {
    if policy.base.is_zero() || policy.cap < policy.base {
        return Err(ConfigError::invalid(field, "base must be positive and no larger than cap"));
    }
    if !(0.0..=1.0).contains(&policy.jitter) {
        return Err(ConfigError::invalid(field, "jitter must be within [0, 1]"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = GatewayConfig::from_json_str("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.feed.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.commands.retention, Duration::from_secs(86_400));
        assert_eq!(config.hardware.tag_len, 13);
        assert!(config.commands.enabled);
    }

    #[test]
    fn test_partial_document_overrides() {
        let config = GatewayConfig::from_json_str(
            r#"{
                "site": { "community": "Transcore", "addresses": ["Jones House", "Harvey House"],
                          "default_address": "jones house" },
                "store": { "data_dir": "/tmp/gw", "max_wal_size": 65536 },
                "feed": { "heartbeat_timeout_ms": 30000, "backoff": { "base_ms": 500, "cap_ms": 10000 } },
                "commands": { "enabled": false },
                "hardware": { "relay": { "program": "/bin/relay", "relays": { "Jones House": 1 } } },
                "log_level": "debug"
            }"#,
        )
        .unwrap();

        assert_eq!(config.site.community.as_deref(), Some("Transcore"));
        assert_eq!(config.store.data_dir, PathBuf::from("/tmp/gw"));
        assert_eq!(config.store.engine.max_wal_size, 65_536);
        assert!(config.store.engine.sync_on_write);
        assert_eq!(config.feed.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.feed.backoff.base, Duration::from_millis(500));
        assert_eq!(config.feed.backoff.jitter, BackoffPolicy::default().jitter);
        assert!(!config.commands.enabled);
        assert_eq!(config.hardware.relay.relays.get("Jones House"), Some(&1));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_validation_names_the_field() {
        let cases = [
            (r#"{"feed": {"heartbeat_timeout_ms": 10}}"#, "feed.heartbeat_timeout_ms"),
            (r#"{"feed": {"poll_interval_ms": 0}}"#, "feed.poll_interval_ms"),
            (r#"{"sync": {"backoff": {"base_ms": 0}}}"#, "sync.backoff"),
            (r#"{"commands": {"retention_ms": 5}}"#, "commands.retention_ms"),
            (r#"{"hardware": {"tag_len": 1}}"#, "hardware.tag_len"),
            (r#"{"store": {"max_wal_size": 10}}"#, "store.max_wal_size"),
            (
                r#"{"site": {"addresses": ["A"], "default_address": "B"}}"#,
                "site.default_address",
            ),
        ];
        for (doc, expected) in cases {
            match GatewayConfig::from_json_str(doc) {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected, "{doc}"),
                other => panic!("{doc}: expected Invalid, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_derived_component_configs() {
        let mut config = GatewayConfig::default();
        config.site.community = Some("Transcore".to_string());
        config.site.addresses = vec!["Main".to_string()];

        assert_eq!(config.sync_config().key_len, Some(12));
        assert_eq!(config.access_config().key_len, Some(12));
        assert_eq!(config.access_config().pulse, Duration::from_millis(500));
        let processor = config.processor_config();
        assert_eq!(processor.addresses, vec!["Main".to_string()]);
        assert_eq!(processor.retention, Duration::from_secs(86_400));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = GatewayConfig::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));

        let path = dir.path().join("gateway.json");
        fs::write(&path, r#"{"remote": {"address": "10.0.0.2:7070"}}"#).unwrap();
        assert_eq!(GatewayConfig::load(&path).unwrap().remote.address, "10.0.0.2:7070");
    }
}
