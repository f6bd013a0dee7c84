//! Error types for the gateway.
//!
//! All errors are strongly typed using thiserror. Each layer has its own
//! enum and the top-level [`GatewayError`] composes them, so callers can
//! match on the precise failure while still propagating with `?`.

use thiserror::Error;

use crate::storage::StoreError;

/// Errors raised by a remote feed subscription or a remote write.
///
/// Every variant is a `TransientNetworkError` in the gateway's taxonomy:
/// it is retried with backoff and never surfaced beyond the log.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("Transient network error: {message}")]
    TransientNetwork {
        message: String,
    },

    #[error("Feed disconnected: {feed}")]
    Disconnected {
        feed: String,
    },

    #[error("Feed protocol error: {message}")]
    Protocol {
        message: String,
    },
}

impl FeedError {
    /// Creates a transient network error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    /// Creates a disconnection error for the named feed.
    #[must_use]
    pub fn disconnected(feed: impl Into<String>) -> Self {
        Self::Disconnected { feed: feed.into() }
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        Self::TransientNetwork {
            message: err.to_string(),
        }
    }
}

/// Reasons a remote command is refused without actuation.
///
/// None of these are faults: the command is logged, acknowledged where
/// appropriate, and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandRejection {
    #[error("Stale command {command_id}: issued {age_secs}s ago, outside the retention window")]
    StaleCommand {
        command_id: String,
        age_secs: i64,
    },

    #[error("Duplicate command {command_id}: already actuated")]
    DuplicateCommand {
        command_id: String,
    },

    #[error("Unknown command kind '{kind}' in command {command_id}")]
    UnknownCommandKind {
        command_id: String,
        kind: String,
    },

    #[error("Unknown address '{address}' in command {command_id}")]
    UnknownAddress {
        command_id: String,
        address: String,
    },

    #[error("Command {command_id} targets community '{community}'")]
    WrongCommunity {
        command_id: String,
        community: String,
    },
}

impl CommandRejection {
    /// The id of the rejected command.
    #[must_use]
    pub fn command_id(&self) -> &str {
        match self {
            Self::StaleCommand { command_id, .. }
            | Self::DuplicateCommand { command_id }
            | Self::UnknownCommandKind { command_id, .. }
            | Self::UnknownAddress { command_id, .. }
            | Self::WrongCommunity { command_id, .. } => command_id,
        }
    }
}

/// Errors from the relay actuator or the tag reader.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("No relay mapped for address '{address}'")]
    UnknownAddress {
        address: String,
    },

    #[error("Relay {relay} command failed: {message}")]
    RelayFailed {
        relay: u8,
        message: String,
    },

    #[error("Tag reader closed")]
    ReaderClosed,

    #[error("Hardware I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {message}")]
    Io {
        path: String,
        message: String,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config field '{field}': {reason}")]
    Invalid {
        field: String,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Command rejected: {0}")]
    Command(#[from] CommandRejection),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// The local store stayed unavailable past the retry ceiling.
    #[error("Fatal store failure after {attempts} attempts: {message}")]
    FatalStoreFailure {
        attempts: u32,
        message: String,
    },

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl GatewayError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error should end the process so the service
    /// manager can restart it.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalStoreFailure { .. } | Self::Store(_) | Self::Internal { .. }
        )
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Feed(_) => true,
            Self::Store(e) => e.is_unavailable(),
            Self::Command(_)
            | Self::Hardware(_)
            | Self::Config(_)
            | Self::FatalStoreFailure { .. }
            | Self::Shutdown
            | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
