//! Remote actuation commands.
//!
//! The command vocabulary is a wire-level contract with the remote store:
//! the kind strings and their actuation durations must not change.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CommandRejection;

/// Relay pulse for `open_gate` and for a granted tag scan.
pub const OPEN_GATE_PULSE: Duration = Duration::from_millis(500);

/// Relay hold for `pairing_mode`.
pub const PAIRING_MODE_HOLD: Duration = Duration::from_millis(10_000);

/// The kind of actuation a command requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Short pulse on the gate relay.
    OpenGate,
    /// Long hold so a new tag can be paired at the reader.
    PairingMode,
}

impl CommandKind {
    /// Parses a wire kind string. Matching is exact.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open_gate" => Some(Self::OpenGate),
            "pairing_mode" => Some(Self::PairingMode),
            _ => None,
        }
    }

    /// The wire string for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenGate => "open_gate",
            Self::PairingMode => "pairing_mode",
        }
    }

    /// How long the relay stays energized.
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::OpenGate => OPEN_GATE_PULSE,
            Self::PairingMode => PAIRING_MODE_HOLD,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command exactly as delivered by the command feed.
///
/// The kind is kept as the raw wire string so that unknown kinds can be
/// rejected and acknowledged instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Unique command id.
    pub command_id: String,
    /// Raw kind string (`open_gate`, `pairing_mode`, ...).
    #[serde(rename = "command")]
    pub kind: String,
    /// Target address; empty means the site's default address.
    #[serde(default)]
    pub address: String,
    /// Community the command was issued for.
    #[serde(default)]
    pub community: Option<String>,
    /// When the command was issued at the remote store.
    pub issued_at: DateTime<Utc>,
}

impl CommandEnvelope {
    /// Creates an envelope for a known kind.
    #[must_use]
    pub fn new(
        command_id: impl Into<String>,
        kind: CommandKind,
        address: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            kind: kind.as_str().to_string(),
            address: address.into(),
            community: None,
            issued_at,
        }
    }

    /// Sets the community.
    #[must_use]
    pub fn for_community(mut self, community: impl Into<String>) -> Self {
        self.community = Some(community.into());
        self
    }

    /// Resolves the kind, rejecting unknown vocabulary.
    pub fn parse_kind(&self) -> Result<CommandKind, CommandRejection> {
        CommandKind::parse(self.kind.trim()).ok_or_else(|| CommandRejection::UnknownCommandKind {
            command_id: self.command_id.clone(),
            kind: self.kind.clone(),
        })
    }
}

/// A validated command bound to a served address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Unique command id.
    pub command_id: String,
    /// Requested actuation.
    pub kind: CommandKind,
    /// Resolved target address.
    pub address_id: String,
    /// When the command was issued.
    pub issued_at: DateTime<Utc>,
    /// Set once the command has been recorded in the ledger.
    pub consumed: bool,
}

/// Status written back to the remote store for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Actuated by this gateway.
    Processed,
    /// Already actuated earlier; the remote copy can be cleared.
    Duplicate,
    /// Outside the retention window.
    RejectedStale,
    /// Unknown kind string.
    RejectedUnknownKind,
    /// Address not served by this gateway.
    RejectedUnknownAddress,
}

impl AckStatus {
    /// The wire string for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Duplicate => "duplicate",
            Self::RejectedStale => "rejected_stale",
            Self::RejectedUnknownKind => "rejected_unknown_kind",
            Self::RejectedUnknownAddress => "rejected_unknown_address",
        }
    }

    /// The status reported for a rejection, if the rejection is acknowledged.
    #[must_use]
    pub const fn for_rejection(rejection: &CommandRejection) -> Option<Self> {
        match rejection {
            CommandRejection::StaleCommand { .. } => Some(Self::RejectedStale),
            CommandRejection::DuplicateCommand { .. } => Some(Self::Duplicate),
            CommandRejection::UnknownCommandKind { .. } => Some(Self::RejectedUnknownKind),
            CommandRejection::UnknownAddress { .. } => Some(Self::RejectedUnknownAddress),
            // Not ours to acknowledge.
            CommandRejection::WrongCommunity { .. } => None,
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
