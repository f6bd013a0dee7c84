//! # Gatewarden - offline-first RFID access gateway
//!
//! Gatewarden runs on the small computer next to a community gate. It keeps
//! a local cache of authorized credentials in sync with a remote store,
//! executes remote gate commands exactly once, and answers tag scans from
//! the local cache, so the gate keeps working while the network is down.
//!
//! ## Components
//!
//! - **Credential store** ([`storage`]): durable cache keyed by credential id
//!   plus the command ledger, on a shared write-ahead log
//! - **Feed client** ([`feed`]): restartable subscriptions to the remote
//!   credential and command feeds
//! - **Sync engine** ([`sync`]): last-writer-wins application of change events
//!   and reconciliation after every full snapshot
//! - **Command processor** ([`processor`]): dedup, staleness and routing of
//!   remote commands before actuation
//! - **Watchdog** ([`watchdog`]): heartbeat tracking and reconnect backoff
//! - **Access evaluator** ([`access`]): grant or deny for scanned tags
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use gatewarden::access::{AccessConfig, AccessEvaluator};
//! use gatewarden::clock::SystemClock;
//! use gatewarden::hardware::RecordingActuator;
//! use gatewarden::storage::{CredentialStore, CredentialView, InMemoryCredentialStore};
//! use gatewarden::CredentialRecord;
//!
//! let store = Arc::new(InMemoryCredentialStore::default());
//! store.upsert(CredentialRecord::new("0A1B2C3D4E5F", "resident-7", "Main", Utc::now()))?;
//!
//! let actuator = Arc::new(RecordingActuator::new());
//! let evaluator = AccessEvaluator::new(
//!     CredentialView::new(store),
//!     actuator.clone(),
//!     Arc::new(SystemClock),
//!     AccessConfig::default(),
//! );
//!
//! assert!(evaluator.scan("0a1b2c3d4e5f").is_grant());
//! assert_eq!(actuator.count(), 1);
//! # Ok::<(), gatewarden::storage::StoreError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod clock;
pub mod command;
pub mod credential;
pub mod error;

// Storage and remote feeds
pub mod feed;
pub mod storage;

// Components
pub mod access;
pub mod backoff;
pub mod hardware;
pub mod outbox;
pub mod processor;
pub mod shutdown;
pub mod sync;
pub mod watchdog;

// Process wiring
pub mod config;
pub mod gateway;
pub mod logging;

// Re-export primary types at crate root for convenience
pub use access::{AccessDecision, AccessEvaluator, AccessLogEntry, DenyReason};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{AckStatus, Command, CommandEnvelope, CommandKind};
pub use config::GatewayConfig;
pub use credential::{CredentialId, CredentialRecord};
pub use error::{CommandRejection, ConfigError, FeedError, GatewayError, GatewayResult, HardwareError};
pub use feed::{ChangeEvent, FeedClient, FeedKind, FeedMessage, RemoteStore, Subscription};
pub use gateway::{Gateway, GatewayHandle, GatewayParts, Health};
pub use processor::{CommandOutcome, CommandProcessor};
pub use storage::{CommandLedger, CredentialStore, StoreError};
pub use sync::{ApplyOutcome, SyncEngine};
pub use watchdog::{ConnectionHandle, ConnectionState, FeedStatus, FeedWatchdog};
