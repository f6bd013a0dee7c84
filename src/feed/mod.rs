//! Remote change feeds.
//!
//! The remote store is an opaque push source. Its callback-style delivery
//! is modeled here as a blocking pull: a [`Subscription`] hands out one
//! message per `recv` call and reports connectivity faults as errors, so
//! the consumers can be driven by a scripted source in tests.
//!
//! Every (re)subscription to the credential feed starts with a full
//! snapshot (one `Added` per record) terminated by `SnapshotComplete`.
//! Nothing is guaranteed across subscriptions; consumers must tolerate
//! redelivery.

mod ndjson;
mod scripted;

pub use ndjson::NdjsonRemote;
pub use scripted::ScriptedRemote;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::access::AccessLogEntry;
use crate::command::{AckStatus, CommandEnvelope};
use crate::credential::{CredentialId, CredentialRecord};
use crate::error::FeedError;

/// An incremental change to the remote credential set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A record appeared (also used for every snapshot entry).
    Added(CredentialRecord),
    /// An existing record changed.
    Modified(CredentialRecord),
    /// A record was deleted.
    Removed(CredentialId),
    /// The snapshot that opens a subscription is complete.
    SnapshotComplete,
}

impl ChangeEvent {
    /// The credential this event concerns, if any.
    #[must_use]
    pub fn credential_id(&self) -> Option<&CredentialId> {
        match self {
            Self::Added(record) | Self::Modified(record) => Some(&record.credential_id),
            Self::Removed(id) => Some(id),
            Self::SnapshotComplete => None,
        }
    }
}

/// One message from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage<T> {
    /// A payload item.
    Item(T),
    /// Explicit liveness signal with no payload.
    Keepalive,
}

/// The two feeds the gateway subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// Credential change feed.
    Credentials,
    /// Remote command feed.
    Commands,
}

impl FeedKind {
    /// Short name used in logs and on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Credentials => "credentials",
            Self::Commands => "commands",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live subscription to one feed.
pub trait Subscription<T>: Send {
    /// Blocks for up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing delivered
    /// or when an undecodable message was skipped. An error means the
    /// subscription is dead and must be replaced.
    fn recv(&mut self, timeout: Duration) -> Result<Option<FeedMessage<T>>, FeedError>;

    /// Releases remote resources. Idempotent; later `recv` calls fail.
    fn close(&mut self);
}

/// Boxed credential subscription.
pub type ChangeSubscription = Box<dyn Subscription<ChangeEvent>>;

/// Boxed command subscription.
pub type CommandSubscription = Box<dyn Subscription<CommandEnvelope>>;

/// The remote store as seen by the gateway.
pub trait RemoteStore: Send + Sync {
    /// Opens the credential feed.
    fn subscribe_credentials(&self, community: Option<&str>)
        -> Result<ChangeSubscription, FeedError>;

    /// Opens the command feed.
    fn subscribe_commands(&self, community: Option<&str>) -> Result<CommandSubscription, FeedError>;

    /// Writes a command's processing status back to the remote store.
    fn acknowledge(&self, command_id: &str, status: AckStatus) -> Result<(), FeedError>;

    /// Ships one access decision to the remote audit log.
    fn log_access(&self, entry: &AccessLogEntry) -> Result<(), FeedError>;
}

/// Payload types carried by a feed.
pub trait FeedItem: Send + Sized + 'static {
    /// Which feed carries this type.
    const KIND: FeedKind;

    /// Opens a subscription for this feed.
    fn open(
        remote: &dyn RemoteStore,
        community: Option<&str>,
    ) -> Result<Box<dyn Subscription<Self>>, FeedError>;
}

impl FeedItem for ChangeEvent {
    const KIND: FeedKind = FeedKind::Credentials;

    fn open(remote: &dyn RemoteStore, community: Option<&str>) -> Result<ChangeSubscription, FeedError> {
        remote.subscribe_credentials(community)
    }
}

impl FeedItem for CommandEnvelope {
    const KIND: FeedKind = FeedKind::Commands;

    fn open(remote: &dyn RemoteStore, community: Option<&str>) -> Result<CommandSubscription, FeedError> {
        remote.subscribe_commands(community)
    }
}

/// A restartable client for one feed.
///
/// Holds at most one subscription at a time; `subscribe` closes the
/// previous one before opening the next.
pub struct FeedClient<T: FeedItem> {
    remote: Arc<dyn RemoteStore>,
    community: Option<String>,
    subscription: Option<Box<dyn Subscription<T>>>,
}

/// Client for the credential change feed.
pub type ChangeFeedClient = FeedClient<ChangeEvent>;

/// Client for the command feed.
pub type CommandFeedClient = FeedClient<CommandEnvelope>;

impl<T: FeedItem> FeedClient<T> {
    /// Creates an unsubscribed client.
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteStore>, community: Option<String>) -> Self {
        Self {
            remote,
            community,
            subscription: None,
        }
    }

    /// The feed this client reads.
    #[must_use]
    pub const fn kind(&self) -> FeedKind {
        T::KIND
    }

    /// (Re)subscribes, closing any current subscription first.
    pub fn subscribe(&mut self) -> Result<(), FeedError> {
        self.close();
        let subscription = T::open(self.remote.as_ref(), self.community.as_deref())?;
        debug!(feed = %T::KIND, "subscribed");
        self.subscription = Some(subscription);
        Ok(())
    }

    /// Blocks for up to `timeout` for the next message.
    ///
    /// A failed subscription is dropped, so the client reads as
    /// unsubscribed until the next `subscribe`.
    pub fn next(&mut self, timeout: Duration) -> Result<Option<FeedMessage<T>>, FeedError> {
        let Some(subscription) = self.subscription.as_mut() else {
            return Err(FeedError::disconnected(T::KIND.as_str()));
        };
        let result = subscription.recv(timeout);
        if result.is_err() {
            self.close();
        }
        result
    }

    /// Closes the current subscription, if any.
    pub fn close(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
    }

    /// Returns true while a subscription is open.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }
}

impl<T: FeedItem> Drop for FeedClient<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: FeedItem> fmt::Debug for FeedClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedClient")
            .field("feed", &T::KIND)
            .field("community", &self.community)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}
