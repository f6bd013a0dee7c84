//! Scripted in-process remote store.
//!
//! Holds the authoritative credential set and the outstanding commands in
//! memory and pushes changes to live subscriptions over crossbeam
//! channels. Tests drive it to simulate remote edits, outages, missed
//! deletions and redelivery.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::access::AccessLogEntry;
use crate::command::{AckStatus, CommandEnvelope};
use crate::credential::{CredentialId, CredentialRecord};
use crate::error::FeedError;

use super::{ChangeEvent, ChangeSubscription, CommandSubscription, FeedKind, FeedMessage, RemoteStore, Subscription};

type Delivery<T> = Result<FeedMessage<T>, FeedError>;

struct Subscriber<T> {
    tx: Sender<Delivery<T>>,
    open: Arc<AtomicBool>,
}

impl<T> Subscriber<T> {
    fn deliver(&self, delivery: Delivery<T>) -> bool {
        self.open.load(Ordering::Acquire) && self.tx.send(delivery).is_ok()
    }
}

#[derive(Default)]
struct ScriptState {
    online: bool,
    credentials: BTreeMap<CredentialId, CredentialRecord>,
    outstanding: Vec<CommandEnvelope>,
    credential_subscribers: Vec<Subscriber<ChangeEvent>>,
    command_subscribers: Vec<Subscriber<CommandEnvelope>>,
    credential_subscriptions: usize,
    command_subscriptions: usize,
    failing_acks: usize,
    acks: Vec<(String, AckStatus)>,
    access_log: Vec<AccessLogEntry>,
}

/// In-memory [`RemoteStore`] driven by test code.
#[derive(Clone)]
pub struct ScriptedRemote {
    state: Arc<Mutex<ScriptState>>,
}

impl Default for ScriptedRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptedRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ScriptedRemote")
            .field("online", &state.online)
            .field("credentials", &state.credentials.len())
            .field("outstanding", &state.outstanding.len())
            .finish_non_exhaustive()
    }
}

impl ScriptedRemote {
    /// Creates an online remote with no data.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                online: true,
                ..ScriptState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces a remote record and notifies subscribers.
    pub fn put_credential(&self, record: CredentialRecord) {
        let mut state = self.lock();
        let existed = state
            .credentials
            .insert(record.credential_id.clone(), record.clone())
            .is_some();
        let event = if existed {
            ChangeEvent::Modified(record)
        } else {
            ChangeEvent::Added(record)
        };
        state
            .credential_subscribers
            .retain(|s| s.deliver(Ok(FeedMessage::Item(event.clone()))));
    }

    /// Deletes a remote record and notifies subscribers.
    pub fn delete_credential(&self, id: impl Into<CredentialId>) {
        let id = id.into();
        let mut state = self.lock();
        if state.credentials.remove(&id).is_some() {
            state
                .credential_subscribers
                .retain(|s| s.deliver(Ok(FeedMessage::Item(ChangeEvent::Removed(id.clone())))));
        }
    }

    /// Deletes a remote record without telling anyone, as if the event
    /// was lost while the gateway was disconnected.
    pub fn silent_delete(&self, id: impl Into<CredentialId>) {
        self.lock().credentials.remove(&id.into());
    }

    /// Pushes a raw change event to live credential subscribers without
    /// touching the remote state. Used to replay stale or duplicate events.
    pub fn push_change(&self, event: ChangeEvent) {
        self.lock()
            .credential_subscribers
            .retain(|s| s.deliver(Ok(FeedMessage::Item(event.clone()))));
    }

    /// Queues a command. It is delivered to live subscribers now and to
    /// every later subscription until acknowledged.
    pub fn push_command(&self, envelope: CommandEnvelope) {
        let mut state = self.lock();
        state.outstanding.push(envelope.clone());
        state
            .command_subscribers
            .retain(|s| s.deliver(Ok(FeedMessage::Item(envelope.clone()))));
    }

    /// Sends a keepalive on every live subscription.
    pub fn keepalive(&self) {
        let mut state = self.lock();
        state.credential_subscribers.retain(|s| s.deliver(Ok(FeedMessage::Keepalive)));
        state.command_subscribers.retain(|s| s.deliver(Ok(FeedMessage::Keepalive)));
    }

    /// Breaks every live subscription and refuses new ones.
    pub fn go_offline(&self) {
        let mut state = self.lock();
        state.online = false;
        for s in state.credential_subscribers.drain(..) {
            s.deliver(Err(FeedError::disconnected(FeedKind::Credentials.as_str())));
        }
        for s in state.command_subscribers.drain(..) {
            s.deliver(Err(FeedError::disconnected(FeedKind::Commands.as_str())));
        }
    }

    /// Accepts subscriptions again.
    pub fn go_online(&self) {
        self.lock().online = true;
    }

    /// Makes the next `n` acknowledgments fail with a transient error.
    pub fn fail_next_acks(&self, n: usize) {
        self.lock().failing_acks = n;
    }

    /// Acknowledgments received so far, in order.
    #[must_use]
    pub fn acks(&self) -> Vec<(String, AckStatus)> {
        self.lock().acks.clone()
    }

    /// Access log entries received so far, in order.
    #[must_use]
    pub fn access_log(&self) -> Vec<AccessLogEntry> {
        self.lock().access_log.clone()
    }

    /// Ids of commands not yet acknowledged.
    #[must_use]
    pub fn outstanding_commands(&self) -> Vec<String> {
        self.lock().outstanding.iter().map(|c| c.command_id.clone()).collect()
    }

    /// Total credential subscriptions opened.
    #[must_use]
    pub fn credential_subscriptions(&self) -> usize {
        self.lock().credential_subscriptions
    }

    /// Total command subscriptions opened.
    #[must_use]
    pub fn command_subscriptions(&self) -> usize {
        self.lock().command_subscriptions
    }

    /// Credential subscriptions not yet closed.
    #[must_use]
    pub fn open_credential_subscriptions(&self) -> usize {
        let mut state = self.lock();
        state.credential_subscribers.retain(|s| s.open.load(Ordering::Acquire));
        state.credential_subscribers.len()
    }

    /// Command subscriptions not yet closed.
    #[must_use]
    pub fn open_command_subscriptions(&self) -> usize {
        let mut state = self.lock();
        state.command_subscribers.retain(|s| s.open.load(Ordering::Acquire));
        state.command_subscribers.len()
    }
}

impl RemoteStore for ScriptedRemote {
    fn subscribe_credentials(&self, _community: Option<&str>) -> Result<ChangeSubscription, FeedError> {
        let mut state = self.lock();
        if !state.online {
            return Err(FeedError::transient("remote store unreachable"));
        }
        let (tx, rx) = unbounded();
        for record in state.credentials.values() {
            let _ = tx.send(Ok(FeedMessage::Item(ChangeEvent::Added(record.clone()))));
        }
        let _ = tx.send(Ok(FeedMessage::Item(ChangeEvent::SnapshotComplete)));

        let open = Arc::new(AtomicBool::new(true));
        state.credential_subscribers.push(Subscriber {
            tx,
            open: Arc::clone(&open),
        });
        state.credential_subscriptions += 1;
        Ok(Box::new(ScriptedSubscription::new(rx, open, FeedKind::Credentials)))
    }

    fn subscribe_commands(&self, _community: Option<&str>) -> Result<CommandSubscription, FeedError> {
        let mut state = self.lock();
        if !state.online {
            return Err(FeedError::transient("remote store unreachable"));
        }
        let (tx, rx) = unbounded();
        for envelope in &state.outstanding {
            let _ = tx.send(Ok(FeedMessage::Item(envelope.clone())));
        }

        let open = Arc::new(AtomicBool::new(true));
        state.command_subscribers.push(Subscriber {
            tx,
            open: Arc::clone(&open),
        });
        state.command_subscriptions += 1;
        Ok(Box::new(ScriptedSubscription::new(rx, open, FeedKind::Commands)))
    }

    fn acknowledge(&self, command_id: &str, status: AckStatus) -> Result<(), FeedError> {
        let mut state = self.lock();
        if !state.online {
            return Err(FeedError::transient("remote store unreachable"));
        }
        if state.failing_acks > 0 {
            state.failing_acks -= 1;
            return Err(FeedError::transient("acknowledgment timed out"));
        }
        state.outstanding.retain(|c| c.command_id != command_id);
        state.acks.push((command_id.to_string(), status));
        Ok(())
    }

    fn log_access(&self, entry: &AccessLogEntry) -> Result<(), FeedError> {
        let mut state = self.lock();
        if !state.online {
            return Err(FeedError::transient("remote store unreachable"));
        }
        state.access_log.push(entry.clone());
        Ok(())
    }
}

struct ScriptedSubscription<T> {
    rx: Receiver<Delivery<T>>,
    open: Arc<AtomicBool>,
    kind: FeedKind,
}

impl<T> ScriptedSubscription<T> {
    fn new(rx: Receiver<Delivery<T>>, open: Arc<AtomicBool>, kind: FeedKind) -> Self {
        Self { rx, open, kind }
    }
}

impl<T: Send> Subscription<T> for ScriptedSubscription<T> {
    fn recv(&mut self, timeout: Duration) -> Result<Option<FeedMessage<T>>, FeedError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(FeedError::disconnected(self.kind.as_str()));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(delivery) => delivery.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(FeedError::disconnected(self.kind.as_str())),
        }
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::Release);
        // Replace the receiver so the remote side sees a dead channel.
        let (_, rx) = unbounded();
        self.rx = rx;
    }
}
