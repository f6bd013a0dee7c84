//! Background delivery queue for remote writes.
//!
//! Acknowledgments and audit entries are written to the remote store from
//! a dedicated worker thread so a slow or unreachable remote never stalls
//! command intake or the reader loop. Producers enqueue with a
//! non-blocking `try_send`; a full queue drops the item and counts it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::error::FeedError;
use crate::shutdown::{self, ShutdownSignal, ShutdownTrigger};

/// Delivery function run on the worker thread.
pub type Deliver<T> = Box<dyn Fn(&T) -> Result<(), FeedError> + Send>;

/// Outbox settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Queue capacity.
    pub capacity: usize,
    /// Backoff between delivery attempts.
    pub retry: BackoffPolicy,
    /// Attempts per item before it is dropped.
    pub max_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            retry: BackoffPolicy::default(),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    abandoned: AtomicU64,
}

/// A bounded queue drained by one delivery thread.
pub struct Outbox<T: Send + 'static> {
    name: &'static str,
    tx: Sender<T>,
    stop: ShutdownTrigger,
    counters: Arc<Counters>,
    join: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Outbox<T> {
    /// Starts the worker thread.
    ///
    /// # Panics
    /// If the worker thread cannot be spawned.
    pub fn spawn(name: &'static str, config: OutboxConfig, deliver: Deliver<T>) -> Self {
        let (tx, rx) = bounded::<T>(config.capacity.max(1));
        let (stop, stopped) = shutdown::channel();
        let counters = Arc::new(Counters::default());

        let thread_counters = Arc::clone(&counters);
        let join = thread::Builder::new()
            .name(format!("gatewarden-{name}"))
            .spawn(move || worker_loop(name, config, &deliver, &rx, &stopped, &thread_counters))
            .expect("failed to spawn gatewarden outbox worker");

        Self {
            name,
            tx,
            stop,
            counters,
            join: Some(join),
        }
    }

    /// Enqueues an item without blocking. Returns false if it was dropped.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(outbox = self.name, dropped, "outbox full, item dropped");
                false
            }
        }
    }

    /// Items delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    /// Items refused because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Items given up on after exhausting their attempts.
    #[must_use]
    pub fn abandoned(&self) -> u64 {
        self.counters.abandoned.load(Ordering::Relaxed)
    }

    /// Items waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

impl<T: Send + 'static> Drop for Outbox<T> {
    fn drop(&mut self) {
        // Disconnect the queue so the worker drains and exits, and cut any
        // backoff sleep short so draining takes one attempt per item.
        let (dummy_tx, _) = bounded::<T>(1);
        drop(std::mem::replace(&mut self.tx, dummy_tx));
        self.stop.fire();

        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Outbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("name", &self.name)
            .field("queued", &self.queued())
            .field("delivered", &self.delivered())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

fn worker_loop<T>(
    name: &'static str,
    config: OutboxConfig,
    deliver: &Deliver<T>,
    rx: &Receiver<T>,
    stopped: &ShutdownSignal,
    counters: &Counters,
) {
    let max_attempts = config.max_attempts.max(1);
    while let Ok(item) = rx.recv() {
        let mut backoff = Backoff::new(config.retry);
        loop {
            match deliver(&item) {
                Ok(()) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    let attempts = backoff.attempts() + 1;
                    if attempts >= max_attempts || stopped.is_triggered() {
                        counters.abandoned.fetch_add(1, Ordering::Relaxed);
                        warn!(outbox = name, attempts, error = %e, "delivery abandoned");
                        break;
                    }
                    let delay = backoff.next_delay();
                    debug!(outbox = name, attempt = attempts, delay_ms = delay.as_millis() as u64, error = %e, "delivery failed, retrying");
                    if stopped.wait_timeout(delay) {
                        counters.abandoned.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }
    debug!(outbox = name, "outbox worker exiting");
}
