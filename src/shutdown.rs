//! Process-wide shutdown signalling.
//!
//! The trigger side owns the only sender of a zero-capacity channel and
//! never sends on it: firing the trigger drops the sender, which wakes
//! every waiter at once with a disconnection. Dropping the last trigger
//! clone has the same effect.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

/// Fires shutdown. Cloneable so a signal handler can hold a copy.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl ShutdownTrigger {
    /// Requests shutdown. Idempotent.
    pub fn fire(&self) {
        let mut guard = self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.take();
    }
}

/// Observes shutdown. Cheap to clone; one per long-lived loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
}

impl ShutdownSignal {
    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `timeout` unless shutdown is requested first.
    ///
    /// Returns true if shutdown was requested.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Blocks until shutdown is requested.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }
}

/// Creates a linked trigger/signal pair.
#[must_use]
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = bounded::<()>(0);
    (
        ShutdownTrigger {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        ShutdownSignal { rx },
    )
}
