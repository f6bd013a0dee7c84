//! Hardware capabilities: the relay actuator and the RFID tag reader.
//!
//! Both are external collaborators. The gateway only needs
//! `actuate(address, duration)` and a blocking `read_tag()`; the types
//! here adapt the site's relay control program and a line-oriented
//! serial reader to those two calls.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::Command as Process;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::credential::CredentialId;
use crate::error::HardwareError;

/// Opens a relay for a while.
pub trait Actuator: Send + Sync {
    /// Energizes the relay serving `address_id` for `duration`, then
    /// releases it. Blocks for the whole pulse.
    fn actuate(&self, address_id: &str, duration: Duration) -> Result<(), HardwareError>;
}

/// Source of scanned tags.
pub trait TagReader: Send {
    /// Blocks until a tag is scanned.
    ///
    /// Returns `Ok(None)` for a read timeout or a line that is not a tag
    /// frame, so callers can check for shutdown between reads.
    fn read_tag(&mut self) -> Result<Option<CredentialId>, HardwareError>;
}

/// Extracts the tag from one reader frame.
///
/// Frames are lines starting with `#`; the tag is the next `tag_len - 1`
/// characters, upper-cased.
#[must_use]
pub fn parse_frame(line: &str, tag_len: usize) -> Option<CredentialId> {
    let body = line.trim().strip_prefix('#')?;
    let tag: String = body.chars().take(tag_len.saturating_sub(1)).collect();
    let id = CredentialId::new(tag);
    (!id.is_empty()).then_some(id)
}

/// Drives relays through the site's relay control program.
///
/// Each pulse runs `<program> <args...> <relay> 1`, waits, then runs
/// `<program> <args...> <relay> 0`. Pulses are serialized; two relays on
/// one board are never switched concurrently.
#[derive(Debug)]
pub struct RelayProgramActuator {
    program: PathBuf,
    args: Vec<String>,
    relays: HashMap<String, u8>,
    busy: Mutex<()>,
}

impl RelayProgramActuator {
    /// Creates an actuator for the given address-to-relay map. Address
    /// names are matched case-insensitively.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, relays: HashMap<String, u8>) -> Self {
        Self {
            program: program.into(),
            args,
            relays: relays
                .into_iter()
                .map(|(address, relay)| (relay_key(&address), relay))
                .collect(),
            busy: Mutex::new(()),
        }
    }

    /// The relay number serving `address_id`.
    #[must_use]
    pub fn relay_for(&self, address_id: &str) -> Option<u8> {
        self.relays.get(&relay_key(address_id)).copied()
    }

    fn switch(&self, relay: u8, on: bool) -> Result<(), HardwareError> {
        let status = Process::new(&self.program)
            .args(&self.args)
            .arg(relay.to_string())
            .arg(if on { "1" } else { "0" })
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(HardwareError::RelayFailed {
                relay,
                message: format!("{} exited with {status}", self.program.display()),
            })
        }
    }
}

fn relay_key(address: &str) -> String {
    address.trim().to_lowercase()
}

impl Actuator for RelayProgramActuator {
    fn actuate(&self, address_id: &str, duration: Duration) -> Result<(), HardwareError> {
        let relay = self.relay_for(address_id).ok_or_else(|| HardwareError::UnknownAddress {
            address: address_id.to_string(),
        })?;

        let _busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        self.switch(relay, true)?;
        thread::sleep(duration);
        self.switch(relay, false)?;
        info!(address = address_id, relay, duration_ms = duration.as_millis() as u64, "relay pulsed");
        Ok(())
    }
}

/// One recorded actuation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actuation {
    /// The address that was opened.
    pub address_id: String,
    /// Requested pulse length.
    pub duration: Duration,
}

/// Actuator that records calls instead of switching anything.
///
/// Backs `--dry-run` and the tests.
#[derive(Debug, Default)]
pub struct RecordingActuator {
    calls: Mutex<Vec<Actuation>>,
    failing: Mutex<usize>,
}

impl RecordingActuator {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every actuation so far, in order.
    #[must_use]
    pub fn actuations(&self) -> Vec<Actuation> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of actuations so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Makes the next `n` actuations fail.
    pub fn fail_next(&self, n: usize) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = n;
    }
}

impl Actuator for RecordingActuator {
    fn actuate(&self, address_id: &str, duration: Duration) -> Result<(), HardwareError> {
        {
            let mut failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
            if *failing > 0 {
                *failing -= 1;
                return Err(HardwareError::RelayFailed {
                    relay: 0,
                    message: "simulated relay fault".to_string(),
                });
            }
        }
        debug!(address = address_id, duration_ms = duration.as_millis() as u64, "dry-run actuation");
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Actuation {
                address_id: address_id.to_string(),
                duration,
            });
        Ok(())
    }
}

/// Tag reader over any line-oriented byte stream.
#[derive(Debug)]
pub struct LineTagReader<R> {
    reader: R,
    tag_len: usize,
    pending: Vec<u8>,
}

impl<R: BufRead> LineTagReader<R> {
    /// Wraps `reader`; frames carry tags of `tag_len` characters
    /// including the leading `#`.
    pub fn new(reader: R, tag_len: usize) -> Self {
        Self {
            reader,
            tag_len,
            pending: Vec::new(),
        }
    }
}

/// Opens the reader device at `path`.
pub fn open_device(path: &Path, tag_len: usize) -> Result<LineTagReader<BufReader<File>>, HardwareError> {
    let file = File::open(path)?;
    info!(device = %path.display(), tag_len, "tag reader opened");
    Ok(LineTagReader::new(BufReader::new(file), tag_len))
}

impl<R: BufRead + Send> TagReader for LineTagReader<R> {
    fn read_tag(&mut self) -> Result<Option<CredentialId>, HardwareError> {
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) if self.pending.is_empty() => Err(HardwareError::ReaderClosed),
            Ok(_) => {
                let line = std::mem::take(&mut self.pending);
                Ok(parse_frame(&String::from_utf8_lossy(&line), self.tag_len))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Tag reader fed from a channel of raw frames.
#[derive(Debug)]
pub struct ScriptedTagReader {
    rx: Receiver<String>,
    tag_len: usize,
    poll: Duration,
}

impl ScriptedTagReader {
    /// Creates a reader and the sender that feeds it raw frames.
    /// Dropping the sender closes the reader.
    #[must_use]
    pub fn channel(tag_len: usize, poll: Duration) -> (Sender<String>, Self) {
        let (tx, rx) = unbounded();
        (tx, Self { rx, tag_len, poll })
    }
}

impl TagReader for ScriptedTagReader {
    fn read_tag(&mut self) -> Result<Option<CredentialId>, HardwareError> {
        let started = Instant::now();
        match self.rx.recv_timeout(self.poll) {
            Ok(line) => Ok(parse_frame(&line, self.tag_len)),
            Err(RecvTimeoutError::Timeout) => {
                debug!(waited_ms = started.elapsed().as_millis() as u64, "no tag scanned");
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => Err(HardwareError::ReaderClosed),
        }
    }
}
