//! Line-delimited JSON client for the remote store.
//!
//! One JSON object per line over TCP. A subscription is a long-lived
//! connection opened with a `subscribe` request; acknowledgments and
//! access log entries are one-shot requests answered by `{"ok":true}`.
//!
//! A line that does not decode is logged and skipped; the server redelivers
//! on every subscribe, so tearing the connection down over one bad message
//! would block everything queued behind it. Only transport faults end a
//! subscription.
//!
//! ```text
//! -> {"op":"subscribe","feed":"credentials","community":"oak"}
//! <- {"type":"added","record":{...}}
//! <- {"type":"snapshot_complete"}
//! <- {"type":"keepalive"}
//! -> {"op":"ack","command_id":"c1","status":"processed"}
//! <- {"ok":true}
//! ```

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::access::AccessLogEntry;
use crate::command::{AckStatus, CommandEnvelope};
use crate::credential::{CredentialId, CredentialRecord};
use crate::error::FeedError;

use super::{ChangeEvent, ChangeSubscription, CommandSubscription, FeedKind, FeedMessage, RemoteStore, Subscription};

/// Longest line accepted from the server.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Smallest read timeout handed to the socket; zero would mean "block forever".
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WireRequest<'a> {
    Subscribe {
        feed: FeedKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        community: Option<&'a str>,
    },
    Ack {
        command_id: &'a str,
        status: AckStatus,
    },
    Log {
        entry: &'a AccessLogEntry,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Added { record: CredentialRecord },
    Modified { record: CredentialRecord },
    Removed { credential_id: CredentialId },
    SnapshotComplete,
    Keepalive,
    Command(CommandEnvelope),
}

#[derive(Debug, Deserialize)]
struct WireReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

trait WireItem: Sized {
    const KIND: FeedKind;

    fn from_wire(message: WireMessage) -> Result<FeedMessage<Self>, FeedError>;
}

impl WireItem for ChangeEvent {
    const KIND: FeedKind = FeedKind::Credentials;

    fn from_wire(message: WireMessage) -> Result<FeedMessage<Self>, FeedError> {
        let event = match message {
            WireMessage::Added { record } => Self::Added(record),
            WireMessage::Modified { record } => Self::Modified(record),
            WireMessage::Removed { credential_id } => Self::Removed(credential_id),
            WireMessage::SnapshotComplete => Self::SnapshotComplete,
            WireMessage::Keepalive => return Ok(FeedMessage::Keepalive),
            WireMessage::Command(_) => {
                return Err(FeedError::Protocol {
                    message: "command message on the credential feed".to_string(),
                })
            }
        };
        Ok(FeedMessage::Item(event))
    }
}

impl WireItem for CommandEnvelope {
    const KIND: FeedKind = FeedKind::Commands;

    fn from_wire(message: WireMessage) -> Result<FeedMessage<Self>, FeedError> {
        match message {
            WireMessage::Command(envelope) => Ok(FeedMessage::Item(envelope)),
            WireMessage::Keepalive => Ok(FeedMessage::Keepalive),
            other => Err(FeedError::Protocol {
                message: format!("unexpected message on the command feed: {other:?}"),
            }),
        }
    }
}

/// [`RemoteStore`] over a line-delimited JSON TCP protocol.
#[derive(Debug, Clone)]
pub struct NdjsonRemote {
    address: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl NdjsonRemote {
    /// Creates a client for `address` (`host:port`).
    #[must_use]
    pub fn new(address: impl Into<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            request_timeout,
        }
    }

    fn resolve(&self) -> Result<SocketAddr, FeedError> {
        self.address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FeedError::transient(format!("no address for {}", self.address)))
    }

    fn connect(&self) -> Result<TcpStream, FeedError> {
        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(self.request_timeout))?;
        Ok(stream)
    }

    fn send(stream: &mut TcpStream, request: &WireRequest<'_>) -> Result<(), FeedError> {
        let mut line = serde_json::to_vec(request).map_err(|e| FeedError::Protocol {
            message: format!("failed to encode request: {e}"),
        })?;
        line.push(b'\n');
        stream.write_all(&line)?;
        stream.flush()?;
        Ok(())
    }

    fn open<T: WireItem + Send + 'static>(
        &self,
        community: Option<&str>,
    ) -> Result<Box<dyn Subscription<T>>, FeedError> {
        let mut stream = self.connect()?;
        Self::send(
            &mut stream,
            &WireRequest::Subscribe {
                feed: T::KIND,
                community,
            },
        )?;
        debug!(feed = %T::KIND, address = %self.address, "remote subscription opened");
        Ok(Box::new(NdjsonSubscription::<T>::new(stream)))
    }

    fn request(&self, request: &WireRequest<'_>) -> Result<(), FeedError> {
        let mut stream = self.connect()?;
        stream.set_read_timeout(Some(self.request_timeout))?;
        Self::send(&mut stream, request)?;

        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Err(FeedError::transient("connection closed before reply"));
        }
        let reply: WireReply = serde_json::from_slice(&line).map_err(|e| FeedError::Protocol {
            message: format!("malformed reply: {e}"),
        })?;
        if reply.ok {
            Ok(())
        } else {
            Err(FeedError::Protocol {
                message: reply.error.unwrap_or_else(|| "request refused".to_string()),
            })
        }
    }
}

impl RemoteStore for NdjsonRemote {
    fn subscribe_credentials(&self, community: Option<&str>) -> Result<ChangeSubscription, FeedError> {
        self.open::<ChangeEvent>(community)
    }

    fn subscribe_commands(&self, community: Option<&str>) -> Result<CommandSubscription, FeedError> {
        self.open::<CommandEnvelope>(community)
    }

    fn acknowledge(&self, command_id: &str, status: AckStatus) -> Result<(), FeedError> {
        self.request(&WireRequest::Ack { command_id, status })
    }

    fn log_access(&self, entry: &AccessLogEntry) -> Result<(), FeedError> {
        self.request(&WireRequest::Log { entry })
    }
}

struct NdjsonSubscription<T> {
    reader: BufReader<TcpStream>,
    pending: Vec<u8>,
    oversized: bool,
    closed: bool,
    _item: std::marker::PhantomData<fn() -> T>,
}

impl<T: WireItem> NdjsonSubscription<T> {
    fn new(stream: TcpStream) -> Self {
        Self {
            reader: BufReader::new(stream),
            pending: Vec::new(),
            oversized: false,
            closed: false,
            _item: std::marker::PhantomData,
        }
    }

    /// Drops the head of an oversized line; the rest is discarded up to its
    /// newline.
    fn drop_oversized(&mut self) {
        if self.pending.len() > MAX_LINE_BYTES {
            self.pending.clear();
            self.oversized = true;
        }
    }

    fn parse(line: &[u8]) -> Option<FeedMessage<T>> {
        let parsed = serde_json::from_slice::<WireMessage>(line)
            .map_err(|e| FeedError::Protocol {
                message: format!("malformed {} message: {e}", T::KIND),
            })
            .and_then(T::from_wire);
        match parsed {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(feed = %T::KIND, error = %e, "skipping undecodable message");
                None
            }
        }
    }
}

impl<T: WireItem + Send> Subscription<T> for NdjsonSubscription<T> {
    fn recv(&mut self, timeout: Duration) -> Result<Option<FeedMessage<T>>, FeedError> {
        if self.closed {
            return Err(FeedError::disconnected(T::KIND.as_str()));
        }
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;

        loop {
            // A timeout mid-line leaves the partial bytes in `pending`.
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    self.closed = true;
                    return Err(FeedError::disconnected(T::KIND.as_str()));
                }
                Ok(_) if self.pending.ends_with(b"\n") => {
                    let line = std::mem::take(&mut self.pending);
                    if std::mem::take(&mut self.oversized) {
                        warn!(feed = %T::KIND, limit = MAX_LINE_BYTES, "skipping oversized message");
                        return Ok(None);
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Ok(Self::parse(&line));
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    self.drop_oversized();
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            }
            self.drop_oversized();
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.reader.get_ref().shutdown(Shutdown::Both);
        }
    }
}
