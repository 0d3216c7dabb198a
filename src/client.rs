//! Local IPC client used by secondary instances
//!
//! Reaches the primary's endpoint, performs the handshake, and exchanges
//! framed messages. Calls block the caller up to their explicit timeout; a
//! secondary typically has nothing else to do until its message is delivered.

use crate::codec::{FrameDecoder, Message, MessageKind, encode};
use crate::error::{CoordError, CoordResult};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Backoff between connect attempts while the primary is still binding its
/// endpoint, in milliseconds
const CONNECT_RETRY_MS: u64 = 10;

/// Secondary-side connection to the primary.
///
/// A connection opened with [`MessageKind::SecondaryInstance`] is persistent
/// and reused for later sends and replies. Ad-hoc sends without one open a
/// fresh [`MessageKind::Reconnect`] connection per message, carrying the
/// payload in the handshake frame itself, since the primary may treat such
/// connections as one-shot.
pub struct IpcClient {
    endpoint: PathBuf,
    instance_id: u32,
    stream: Option<UnixStream>,
    persistent: bool,
    decoder: FrameDecoder,
    last_error: Option<CoordError>,
}

impl IpcClient {
    /// Create a client for the given endpoint and own instance id
    pub fn new(endpoint: &Path, instance_id: u32) -> Self {
        Self {
            endpoint: endpoint.to_path_buf(),
            instance_id,
            stream: None,
            persistent: false,
            decoder: FrameDecoder::new(),
            last_error: None,
        }
    }

    /// Whether a connection to the primary is currently open
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Most recent recorded failure from [`send`](Self::send).
    ///
    /// [`connect`](Self::connect) failures are returned to the caller
    /// directly and are not recorded here.
    pub fn last_error(&self) -> Option<&CoordError> {
        self.last_error.as_ref()
    }

    /// Connect to the primary's endpoint and write the handshake frame.
    ///
    /// While the endpoint does not exist yet (primary still initializing) the
    /// attempt is retried until `timeout_ms` elapses, then fails with
    /// [`CoordError::TimedOut`]. A definite refusal fails immediately with
    /// [`CoordError::Refused`]. Already-connected clients return at once.
    pub fn connect(&mut self, timeout_ms: u64, kind: MessageKind) -> CoordResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.connect_with(timeout_ms, kind, &[])?;
        self.persistent = kind == MessageKind::SecondaryInstance;
        Ok(())
    }

    fn connect_with(
        &mut self,
        timeout_ms: u64,
        kind: MessageKind,
        payload: &[u8],
    ) -> CoordResult<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let stream = loop {
            match UnixStream::connect(&self.endpoint) {
                Ok(stream) => break stream,
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    return Err(CoordError::Refused);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    if Instant::now() >= deadline {
                        return Err(CoordError::TimedOut {
                            operation: "connect to primary".to_string(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(CONNECT_RETRY_MS));
                }
                Err(source) => return Err(source.into()),
            }
        };

        let handshake = encode(&Message {
            kind,
            sender_id: self.instance_id,
            payload: payload.to_vec(),
        });
        write_deadline(&stream, &handshake, deadline)?;

        tracing::debug!(instance_id = self.instance_id, kind = ?kind, "connected to primary");
        self.decoder = FrameDecoder::new();
        self.stream = Some(stream);
        Ok(())
    }

    /// Send a message to the primary.
    ///
    /// Reconnects with [`MessageKind::Reconnect`] when there is no reusable
    /// connection. Never raises: timeout and refusal surface as `false`, with
    /// the detail recorded for [`last_error`](Self::last_error).
    pub fn send(&mut self, payload: &[u8], timeout_ms: u64) -> bool {
        match self.try_send(payload, timeout_ms) {
            Ok(()) => {
                self.last_error = None;
                true
            }
            Err(err) => {
                tracing::debug!(%err, "send to primary failed");
                self.last_error = Some(err);
                self.stream = None;
                false
            }
        }
    }

    fn try_send(&mut self, payload: &[u8], timeout_ms: u64) -> CoordResult<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        if self.persistent {
            if let Some(stream) = self.stream.as_ref() {
                let frame = encode(&Message {
                    kind: MessageKind::Reconnect,
                    sender_id: self.instance_id,
                    payload: payload.to_vec(),
                });
                match write_deadline(stream, &frame, deadline) {
                    Ok(()) => return Ok(()),
                    Err(CoordError::TimedOut { operation }) => {
                        return Err(CoordError::TimedOut { operation });
                    }
                    Err(_) => {
                        // Connection went away underneath us; fall through to
                        // a fresh one-shot carrying the payload
                        self.stream = None;
                    }
                }
            }
        } else {
            // Previous connection, if any, was one-shot on the primary side
            self.stream = None;
        }

        self.connect_with(timeout_ms, MessageKind::Reconnect, payload)
    }

    /// Block until a reply arrives or `timeout_ms` elapses.
    ///
    /// Returns the payload of the first complete message, or an empty buffer
    /// on timeout. An empty buffer and a literally-empty reply are
    /// indistinguishable by design; callers that care encode a marker in the
    /// payload.
    pub fn wait_for_reply(&mut self, timeout_ms: u64) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let Some(mut stream) = self.stream.take() else {
            return Vec::new();
        };

        let mut chunk = [0u8; 4096];
        loop {
            match self.decoder.next_frame() {
                Ok(Some(message)) => {
                    self.stream = Some(stream);
                    return message.payload;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%err, "malformed reply from primary");
                    return Vec::new();
                }
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                self.stream = Some(stream);
                return Vec::new();
            };
            if stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
                .is_err()
            {
                self.stream = Some(stream);
                return Vec::new();
            }

            match stream.read(&mut chunk) {
                Ok(0) => {
                    // Primary went away
                    return Vec::new();
                }
                Ok(n) => self.decoder.feed(&chunk[..n]),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    self.stream = Some(stream);
                    return Vec::new();
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::debug!(%err, "reply read failed");
                    return Vec::new();
                }
            }
        }
    }
}

/// Blocking write of a whole frame with a wall-clock deadline.
fn write_deadline(mut stream: &UnixStream, bytes: &[u8], deadline: Instant) -> CoordResult<()> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_millis(1));
    stream.set_write_timeout(Some(remaining.max(Duration::from_millis(1))))?;
    match stream.write_all(bytes) {
        Ok(()) => {
            stream.flush()?;
            Ok(())
        }
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ) =>
        {
            Err(CoordError::TimedOut {
                operation: "write to primary".to_string(),
            })
        }
        Err(source) => Err(source.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_missing_endpoint_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("nobody.sock");
        let mut client = IpcClient::new(&endpoint, 1);

        let started = Instant::now();
        let result = client.connect(120, MessageKind::NewInstance);
        assert!(matches!(result, Err(CoordError::TimedOut { .. })));
        assert!(started.elapsed() >= Duration::from_millis(120));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_connect_refused_surfaces_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("dead.sock");
        // A socket file with no listener behind it refuses connections
        drop(std::os::unix::net::UnixListener::bind(&endpoint).unwrap());

        let mut client = IpcClient::new(&endpoint, 1);
        let started = Instant::now();
        let result = client.connect(5_000, MessageKind::Reconnect);
        assert!(matches!(result, Err(CoordError::Refused)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_send_failure_returns_false_and_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("absent.sock");
        let mut client = IpcClient::new(&endpoint, 2);

        assert!(!client.send(b"ping", 50));
        assert!(client.last_error().is_some());
    }

    #[test]
    fn test_connect_failure_is_returned_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = IpcClient::new(&dir.path().join("gone.sock"), 1);

        assert!(client.connect(50, MessageKind::Reconnect).is_err());
        assert!(client.last_error().is_none());
    }

    #[test]
    fn test_wait_for_reply_without_connection_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = IpcClient::new(&dir.path().join("x.sock"), 3);
        assert!(client.wait_for_reply(10).is_empty());
    }
}
