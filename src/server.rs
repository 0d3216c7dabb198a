//! Local IPC server hosted by the primary instance
//!
//! Accepts secondary connections on a named local endpoint, runs the
//! per-connection handshake state machine, surfaces incoming messages to the
//! host application and routes replies back to a specific instance id.
//! Everything runs on the caller's thread; sockets are nonblocking and
//! readiness is multiplexed through `poll(2)`.

use crate::codec::{FrameDecoder, Message, MessageKind, encode};
use crate::error::{CoordError, CoordResult};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Poll interval inside [`IpcServer::admit_loop`], in milliseconds
const ADMIT_POLL_INTERVAL_MS: u64 = 100;

/// Read chunk size for draining a readable connection
const READ_CHUNK: usize = 4096;

/// Handshake progress of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    /// Waiting for the 12-byte frame header
    AwaitingHeader,
    /// Header parsed; waiting for the announced body bytes
    AwaitingBody,
    /// Handshake complete; registered in the connection table
    Connected,
}

/// A message dispatched to the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Instance id of the originating secondary
    pub origin_id: u32,
    /// Kind tag the message arrived under
    pub kind: MessageKind,
    /// Opaque payload (may be empty for bare handshakes)
    pub payload: Vec<u8>,
}

struct Connection {
    stream: UnixStream,
    stage: ConnectionStage,
    origin_id: u32,
    decoder: FrameDecoder,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            stage: ConnectionStage::AwaitingHeader,
            origin_id: 0,
            decoder: FrameDecoder::new(),
        }
    }
}

enum Outcome {
    Keep,
    Promote(u32),
    Close,
}

#[derive(Debug, Clone, Copy)]
enum Token {
    Listener,
    Pending(usize),
    Table(u32),
}

/// Primary-side local IPC server.
///
/// Connections that complete a `SecondaryInstance` or `Reconnect` handshake
/// stay registered in a table keyed by instance id (when the server was built
/// with `keep_secondary_connections`), so a later [`reply_to`](Self::reply_to)
/// can find them. All other connections are one-shot.
pub struct IpcServer {
    listener: UnixListener,
    endpoint: PathBuf,
    pending: Vec<Connection>,
    table: HashMap<u32, Connection>,
    keep_secondary_connections: bool,
}

impl IpcServer {
    /// Bind the primary endpoint.
    ///
    /// A leftover socket file from a crashed primary is probed first: if
    /// nothing answers it is unlinked, otherwise the bind fails with
    /// [`CoordError::ListenerUnavailable`]. Bind failure is fatal for this
    /// process's ability to serve as primary.
    pub fn bind(endpoint: &Path, keep_secondary_connections: bool) -> CoordResult<Self> {
        if endpoint.exists() {
            match UnixStream::connect(endpoint) {
                Ok(_) => {
                    return Err(CoordError::ListenerUnavailable {
                        path: endpoint.to_path_buf(),
                        source: io::Error::new(
                            io::ErrorKind::AddrInUse,
                            "endpoint already served by a live process",
                        ),
                    });
                }
                Err(_) => {
                    // Stale socket from a dead primary
                    let _ = std::fs::remove_file(endpoint);
                }
            }
        }

        let listener =
            UnixListener::bind(endpoint).map_err(|source| CoordError::ListenerUnavailable {
                path: endpoint.to_path_buf(),
                source,
            })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| CoordError::ListenerUnavailable {
                path: endpoint.to_path_buf(),
                source,
            })?;

        tracing::info!(endpoint = %endpoint.display(), "primary endpoint bound");

        Ok(Self {
            listener,
            endpoint: endpoint.to_path_buf(),
            pending: Vec::new(),
            table: HashMap::new(),
            keep_secondary_connections,
        })
    }

    /// Endpoint path this server is bound to
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Number of secondaries currently registered in the connection table
    pub fn connected_count(&self) -> usize {
        self.table.len()
    }

    /// One readiness pass: accept, read, advance handshakes, collect
    /// dispatched messages.
    ///
    /// Waits up to `timeout_ms` for the first event; returns as soon as one
    /// batch of work has been processed. This is the integration point for a
    /// host event loop.
    pub fn poll_once(&mut self, timeout_ms: u64) -> CoordResult<Vec<Incoming>> {
        let ready = match self.wait_ready(timeout_ms) {
            Ok(ready) => ready,
            Err(nix::Error::EINTR) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if ready.is_empty() {
            return Ok(Vec::new());
        }

        let mut incoming = Vec::new();
        let mut pending_ready: Vec<usize> = Vec::new();

        for token in ready {
            match token {
                Token::Listener => self.accept_ready()?,
                Token::Pending(index) => pending_ready.push(index),
                Token::Table(id) => {
                    if let Some(mut conn) = self.table.remove(&id) {
                        match service(&mut conn, self.keep_secondary_connections, &mut incoming) {
                            Outcome::Close => {
                                tracing::debug!(instance_id = id, "secondary connection closed");
                            }
                            _ => {
                                self.table.insert(id, conn);
                            }
                        }
                    }
                }
            }
        }

        // Highest index first so swap_remove does not disturb earlier entries
        pending_ready.sort_unstable_by(|a, b| b.cmp(a));
        for index in pending_ready {
            let conn = &mut self.pending[index];
            match service(conn, self.keep_secondary_connections, &mut incoming) {
                Outcome::Keep => {}
                Outcome::Promote(id) => {
                    let conn = self.pending.swap_remove(index);
                    if self.table.insert(id, conn).is_some() {
                        tracing::debug!(instance_id = id, "replaced stale table entry");
                    }
                }
                Outcome::Close => {
                    drop(self.pending.swap_remove(index));
                }
            }
        }

        Ok(incoming)
    }

    /// Run the accept/dispatch loop until the callback asks to stop.
    ///
    /// Returns only on [`ControlFlow::Break`] from the callback or on fatal
    /// listener failure; a primary that can no longer listen cannot serve its
    /// role and should terminate.
    pub fn admit_loop<F>(&mut self, mut on_message: F) -> CoordResult<()>
    where
        F: FnMut(&mut IpcServer, Incoming) -> ControlFlow<()>,
    {
        loop {
            let batch = self.poll_once(ADMIT_POLL_INTERVAL_MS)?;
            for message in batch {
                if let ControlFlow::Break(()) = on_message(self, message) {
                    return Ok(());
                }
            }
        }
    }

    /// Send a reply to a specific connected secondary.
    ///
    /// Returns `false` immediately when no such secondary is registered (a
    /// normal "recipient gone" outcome, not an error), or when the framed
    /// write does not flush within `timeout_ms`.
    pub fn reply_to(&mut self, instance_id: u32, payload: &[u8], timeout_ms: u64) -> bool {
        let Some(conn) = self.table.get_mut(&instance_id) else {
            return false;
        };

        let frame = encode(&Message {
            kind: MessageKind::Reconnect,
            sender_id: 0,
            payload: payload.to_vec(),
        });
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        match write_with_deadline(&mut conn.stream, &frame, deadline) {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!(instance_id, "reply write timed out");
                false
            }
            Err(err) => {
                tracing::debug!(instance_id, %err, "reply write failed, dropping connection");
                self.table.remove(&instance_id);
                false
            }
        }
    }

    fn accept_ready(&mut self) -> CoordResult<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        tracing::warn!(%err, "failed to mark accepted socket nonblocking");
                        continue;
                    }
                    tracing::debug!("accepted connection");
                    self.pending.push(Connection::new(stream));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(source) => {
                    return Err(CoordError::ListenerUnavailable {
                        path: self.endpoint.clone(),
                        source,
                    });
                }
            }
        }
    }

    fn wait_ready(&self, timeout_ms: u64) -> nix::Result<Vec<Token>> {
        let mut tokens = Vec::with_capacity(1 + self.pending.len() + self.table.len());
        let mut fds = Vec::with_capacity(tokens.capacity());

        tokens.push(Token::Listener);
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        for (index, conn) in self.pending.iter().enumerate() {
            tokens.push(Token::Pending(index));
            fds.push(PollFd::new(conn.stream.as_fd(), PollFlags::POLLIN));
        }
        for (&id, conn) in &self.table {
            tokens.push(Token::Table(id));
            fds.push(PollFd::new(conn.stream.as_fd(), PollFlags::POLLIN));
        }

        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);
        let count = poll(&mut fds, timeout)?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let mask = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let ready = fds
            .iter()
            .zip(tokens)
            .filter(|(fd, _)| fd.revents().is_some_and(|r| r.intersects(mask)))
            .map(|(_, token)| token)
            .collect();
        Ok(ready)
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.endpoint);
    }
}

/// Drain readable bytes and advance one connection's state machine.
fn service(conn: &mut Connection, keep_secondary: bool, incoming: &mut Vec<Incoming>) -> Outcome {
    let mut peer_eof = false;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => {
                peer_eof = true;
                break;
            }
            Ok(n) => conn.decoder.feed(&chunk[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(%err, "connection read failed");
                return Outcome::Close;
            }
        }
    }

    let mut outcome = Outcome::Keep;
    loop {
        match conn.decoder.next_frame() {
            Ok(Some(message)) => match dispatch(conn, message, keep_secondary, incoming) {
                Outcome::Keep => {}
                Outcome::Promote(id) => {
                    // Mark the connection admitted right away so frames that
                    // arrived in the same read batch dispatch as plain
                    // messages instead of repeated handshakes
                    conn.stage = ConnectionStage::Connected;
                    conn.origin_id = id;
                    outcome = Outcome::Promote(id);
                }
                Outcome::Close => {
                    outcome = Outcome::Close;
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                // Malformed handshake: drop the connection, nothing else is
                // affected
                tracing::warn!(%err, "invalid connection");
                return Outcome::Close;
            }
        }
    }

    if peer_eof {
        return Outcome::Close;
    }

    // Mirror decoder progress for connections still mid-handshake
    if conn.stage != ConnectionStage::Connected {
        conn.stage = if conn.decoder.in_body() {
            ConnectionStage::AwaitingBody
        } else {
            ConnectionStage::AwaitingHeader
        };
    }

    outcome
}

/// Dispatch one complete frame according to its kind.
fn dispatch(
    conn: &mut Connection,
    message: Message,
    keep_secondary: bool,
    incoming: &mut Vec<Incoming>,
) -> Outcome {
    if conn.stage == ConnectionStage::Connected {
        // Already admitted: every further frame is a plain message from the
        // registered origin
        incoming.push(Incoming {
            origin_id: conn.origin_id,
            kind: message.kind,
            payload: message.payload,
        });
        return Outcome::Keep;
    }

    incoming.push(Incoming {
        origin_id: message.sender_id,
        kind: message.kind,
        payload: message.payload,
    });

    match message.kind {
        MessageKind::NewInstance => {
            // Duplicate launch notification; nothing further on this socket
            Outcome::Close
        }
        MessageKind::SecondaryInstance | MessageKind::Reconnect => {
            if keep_secondary && message.sender_id != 0 {
                Outcome::Promote(message.sender_id)
            } else {
                Outcome::Close
            }
        }
    }
}

/// Write all of `bytes`, waiting for writability up to `deadline`.
///
/// `Ok(true)` on full flush, `Ok(false)` on deadline expiry.
fn write_with_deadline(
    stream: &mut UnixStream,
    mut bytes: &[u8],
    deadline: Instant,
) -> io::Result<bool> {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Ok(false);
                };
                let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
                let timeout = PollTimeout::try_from(remaining.as_millis().max(1) as u64)
                    .unwrap_or(PollTimeout::MAX);
                match poll(&mut fds, timeout) {
                    Ok(0) => return Ok(false),
                    Ok(_) => {}
                    Err(nix::Error::EINTR) => {}
                    Err(err) => return Err(io::Error::from(err)),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    stream.flush()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn test_endpoint(tag: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{tag}.sock"));
        (dir, path)
    }

    fn handshake_frame(kind: MessageKind, sender: u32, payload: &[u8]) -> Vec<u8> {
        codec::encode(&Message {
            kind,
            sender_id: sender,
            payload: payload.to_vec(),
        })
    }

    #[test]
    fn test_bind_rejects_live_endpoint() {
        let (_dir, path) = test_endpoint("live");
        let _server = IpcServer::bind(&path, true).unwrap();
        assert!(matches!(
            IpcServer::bind(&path, true),
            Err(CoordError::ListenerUnavailable { .. })
        ));
    }

    #[test]
    fn test_bind_reclaims_stale_socket_file() {
        let (_dir, path) = test_endpoint("stale");
        {
            let _stale = IpcServer::bind(&path, true).unwrap();
            // Simulate a crash: recreate the socket file after the server is
            // gone
        }
        std::os::unix::net::UnixListener::bind(&path).unwrap();
        // Listener dropped above but the file stays behind; bind must reclaim
        let server = IpcServer::bind(&path, true);
        assert!(server.is_ok());
    }

    #[test]
    fn test_new_instance_is_one_shot() {
        let (_dir, path) = test_endpoint("oneshot");
        let mut server = IpcServer::bind(&path, true).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        client
            .write_all(&handshake_frame(MessageKind::NewInstance, 0, b""))
            .unwrap();

        let incoming = poll_until_messages(&mut server, 1);
        assert_eq!(incoming[0].kind, MessageKind::NewInstance);
        assert_eq!(incoming[0].origin_id, 0);
        assert!(incoming[0].payload.is_empty());
        assert_eq!(server.connected_count(), 0);

        // Server closed its end: the client sees EOF
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_secondary_registers_and_receives_reply() {
        let (_dir, path) = test_endpoint("register");
        let mut server = IpcServer::bind(&path, true).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        client
            .write_all(&handshake_frame(MessageKind::SecondaryInstance, 7, b"hello"))
            .unwrap();

        let incoming = poll_until_messages(&mut server, 1);
        assert_eq!(incoming[0].origin_id, 7);
        assert_eq!(incoming[0].payload, b"hello");
        assert_eq!(server.connected_count(), 1);

        assert!(server.reply_to(7, b"welcome", 1000));

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];
        let reply = loop {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0, "server closed unexpectedly");
            decoder.feed(&buf[..n]);
            if let Some(frame) = decoder.next_frame().unwrap() {
                break frame;
            }
        };
        assert_eq!(reply.sender_id, 0);
        assert_eq!(reply.payload, b"welcome");
    }

    #[test]
    fn test_reply_to_unknown_id_is_false() {
        let (_dir, path) = test_endpoint("unknown");
        let mut server = IpcServer::bind(&path, true).unwrap();
        assert!(!server.reply_to(99, b"nobody home", 100));
    }

    #[test]
    fn test_invalid_tag_drops_connection_only() {
        let (_dir, path) = test_endpoint("invalid");
        let mut server = IpcServer::bind(&path, true).unwrap();

        // A well-behaved secondary first
        let mut good = UnixStream::connect(&path).unwrap();
        good.write_all(&handshake_frame(MessageKind::SecondaryInstance, 1, b""))
            .unwrap();
        poll_until_messages(&mut server, 1);
        assert_eq!(server.connected_count(), 1);

        // Then a malformed handshake (reserved tag 0)
        let mut bad = UnixStream::connect(&path).unwrap();
        let mut frame = handshake_frame(MessageKind::SecondaryInstance, 2, b"");
        frame[12] = 0;
        bad.write_all(&frame).unwrap();

        // The bad connection dies, the good one survives
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut buf = [0u8; 1];
        bad.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        while Instant::now() < deadline {
            let _ = server.poll_once(50).unwrap();
            if let Ok(0) = bad.read(&mut buf) {
                break;
            }
        }
        assert_eq!(server.connected_count(), 1);
        assert!(server.reply_to(1, b"still here", 1000));
    }

    fn poll_until_messages(server: &mut IpcServer, want: usize) -> Vec<Incoming> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut collected = Vec::new();
        while collected.len() < want {
            assert!(Instant::now() < deadline, "timed out waiting for messages");
            collected.extend(server.poll_once(100).unwrap());
        }
        collected
    }
}
