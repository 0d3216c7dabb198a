//! Message framing codec for the local socket protocol
//!
//! Wire format, identical in both directions:
//!
//! ```text
//! +----------------+-------------+------+-----------------+
//! | body_len: i64  | sender: u32 | kind | payload         |
//! | little-endian  | little-end. | u8   | body_len-1 bytes|
//! +----------------+-------------+------+-----------------+
//! |<------- 12-byte header ----->|<------- body --------->|
//! ```
//!
//! Encoding is pure; the decoder is incremental so a receiver can be driven
//! by "more bytes arrived" events without ever assuming a read yields a whole
//! message.

use crate::error::{CoordError, CoordResult};

/// Header size on the wire: body length (8) + sender instance id (4)
pub const HEADER_LEN: usize = 12;

/// Upper bound on a frame body; larger lengths are treated as malformed
pub const MAX_BODY_LEN: i64 = 16 * 1024 * 1024;

/// Connection/message kind tag, first byte of every frame body.
///
/// Tag 0 is reserved as the invalid marker so that an all-zero body never
/// parses as a real message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A plain duplicate launch with nothing to deliver; one-shot
    NewInstance,
    /// A secondary announcing itself for message exchange
    SecondaryInstance,
    /// An already-admitted secondary reopening or reusing a socket
    Reconnect,
}

impl MessageKind {
    /// Wire tag value
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::NewInstance => 1,
            Self::SecondaryInstance => 2,
            Self::Reconnect => 3,
        }
    }

    /// Parse a wire tag; `None` for unknown tags
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::NewInstance),
            2 => Some(Self::SecondaryInstance),
            3 => Some(Self::Reconnect),
            _ => None,
        }
    }
}

/// A complete message as it travels over a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message kind tag
    pub kind: MessageKind,
    /// Instance id of the sender (0 for the primary)
    pub sender_id: u32,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

/// Encode a message into its wire representation
pub fn encode(message: &Message) -> Vec<u8> {
    let body_len = (message.payload.len() + 1) as i64;
    let mut buf = Vec::with_capacity(HEADER_LEN + body_len as usize);
    buf.extend_from_slice(&body_len.to_le_bytes());
    buf.extend_from_slice(&message.sender_id.to_le_bytes());
    buf.push(message.kind.to_u8());
    buf.extend_from_slice(&message.payload);
    buf
}

/// Incremental frame parser.
///
/// Feed it bytes as they arrive; it buffers partial headers and bodies across
/// arbitrary split points and yields complete [`Message`]s in order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    header: Option<FrameHeader>,
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    body_len: usize,
    sender_id: u32,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Whether a header has been parsed and its body is still incomplete
    pub fn in_body(&self) -> bool {
        self.header.is_some()
    }

    /// How many more bytes are needed to complete the current frame.
    ///
    /// A buffered-but-unparsed header is peeked so the count covers its
    /// announced body too. Returns 0 when at least one complete frame is
    /// buffered, or when the buffered header is malformed and
    /// [`next_frame`](Self::next_frame) should be called to observe the
    /// error.
    pub fn bytes_needed(&self) -> usize {
        match self.header {
            Some(header) => header.body_len.saturating_sub(self.buf.len()),
            None if self.buf.len() >= HEADER_LEN => {
                let mut len_bytes = [0u8; 8];
                len_bytes.copy_from_slice(&self.buf[..8]);
                let body_len = i64::from_le_bytes(len_bytes);
                if body_len < 1 || body_len > MAX_BODY_LEN {
                    0
                } else {
                    (HEADER_LEN + body_len as usize).saturating_sub(self.buf.len())
                }
            }
            None => HEADER_LEN - self.buf.len(),
        }
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// A malformed header (non-positive or oversized body length) or an
    /// unrecognized kind tag poisons the stream and is returned as an error;
    /// the owning connection should be dropped.
    pub fn next_frame(&mut self) -> CoordResult<Option<Message>> {
        if self.header.is_none() {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&self.buf[..8]);
            let body_len = i64::from_le_bytes(len_bytes);

            let mut sender_bytes = [0u8; 4];
            sender_bytes.copy_from_slice(&self.buf[8..12]);
            let sender_id = u32::from_le_bytes(sender_bytes);

            if body_len < 1 || body_len > MAX_BODY_LEN {
                return Err(CoordError::InvalidFrame {
                    reason: format!("body length {} out of range", body_len),
                });
            }

            self.buf.drain(..HEADER_LEN);
            self.header = Some(FrameHeader {
                body_len: body_len as usize,
                sender_id,
            });
        }

        let header = match self.header {
            Some(header) => header,
            None => return Ok(None),
        };
        if self.buf.len() < header.body_len {
            return Ok(None);
        }

        let body: Vec<u8> = self.buf.drain(..header.body_len).collect();
        self.header = None;

        let kind = MessageKind::from_u8(body[0]).ok_or_else(|| CoordError::InvalidFrame {
            reason: format!("unknown kind tag {}", body[0]),
        })?;

        Ok(Some(Message {
            kind,
            sender_id: header.sender_id,
            payload: body[1..].to_vec(),
        }))
    }
}
