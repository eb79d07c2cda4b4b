//! Length-prefixed message framing.
//!
//! Every message on a connection is a 4-byte big-endian body length followed
//! by the body bytes:
//!
//! ```text
//! +----------------+----------------------+
//! | length: u32 BE | body: [u8; length]   |
//! +----------------+----------------------+
//! ```
//!
//! The write half is a single call producing the whole frame. The read half,
//! `MessageReader`, accumulates bytes across any number of reads of any size
//! and performs no I/O itself, so the same state machine serves both the
//! blocking and the non-blocking servers.

use crate::error::FormatError;
use crate::protocol::Protocol;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default limit on a single message body (64 MB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Body buffer reserved up front; larger bodies grow as their bytes arrive.
const INITIAL_BODY_CAPACITY: usize = 64 * 1024;

/// Build a complete frame (length prefix + body) for `list`.
///
/// The returned `Bytes` can be written in several calls by advancing past the
/// bytes already written.
pub fn encode_message(list: &[i32], protocol: Protocol) -> Result<Bytes, FormatError> {
    let body = protocol.encode(list)?;
    let length = u32::try_from(body.len()).map_err(|_| {
        FormatError::Encode(format!("body of {} bytes does not fit a u32 prefix", body.len()))
    })?;

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.put_u32(length);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Accumulation state of one incoming message.
#[derive(Debug)]
enum DecodeState {
    /// Collecting the length prefix.
    AwaitingLength {
        prefix: [u8; LENGTH_PREFIX_SIZE],
        filled: usize,
    },
    /// Length known, collecting the body.
    AwaitingBody { body: BytesMut, length: usize },
    /// Body decoded.
    Complete(Vec<i32>),
}

/// Incremental decoder for a single length-prefixed message.
///
/// Create a fresh reader for each message; a reader never moves backwards
/// out of `Complete`.
#[derive(Debug)]
pub struct MessageReader {
    protocol: Protocol,
    max_message_bytes: usize,
    state: DecodeState,
}

impl MessageReader {
    /// Create a reader with the default body size limit.
    pub fn new(protocol: Protocol) -> Self {
        Self::with_limit(protocol, DEFAULT_MAX_MESSAGE_BYTES)
    }

    /// Create a reader that rejects bodies larger than `max_message_bytes`.
    pub fn with_limit(protocol: Protocol, max_message_bytes: usize) -> Self {
        Self {
            protocol,
            max_message_bytes,
            state: DecodeState::AwaitingLength {
                prefix: [0; LENGTH_PREFIX_SIZE],
                filled: 0,
            },
        }
    }

    /// Bytes still needed to finish the current stage.
    ///
    /// While the length is unknown this is what remains of the prefix,
    /// afterwards what remains of the body. Zero once the message is complete.
    pub fn remaining_bytes(&self) -> usize {
        match &self.state {
            DecodeState::AwaitingLength { filled, .. } => LENGTH_PREFIX_SIZE - filled,
            DecodeState::AwaitingBody { body, length } => length - body.len(),
            DecodeState::Complete(_) => 0,
        }
    }

    /// True if no byte of this message has been received yet.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::AwaitingLength { filled: 0, .. })
    }

    /// True once the body has been decoded.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, DecodeState::Complete(_))
    }

    /// Consume bytes from `data` and return how many were used.
    ///
    /// Never consumes past the end of this message: leftover bytes belong to
    /// the next one. Feeding an empty slice is a no-op, except that a zero
    /// length prefix completes immediately.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize, FormatError> {
        let mut consumed = 0;

        if let DecodeState::AwaitingLength { prefix, filled } = &mut self.state {
            let take = (LENGTH_PREFIX_SIZE - *filled).min(data.len());
            prefix[*filled..*filled + take].copy_from_slice(&data[..take]);
            *filled += take;
            consumed += take;

            if *filled < LENGTH_PREFIX_SIZE {
                return Ok(consumed);
            }

            let length = u32::from_be_bytes(*prefix) as usize;
            if length > self.max_message_bytes {
                return Err(FormatError::TooLarge {
                    length,
                    max: self.max_message_bytes,
                });
            }
            self.state = DecodeState::AwaitingBody {
                body: BytesMut::with_capacity(length.min(INITIAL_BODY_CAPACITY)),
                length,
            };
        }

        if let DecodeState::AwaitingBody { body, length } = &mut self.state {
            let take = (*length - body.len()).min(data.len() - consumed);
            body.extend_from_slice(&data[consumed..consumed + take]);
            consumed += take;

            if body.len() == *length {
                let list = self.protocol.decode(body)?;
                self.state = DecodeState::Complete(list);
            }
        }

        Ok(consumed)
    }

    /// The decoded list, once the whole message has arrived.
    pub fn result(&self) -> Option<&[i32]> {
        match &self.state {
            DecodeState::Complete(list) => Some(list),
            _ => None,
        }
    }

    /// Take the decoded list, if complete.
    pub fn into_result(self) -> Option<Vec<i32>> {
        match self.state {
            DecodeState::Complete(list) => Some(list),
            _ => None,
        }
    }
}
