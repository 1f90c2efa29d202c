//! Byte accumulator with an explicit end-of-message marker.
//!
//! Messages on the wire are an arbitrary payload followed by
//! [`END_OF_MESSAGE`]. There is no length prefix, so a payload must not
//! contain the marker itself.
//!
//! ```text
//! wire:    P I N G \r \n . \r \n
//!          └payload┘ └─ marker ─┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Marker terminating every logical message.
pub const END_OF_MESSAGE: &[u8] = b"\r\n.\r\n";

/// Ordered bytes of one logical message plus its end-of-message flag.
///
/// Inbound, [`append`](Self::append) assembles a message from partial
/// deliveries and strips the marker once it is seen. Outbound,
/// [`append_eof`](Self::append_eof) marks the payload complete so
/// [`to_wire`](Self::to_wire) emits it with the marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteStream {
    data: BytesMut,
    eof: bool,
}

impl ByteStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty stream with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            eof: false,
        }
    }

    /// Create an unterminated stream holding `payload`.
    pub fn from_payload(payload: impl AsRef<[u8]>) -> Self {
        Self {
            data: BytesMut::from(payload.as_ref()),
            eof: false,
        }
    }

    /// Append wire bytes, stopping after the first end-of-message marker.
    ///
    /// Returns how many bytes of `chunk` were consumed. Anything past the
    /// marker belongs to the next message and is left to the caller. Once
    /// the marker has been seen nothing more is consumed.
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        if self.eof || chunk.is_empty() {
            return 0;
        }

        // A marker may straddle the previous chunk and this one.
        let previous = self.data.len();
        let search_from = previous.saturating_sub(END_OF_MESSAGE.len() - 1);
        self.data.extend_from_slice(chunk);

        match find_marker(&self.data[search_from..]) {
            Some(pos) => {
                let marker_start = search_from + pos;
                let consumed = marker_start + END_OF_MESSAGE.len() - previous;
                self.data.truncate(marker_start);
                self.eof = true;
                consumed
            }
            None => chunk.len(),
        }
    }

    /// Mark the payload complete. Idempotent.
    pub fn append_eof(&mut self) {
        self.eof = true;
    }

    /// Whether the end-of-message marker has been seen or appended.
    pub fn has_eof(&self) -> bool {
        self.eof
    }

    /// A terminated message with no payload: the peer's clean close signal.
    pub fn is_close_signal(&self) -> bool {
        self.eof && self.data.is_empty()
    }

    /// Payload bytes accumulated so far (marker excluded).
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Encode for transmission: payload, then the marker if terminated.
    pub fn to_wire(&self) -> Bytes {
        let mut wire = BytesMut::with_capacity(self.data.len() + END_OF_MESSAGE.len());
        wire.put_slice(&self.data);
        if self.eof {
            wire.put_slice(END_OF_MESSAGE);
        }
        wire.freeze()
    }

    /// Move the accumulated message out, leaving this stream empty.
    pub fn take(&mut self) -> ByteStream {
        std::mem::take(self)
    }

    /// Consume the stream, returning its payload.
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}

impl From<&str> for ByteStream {
    fn from(payload: &str) -> Self {
        Self::from_payload(payload)
    }
}

impl From<Vec<u8>> for ByteStream {
    fn from(payload: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&payload[..]),
            eof: false,
        }
    }
}

fn find_marker(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(END_OF_MESSAGE.len())
        .position(|window| window == END_OF_MESSAGE)
}
