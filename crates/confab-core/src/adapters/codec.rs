//! Streaming JSON codec for the control protocol.
//!
//! Control connections carry concatenated JSON objects with no length
//! prefix or delimiter. The decoder owns a receive buffer, yields one
//! complete [`Message`] at a time, and keeps any trailing partial object for
//! the next read.

use bytes::{Buf, Bytes, BytesMut};

use crate::domain::message::Message;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serialize one message for the wire.
pub fn encode(msg: &Message) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(msg).map(Bytes::from)
}

/// Parse a single-object datagram.
pub fn decode_datagram(data: &[u8]) -> Result<Message, serde_json::Error> {
    serde_json::from_slice(data)
}

// ---------------------------------------------------------------------------
// Streaming decoder
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete message, if one is buffered.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete object yet. A
    /// syntax error means the stream is desynchronized; the buffer is cleared
    /// and the error returned so the caller can log and carry on.
    pub fn next(&mut self) -> Result<Option<Message>, serde_json::Error> {
        let (result, consumed) = {
            let mut iter = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Message>();
            match iter.next() {
                None => (Ok(None), self.buf.len()),
                Some(Ok(msg)) => (Ok(Some(msg)), iter.byte_offset()),
                Some(Err(e)) if e.is_eof() => (Ok(None), 0),
                Some(Err(e)) => (Err(e), self.buf.len()),
            }
        };
        self.buf.advance(consumed);
        result
    }

    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::{JoinMsg, Message};

    fn join(name: &str) -> Message {
        Message::Join(JoinMsg::Request { name: name.into() })
    }

    #[test]
    fn splits_concatenated_objects() {
        let mut dec = MessageDecoder::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode(&join("alice")).unwrap());
        wire.extend_from_slice(&encode(&join("bob")).unwrap());
        dec.push(&wire);

        assert_eq!(dec.next().unwrap(), Some(join("alice")));
        assert_eq!(dec.next().unwrap(), Some(join("bob")));
        assert_eq!(dec.next().unwrap(), None);
        assert_eq!(dec.pending_bytes(), 0);
    }

    #[test]
    fn keeps_partial_object_for_next_push() {
        let mut dec = MessageDecoder::new();
        let wire = encode(&join("alice")).unwrap();
        let (head, tail) = wire.split_at(wire.len() / 2);

        dec.push(head);
        assert_eq!(dec.next().unwrap(), None);
        assert!(dec.pending_bytes() > 0);

        dec.push(tail);
        assert_eq!(dec.next().unwrap(), Some(join("alice")));
    }

    #[test]
    fn garbage_clears_the_buffer() {
        let mut dec = MessageDecoder::new();
        dec.push(b"this is not json{{{");
        assert!(dec.next().is_err());
        assert_eq!(dec.pending_bytes(), 0);

        // The decoder still works afterwards.
        dec.push(&encode(&join("carol")).unwrap());
        assert_eq!(dec.next().unwrap(), Some(join("carol")));
    }

    #[test]
    fn unknown_message_shape_is_an_error_not_a_panic() {
        let mut dec = MessageDecoder::new();
        dec.push(br#"{"type":"frobnicate","subtype":"???"}"#);
        assert!(dec.next().is_err());
    }
}
