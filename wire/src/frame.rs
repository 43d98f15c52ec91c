//! Length-framed message codec: `type(1) | length(4, big-endian, includes
//! itself) | payload`. Transport-agnostic: operates on in-memory buffers fed
//! by whatever owns the socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

/// Flush threshold mentioned in spec section 4.1: coalesce writes until the
/// buffer exceeds this size, or until an explicit flush is requested.
pub const FLUSH_THRESHOLD: usize = 100 * 1024;

/// Default maximum single-message size. Conservative but generous; a real
/// deployment will size this to the largest legitimate Data/DumpBlock/
/// Restore payload it expects.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Incrementally assembles typed frames out of a byte stream.
///
/// Bytes arrive via [`FrameReader::extend`]; completed frames are taken one
/// at a time with [`FrameReader::take_message`], which returns `None`
/// without consuming anything if a full frame isn't buffered yet — mirroring
/// the non-blocking `take_message()` contract in spec section 4.1.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_message_size: u32,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl FrameReader {
    pub fn new(max_message_size: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feed newly-read transport bytes into the assembly buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull one complete frame off the front of the buffer, if one is fully
    /// buffered. Returns `(type_tag, payload)` where `payload` excludes the
    /// 5-byte header. Never consumes a partial frame.
    pub fn take_message(&mut self) -> Result<Option<(u8, Bytes)>, DecodeError> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let tag = self.buf[0];
        let length = u32::from_be_bytes(self.buf[1..5].try_into().unwrap());
        if length < 4 {
            return Err(DecodeError::BadLength);
        }
        if length > self.max_message_size {
            return Err(DecodeError::MessageTooLarge {
                size: length,
                limit: self.max_message_size,
            });
        }
        let total = 1 + length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.buf.advance(5);
        let payload = self.buf.split_to(total - 5).freeze();
        Ok(Some((tag, payload)))
    }
}

/// Accumulates outgoing frames, coalescing small writes and tracking when a
/// flush threshold has been crossed.
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
    flush_threshold: usize,
}

impl Default for FrameWriter {
    fn default() -> Self {
        FrameWriter { buf: BytesMut::new(), flush_threshold: FLUSH_THRESHOLD }
    }
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`FrameWriter::new`], but with a caller-supplied flush threshold
    /// instead of the [`FLUSH_THRESHOLD`] default.
    pub fn with_flush_threshold(flush_threshold: usize) -> Self {
        FrameWriter { buf: BytesMut::new(), flush_threshold }
    }

    /// Write one complete, atomically-framed message. `payload` must not
    /// itself be partially written — callers build the whole payload first.
    pub fn write_message(&mut self, tag: u8, payload: &[u8]) {
        let length = (payload.len() + 4) as u32;
        self.buf.reserve(5 + payload.len());
        self.buf.put_u8(tag);
        self.buf.put_u32(length);
        self.buf.put_slice(payload);
    }

    pub fn should_flush(&self) -> bool {
        self.buf.len() >= self.flush_threshold
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take everything buffered so far, for handing to the transport.
    pub fn drain(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_message_waits_for_full_frame() {
        let mut r = FrameReader::default();
        r.extend(&[b'X']);
        assert!(r.take_message().unwrap().is_none());
        r.extend(&[0, 0, 0, 4]);
        let (tag, payload) = r.take_message().unwrap().unwrap();
        assert_eq!(tag, b'X');
        assert!(payload.is_empty());
        assert!(r.take_message().unwrap().is_none());
    }

    #[test]
    fn take_message_handles_payload_and_pipelining() {
        let mut r = FrameReader::default();
        let mut w = FrameWriter::new();
        w.write_message(b'P', b"hello");
        w.write_message(b'S', b"");
        r.extend(&w.drain());

        let (tag, payload) = r.take_message().unwrap().unwrap();
        assert_eq!(tag, b'P');
        assert_eq!(&payload[..], b"hello");

        let (tag, payload) = r.take_message().unwrap().unwrap();
        assert_eq!(tag, b'S');
        assert!(payload.is_empty());

        assert!(r.take_message().unwrap().is_none());
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut r = FrameReader::new(10);
        r.extend(&[b'X', 0, 0, 0, 100]);
        assert!(matches!(
            r.take_message(),
            Err(DecodeError::MessageTooLarge { size: 100, limit: 10 })
        ));
    }

    #[test]
    fn bad_length_is_rejected() {
        let mut r = FrameReader::default();
        r.extend(&[b'X', 0, 0, 0, 1]);
        assert!(matches!(r.take_message(), Err(DecodeError::BadLength)));
    }

    #[test]
    fn writer_tracks_flush_threshold() {
        let mut w = FrameWriter::new();
        assert!(!w.should_flush());
        w.write_message(b'D', &vec![0u8; FLUSH_THRESHOLD]);
        assert!(w.should_flush());
    }
}
