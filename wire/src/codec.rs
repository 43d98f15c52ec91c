//! Low-level read/write primitives shared by the client- and server-message
//! modules. Hand-rolled over `bytes::{Buf, BufMut}` rather than a generated
//! zero-copy builder layer: every field here is simple enough (fixed-width
//! integers, length-prefixed strings/bytes, small repeated groups) that a
//! direct reader/writer pair is the clearer and more auditable choice.

use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

use crate::error::DecodeError;

/// A cursor over a decoded message payload. Tracks how many bytes remain so
/// callers can detect trailing garbage (spec section 4.5: "any trailing
/// input bytes -> protocol error").
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::ExtraData)
        }
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.len() < n {
            Err(DecodeError::Underflow)
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn i16(&mut self) -> Result<i16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn i64(&mut self) -> Result<i64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn bytes(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        self.need(len)?;
        let out = Bytes::copy_from_slice(&self.buf[..len]);
        self.buf.advance(len);
        Ok(out)
    }

    pub fn uuid(&mut self) -> Result<Uuid, DecodeError> {
        self.need(16)?;
        let mut b = [0u8; 16];
        b.copy_from_slice(&self.buf[..16]);
        self.buf.advance(16);
        Ok(Uuid::from_bytes(b))
    }

    /// `u16`-length-prefixed UTF-8 string, as used for handshake params.
    pub fn str16(&mut self) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        Ok(std::str::from_utf8(&raw)?.to_owned())
    }

    /// `u32`-length-prefixed UTF-8 string, as used for most message bodies.
    pub fn str32(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let raw = self.bytes(len)?;
        Ok(std::str::from_utf8(&raw)?.to_owned())
    }

    /// `u32`-length-prefixed opaque bytes.
    pub fn bytes32(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    /// A nullable argument value: `i32` length, `-1` meaning NULL, otherwise
    /// that many following bytes.
    pub fn value(&mut self) -> Result<Option<Bytes>, DecodeError> {
        let len = self.i32()?;
        if len < 0 {
            Ok(None)
        } else {
            Ok(Some(self.bytes(len as usize)?))
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf
    }
}

pub trait WriterExt {
    fn put_str16(&mut self, s: &str);
    fn put_str32(&mut self, s: &str);
    fn put_bytes32(&mut self, b: &[u8]);
    fn put_uuid(&mut self, u: Uuid);
    fn put_value(&mut self, v: Option<&[u8]>);
}

impl<T: BufMut> WriterExt for T {
    fn put_str16(&mut self, s: &str) {
        self.put_u16(s.len() as u16);
        self.put_slice(s.as_bytes());
    }

    fn put_str32(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.put_slice(s.as_bytes());
    }

    fn put_bytes32(&mut self, b: &[u8]) {
        self.put_u32(b.len() as u32);
        self.put_slice(b);
    }

    fn put_uuid(&mut self, u: Uuid) {
        self.put_slice(u.as_bytes());
    }

    fn put_value(&mut self, v: Option<&[u8]>) {
        match v {
            None => self.put_i32(-1),
            Some(bytes) => {
                self.put_i32(bytes.len() as i32);
                self.put_slice(bytes);
            }
        }
    }
}
