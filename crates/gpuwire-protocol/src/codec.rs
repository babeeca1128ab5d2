//! Little-endian field readers/writers for framed commands.
//!
//! The writer assumes the caller sized the destination via the command's
//! `payload_size()`; a mismatch is an internal bug, not peer-controlled
//! input, so writes index directly. The reader range-checks everything: it
//! only ever sees bytes supplied by the peer.

use crate::error::WireError;
use crate::handle::ObjectHandle;

pub struct CmdWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> CmdWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    pub fn write_handle(&mut self, h: ObjectHandle) {
        self.write_u32(h.id);
        self.write_u32(h.generation);
    }

    /// Length-prefixed UTF-8 string (u32 byte length, then the bytes).
    pub fn write_string(&mut self, s: &str) {
        let bytes = s.as_bytes();
        debug_assert!(bytes.len() <= u32::MAX as usize);
        self.write_u32(bytes.len() as u32);
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

/// Serialized size of a length-prefixed string.
pub(crate) fn string_wire_size(s: &str) -> usize {
    4 + s.len()
}

pub struct CmdReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> CmdReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        let b = *self.bytes.get(self.pos).ok_or(WireError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub fn read_handle(&mut self) -> Result<ObjectHandle, WireError> {
        Ok(ObjectHandle {
            id: self.read_u32()?,
            generation: self.read_u32()?,
        })
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    pub fn read_string(&mut self, what: &'static str) -> Result<String, WireError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        let s = core::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8(what))?;
        Ok(s.to_string())
    }

    /// Advances to the next multiple of `align` relative to the payload
    /// start. Extension blobs are laid out on [`crate::EXT_ALIGN`]
    /// boundaries; the command header length is itself a multiple of it, so
    /// payload-relative alignment matches frame-relative alignment.
    pub fn align_to(&mut self, align: usize) {
        debug_assert!(align.is_power_of_two());
        let aligned = (self.pos + (align - 1)) & !(align - 1);
        self.pos = aligned.min(self.bytes.len());
    }

    /// Consumes trailing padding and fails if real payload bytes remain.
    pub fn expect_end(&mut self, align: usize) -> Result<(), WireError> {
        self.align_to(align);
        if self.remaining() != 0 {
            return Err(WireError::TrailingBytes);
        }
        Ok(())
    }
}
