//! # Unpacker
//!
//! Reader half of the binary codec. Every `unpack_*` call is the exact dual of the
//! matching [`Packer`](super::packer::Packer) method.
//!
//! Reads never panic: running past the end of the buffer yields
//! [`ProtocolError::Truncated`], a negative length yields
//! [`ProtocolError::InvalidLength`] and malformed UTF-8 yields
//! [`ProtocolError::InvalidString`]. Payloads are returned as zero-copy slices of
//! the input.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, Bytes};

/// Cursor over a received packet
#[derive(Debug, Clone)]
pub struct Unpacker {
    data: Bytes,
    position: usize,
}

impl Unpacker {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn take(&mut self, needed: usize) -> Result<Bytes> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(ProtocolError::Truncated { needed, remaining });
        }
        let slice = self.data.slice(self.position..self.position + needed);
        self.position += needed;
        Ok(slice)
    }

    /// Move the cursor back over bytes that were already read
    pub fn unread(&mut self, count: usize) {
        self.position = self.position.saturating_sub(count);
    }

    /// Everything that has not been read yet
    pub fn into_remaining(self) -> Bytes {
        self.data.slice(self.position..)
    }

    pub fn unpack_bool(&mut self) -> Result<bool> {
        Ok(self.unpack_byte()? == 1)
    }

    pub fn unpack_byte(&mut self) -> Result<i8> {
        Ok(self.take(1)?.get_i8())
    }

    pub fn unpack_short(&mut self) -> Result<i16> {
        Ok(self.take(2)?.get_i16())
    }

    pub fn unpack_int(&mut self) -> Result<i32> {
        Ok(self.take(4)?.get_i32())
    }

    pub fn unpack_long(&mut self) -> Result<i64> {
        Ok(self.take(8)?.get_i64())
    }

    pub fn unpack_double(&mut self) -> Result<f64> {
        Ok(self.take(8)?.get_f64())
    }

    /// Read an element count
    pub fn unpack_array_header(&mut self) -> Result<usize> {
        let count = self.unpack_int()?;
        usize::try_from(count).map_err(|_| ProtocolError::InvalidLength(count))
    }

    pub fn unpack_payload(&mut self) -> Result<Bytes> {
        let length = self.unpack_array_header()?;
        self.take(length)
    }

    pub fn unpack_nullable_payload(&mut self) -> Result<Option<Bytes>> {
        if self.unpack_bool()? {
            self.unpack_payload().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn unpack_string(&mut self) -> Result<String> {
        let payload = self.unpack_payload()?;
        String::from_utf8(payload.to_vec())
            .map_err(|e| ProtocolError::InvalidString(e.to_string()))
    }

    pub fn unpack_nullable_string(&mut self) -> Result<Option<String>> {
        if self.unpack_bool()? {
            self.unpack_string().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn unpack_string_array(&mut self) -> Result<Vec<String>> {
        let count = self.unpack_array_header()?;
        // Every string costs at least its 4-byte length
        let mut values = Vec::with_capacity(count.min(self.remaining() / 4));
        for _ in 0..count {
            values.push(self.unpack_string()?);
        }
        Ok(values)
    }
}
