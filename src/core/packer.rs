//! # Packer
//!
//! Writer half of the binary codec.
//!
//! All values are big-endian and written without type tags, so a reader must
//! consume fields in exactly the order they were written.
//!
//! ## Field Layout
//! ```text
//! bool      [0|1]
//! short     [i16]
//! int       [i32]
//! long      [i64]
//! double    [f64]
//! payload   [Length(i32)] [Bytes(N)]
//! string    payload of UTF-8 bytes
//! nullable  [Present(bool)] [Value]
//! array     [Count(i32)] [Elements]
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Growable big-endian write buffer
#[derive(Debug, Default)]
pub struct Packer {
    buffer: BytesMut,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn pack_bool(&mut self, value: bool) {
        self.buffer.put_u8(u8::from(value));
    }

    pub fn pack_short(&mut self, value: i16) {
        self.buffer.put_i16(value);
    }

    pub fn pack_int(&mut self, value: i32) {
        self.buffer.put_i32(value);
    }

    pub fn pack_long(&mut self, value: i64) {
        self.buffer.put_i64(value);
    }

    pub fn pack_double(&mut self, value: f64) {
        self.buffer.put_f64(value);
    }

    /// Write an element count
    ///
    /// Counts are bounded by the frame limit, well below `i32::MAX`. A larger
    /// count is a caller bug: debug builds panic and release builds write
    /// `i32::MAX`, which the reader rejects as truncated.
    pub fn pack_array_header(&mut self, count: usize) {
        debug_assert!(
            count <= i32::MAX as usize,
            "element count {count} exceeds the wire limit"
        );
        self.pack_int(i32::try_from(count).unwrap_or(i32::MAX));
    }

    pub fn pack_payload(&mut self, value: &[u8]) {
        self.pack_array_header(value.len());
        self.buffer.put_slice(value);
    }

    pub fn pack_nullable_payload(&mut self, value: Option<&[u8]>) {
        match value {
            Some(value) => {
                self.pack_bool(true);
                self.pack_payload(value);
            }
            None => self.pack_bool(false),
        }
    }

    pub fn pack_string(&mut self, value: &str) {
        self.pack_payload(value.as_bytes());
    }

    pub fn pack_nullable_string(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.pack_bool(true);
                self.pack_string(value);
            }
            None => self.pack_bool(false),
        }
    }

    pub fn pack_string_array<S: AsRef<str>>(&mut self, values: &[S]) {
        self.pack_array_header(values.len());
        for value in values {
            self.pack_string(value.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Copy out the written bytes, leaving the buffer (and its capacity) in place
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    /// Take the written bytes, leaving the packer empty
    pub fn take(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Discard everything written so far
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
