// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Growable byte buffer with a cursor.
//!
//! Every stream and connection buffer in the crate is a [`Buffer`]. It keeps
//! three markers:
//!
//! ```text
//! 0                position              limit            capacity
//! |=================|=====================|...................|
//!   already consumed     readable/valid        reserved, unused
//! ```
//!
//! `put_*` writes at `position`, growing `limit` (and the backing storage)
//! as needed. `get_*` reads at `position` and fails once it would cross
//! `limit`. The buffer only reports bounds failures; callers decide which
//! protocol error they map to.

use std::fmt;

/// Smallest capacity allocated when the buffer first grows.
const MIN_CAPACITY: usize = 256;

/// Bounds failure reported by [`Buffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// A read needed more bytes than remain before `limit`.
    Underflow { offset: usize, needed: usize },
    /// A random-access write targeted bytes past `limit`.
    OutOfRange { offset: usize, len: usize },
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Underflow { offset, needed } => {
                write!(f, "read of {} bytes at offset {} past limit", needed, offset)
            }
            BufferError::OutOfRange { offset, len } => {
                write!(f, "write of {} bytes at offset {} past limit", len, offset)
            }
        }
    }
}

impl std::error::Error for BufferError {}

pub type BufferResult<T> = core::result::Result<T, BufferError>;

/// Generate little/big-endian put methods for primitive types.
macro_rules! impl_put {
    ($le:ident, $be:ident, $type:ty) => {
        pub fn $le(&mut self, value: $type) {
            self.put_slice(&value.to_le_bytes());
        }

        pub fn $be(&mut self, value: $type) {
            self.put_slice(&value.to_be_bytes());
        }
    };
}

/// Generate little/big-endian get methods for primitive types.
macro_rules! impl_get {
    ($le:ident, $be:ident, $type:ty, $size:expr) => {
        pub fn $le(&mut self) -> BufferResult<$type> {
            let mut bytes = [0u8; $size];
            bytes.copy_from_slice(self.get_slice($size)?);
            Ok(<$type>::from_le_bytes(bytes))
        }

        pub fn $be(&mut self) -> BufferResult<$type> {
            let mut bytes = [0u8; $size];
            bytes.copy_from_slice(self.get_slice($size)?);
            Ok(<$type>::from_be_bytes(bytes))
        }
    };
}

/// Growable byte array with a read/write cursor.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer of `size` zeroed bytes, position 0.
    pub fn with_size(size: usize) -> Self {
        let mut buf = Self::new();
        buf.resize(size);
        buf
    }

    /// Wrap existing bytes for reading (position 0, limit = len).
    pub fn from_vec(data: Vec<u8>) -> Self {
        let limit = data.len();
        Self {
            data,
            position: 0,
            limit,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the cursor. Positions past `limit` are clamped.
    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.limit);
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.position)
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.limit == 0
    }

    /// Valid bytes, `0..limit`.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.limit]
    }

    /// Mutable view of `position..limit`, used by transceivers filling the buffer.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// Unconsumed bytes, `position..limit`.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// Advance the cursor by `n` bytes already consumed or produced in place.
    pub fn advance(&mut self, n: usize) -> BufferResult<()> {
        if n > self.remaining() {
            return Err(BufferError::Underflow {
                offset: self.position,
                needed: n,
            });
        }
        self.position += n;
        Ok(())
    }

    /// Reset to an empty buffer, keeping the allocation.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = 0;
    }

    /// Release the allocation entirely.
    pub fn reset(&mut self) {
        self.data = Vec::new();
        self.position = 0;
        self.limit = 0;
    }

    /// Set `limit` to `n`, growing storage when needed. The position is
    /// clamped to the new limit.
    pub fn resize(&mut self, n: usize) {
        self.reserve(n);
        self.limit = n;
        if self.position > n {
            self.position = n;
        }
    }

    /// Make room for `n` more bytes at the cursor, extending `limit`.
    pub fn expand(&mut self, n: usize) {
        let needed = self.position + n;
        if needed > self.limit {
            self.resize(needed);
        }
    }

    /// Geometric growth preserving the existing bytes.
    fn reserve(&mut self, n: usize) {
        if n <= self.data.len() {
            return;
        }
        let grown = (self.data.len() * 2).max(n).max(MIN_CAPACITY);
        self.data.resize(grown, 0);
    }

    /// Take the bytes `0..limit`, leaving the buffer empty.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.limit);
        self.data
    }

    /// Exchange contents with another buffer.
    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn put_u8(&mut self, value: u8) {
        self.expand(1);
        self.data[self.position] = value;
        self.position += 1;
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.expand(bytes.len());
        self.data[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    impl_put!(put_i16, put_i16_be, i16);
    impl_put!(put_i32, put_i32_be, i32);
    impl_put!(put_i64, put_i64_be, i64);
    impl_put!(put_f32, put_f32_be, f32);
    impl_put!(put_f64, put_f64_be, f64);

    /// Overwrite bytes at `offset` without moving the cursor.
    pub fn put_slice_at(&mut self, offset: usize, bytes: &[u8]) -> BufferResult<()> {
        if offset + bytes.len() > self.limit {
            return Err(BufferError::OutOfRange {
                offset,
                len: bytes.len(),
            });
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn put_u8_at(&mut self, offset: usize, value: u8) -> BufferResult<()> {
        self.put_slice_at(offset, &[value])
    }

    pub fn put_i32_at(&mut self, offset: usize, value: i32) -> BufferResult<()> {
        self.put_slice_at(offset, &value.to_le_bytes())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Borrow the next `n` bytes and advance past them.
    pub fn get_slice(&mut self, n: usize) -> BufferResult<&[u8]> {
        if n > self.remaining() {
            return Err(BufferError::Underflow {
                offset: self.position,
                needed: n,
            });
        }
        let start = self.position;
        self.position += n;
        Ok(&self.data[start..start + n])
    }

    /// Copy the next `n` bytes out.
    pub fn get_array(&mut self, n: usize) -> BufferResult<Vec<u8>> {
        self.get_slice(n).map(<[u8]>::to_vec)
    }

    pub fn get_u8(&mut self) -> BufferResult<u8> {
        Ok(self.get_slice(1)?[0])
    }

    pub fn get_bool(&mut self) -> BufferResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    impl_get!(get_i16, get_i16_be, i16, 2);
    impl_get!(get_i32, get_i32_be, i32, 4);
    impl_get!(get_i64, get_i64_be, i64, 8);
    impl_get!(get_f32, get_f32_be, f32, 4);
    impl_get!(get_f64, get_f64_be, f64, 8);

    /// Read a byte at `offset` without moving the cursor.
    pub fn get_u8_at(&self, offset: usize) -> BufferResult<u8> {
        if offset >= self.limit {
            return Err(BufferError::Underflow { offset, needed: 1 });
        }
        Ok(self.data[offset])
    }

    /// Read a little-endian i32 at `offset` without moving the cursor.
    pub fn get_i32_at(&self, offset: usize) -> BufferResult<i32> {
        if offset + 4 > self.limit {
            return Err(BufferError::Underflow { offset, needed: 4 });
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[offset..offset + 4]);
        Ok(i32::from_le_bytes(bytes))
    }
}
