// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Input stream: unmarshals data from a [`Buffer`].

use std::sync::Arc;

use super::decoder::DecoderState;
use super::exception::UserException;
use super::registry::TypeRegistry;
use super::value::{PatchCallback, SlicedData, ValueSlot};
use super::{OptionalFormat, SliceType, Strategy, OPTIONAL_END_MARKER};
use crate::buffer::Buffer;
use crate::config::{Config, DEFAULT_CLASS_GRAPH_DEPTH_MAX};
use crate::error::{Error, Result};
use crate::identity::{Context, Identity};
use crate::protocol::{check_supported_encoding, EncodingVersion, CURRENT_PROTOCOL_ENCODING};

/// Read-side encapsulation frame. The implicit frame spans the whole buffer.
pub(crate) struct ReadEncaps {
    start: usize,
    size: usize,
    implicit: bool,
    pub(crate) encoding: EncodingVersion,
    pub(crate) decoder: Option<DecoderState>,
}

impl ReadEncaps {
    fn implicit(encoding: EncodingVersion) -> Self {
        Self {
            start: 0,
            size: 0,
            implicit: true,
            encoding,
            decoder: None,
        }
    }
}

/// Next entry in a run of tagged members.
enum OptionalTag {
    /// Reached the end of the encapsulation.
    EndOfEncapsulation,
    /// Consumed the `0xFF` end marker.
    EndMarker,
    Member {
        tag: u32,
        format: OptionalFormat,
        start: usize,
    },
}

/// Unmarshals primitives, strings, sequences, tagged members, class graphs
/// and exceptions.
pub struct InputStream {
    pub(crate) buf: Buffer,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) class_graph_depth_max: usize,
    pub(crate) slice_values: bool,
    pub(crate) trace_slicing: u8,
    start_seq: Option<usize>,
    min_seq_size: usize,
    pub(crate) encaps: ReadEncaps,
    parents: Vec<ReadEncaps>,
}

impl InputStream {
    pub fn new(encoding: EncodingVersion, bytes: Vec<u8>) -> Self {
        Self::from_buffer(encoding, Buffer::from_vec(bytes))
    }

    pub fn from_buffer(encoding: EncodingVersion, buf: Buffer) -> Self {
        Self {
            buf,
            registry: Arc::new(TypeRegistry::new()),
            class_graph_depth_max: DEFAULT_CLASS_GRAPH_DEPTH_MAX,
            slice_values: true,
            trace_slicing: 0,
            start_seq: None,
            min_seq_size: 0,
            encaps: ReadEncaps::implicit(encoding),
            parents: Vec::new(),
        }
    }

    /// Stream over a message, using the protocol encoding and the
    /// limits from `config`.
    pub fn for_protocol(buf: Buffer, config: &Config, registry: Arc<TypeRegistry>) -> Self {
        Self::from_buffer(CURRENT_PROTOCOL_ENCODING, buf).with_config(config, registry)
    }

    pub fn with_config(self, config: &Config, registry: Arc<TypeRegistry>) -> Self {
        self.with_registry(registry)
            .with_class_graph_depth_max(config.class_graph_depth_max)
            .with_slice_values(config.slice_values)
            .with_trace_slicing(config.trace.slicing)
    }

    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_class_graph_depth_max(mut self, depth: usize) -> Self {
        self.class_graph_depth_max = depth.max(1);
        self
    }

    pub fn with_slice_values(mut self, slice_values: bool) -> Self {
        self.slice_values = slice_values;
        self
    }

    pub fn with_trace_slicing(mut self, level: u8) -> Self {
        self.trace_slicing = level;
        self
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }

    pub fn into_buffer(self) -> Buffer {
        self.buf
    }

    pub fn pos(&self) -> usize {
        self.buf.position()
    }

    pub fn set_pos(&mut self, pos: usize) {
        self.buf.set_position(pos);
    }

    pub fn size(&self) -> usize {
        self.buf.limit()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Encoding of the innermost encapsulation.
    pub fn encoding(&self) -> EncodingVersion {
        self.encaps.encoding
    }

    pub(crate) fn strategy(&self) -> Strategy {
        Strategy::for_encoding(self.encaps.encoding)
    }

    /// Offset one past the last byte of the innermost encapsulation.
    pub(crate) fn encaps_end(&self) -> usize {
        if self.encaps.implicit {
            self.buf.limit()
        } else {
            self.encaps.start + self.encaps.size
        }
    }

    // ========================================================================
    // Encapsulations
    // ========================================================================

    /// Open an encapsulation, returning its encoding.
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion> {
        let start = self.buf.position();
        let (size, encoding) = self.read_encapsulation_header()?;
        check_supported_encoding(encoding)?;
        let frame = ReadEncaps {
            start,
            size,
            implicit: false,
            encoding,
            decoder: None,
        };
        let parent = std::mem::replace(&mut self.encaps, frame);
        self.parents.push(parent);
        Ok(encoding)
    }

    /// Close the innermost encapsulation; the cursor must sit exactly at its
    /// end. Under 1.0 one trailing byte is tolerated (written by old
    /// encoders for exceptions with class members).
    pub fn end_encapsulation(&mut self) -> Result<()> {
        if self.encaps.implicit {
            return Err(Error::encapsulation("no encapsulation to end"));
        }
        let end = self.encaps_end();
        if !self.encaps.encoding.is_1_0() {
            self.skip_optionals()?;
            if self.buf.position() != end {
                return Err(Error::encapsulation(format!(
                    "encapsulation ends at {} but cursor is at {}",
                    end,
                    self.buf.position()
                )));
            }
        } else if self.buf.position() != end {
            if self.buf.position() + 1 != end {
                return Err(Error::encapsulation(format!(
                    "encapsulation ends at {} but cursor is at {}",
                    end,
                    self.buf.position()
                )));
            }
            self.buf.get_u8()?;
        }
        match self.parents.pop() {
            Some(parent) => self.encaps = parent,
            None => return Err(Error::encapsulation("no encapsulation to end")),
        }
        Ok(())
    }

    fn read_encapsulation_header(&mut self) -> Result<(usize, EncodingVersion)> {
        let sz = self.read_i32()?;
        if sz < 6 {
            return Err(Error::UnmarshalOutOfBounds {
                reason: format!("encapsulation size {} below minimum", sz),
            });
        }
        let sz = sz as usize;
        if sz - 4 > self.buf.remaining() {
            return Err(Error::UnmarshalOutOfBounds {
                reason: format!("encapsulation size {} exceeds remaining bytes", sz),
            });
        }
        let encoding = self.read_encoding()?;
        Ok((sz, encoding))
    }

    /// Skip an encapsulation expected to be empty. Under 1.1 any tagged
    /// content is skipped; under 1.0 the size must be exactly 6.
    pub fn skip_empty_encapsulation(&mut self) -> Result<EncodingVersion> {
        let sz = self.read_i32()?;
        if sz < 6 {
            return Err(Error::encapsulation(format!("invalid size {}", sz)));
        }
        let sz = sz as usize;
        if sz - 4 > self.buf.remaining() {
            return Err(Error::UnmarshalOutOfBounds {
                reason: format!("encapsulation size {} exceeds remaining bytes", sz),
            });
        }
        let encoding = self.read_encoding()?;
        check_supported_encoding(encoding)?;
        if encoding.is_1_0() {
            if sz != 6 {
                return Err(Error::encapsulation(format!(
                    "expected empty encapsulation, size is {}",
                    sz
                )));
            }
        } else {
            self.skip(sz - 6)?;
        }
        Ok(encoding)
    }

    /// Copy out a whole encapsulation, size and version included.
    pub fn read_encapsulation(&mut self) -> Result<(Vec<u8>, EncodingVersion)> {
        let start = self.buf.position();
        let (sz, encoding) = self.read_encapsulation_header()?;
        self.buf.set_position(start);
        let bytes = self.read_blob(sz)?;
        Ok((bytes, encoding))
    }

    pub fn skip_encapsulation(&mut self) -> Result<EncodingVersion> {
        let sz = self.read_i32()?;
        if sz < 6 {
            return Err(Error::UnmarshalOutOfBounds {
                reason: format!("encapsulation size {} below minimum", sz),
            });
        }
        let encoding = self.read_encoding()?;
        self.skip(sz as usize - 6)?;
        Ok(encoding)
    }

    /// Payload size of the innermost encapsulation.
    pub fn get_encapsulation_size(&self) -> usize {
        if self.encaps.implicit {
            self.buf.limit()
        } else {
            self.encaps.size - 6
        }
    }

    pub fn read_encoding(&mut self) -> Result<EncodingVersion> {
        Ok(EncodingVersion {
            major: self.read_u8()?,
            minor: self.read_u8()?,
        })
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.buf.advance(n).map_err(Error::from)
    }

    pub fn read_blob(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.buf.get_array(n)?)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.buf.get_u8()?)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.buf.get_bool()?)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.buf.get_i16()?)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.buf.get_i32()?)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.buf.get_i64()?)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(self.buf.get_f32()?)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(self.buf.get_f64()?)
    }

    pub fn read_size(&mut self) -> Result<usize> {
        let b = self.read_u8()?;
        if b == 255 {
            let v = self.read_i32()?;
            if v < 0 {
                return Err(Error::UnmarshalOutOfBounds {
                    reason: format!("negative size {}", v),
                });
            }
            return Ok(v as usize);
        }
        Ok(b as usize)
    }

    pub fn skip_size(&mut self) -> Result<()> {
        if self.read_u8()? == 255 {
            self.skip(4)?;
        }
        Ok(())
    }

    /// Read a sequence size and check that the bytes left can hold at least
    /// `min_size` bytes per element, accounting for enclosing sequences.
    pub fn read_and_check_seq_size(&mut self, min_size: usize) -> Result<usize> {
        let sz = self.read_size()?;
        if sz == 0 {
            return Ok(0);
        }
        let pos = self.buf.position();
        let needed = sz.saturating_mul(min_size);
        match self.start_seq {
            Some(start) if pos <= start.saturating_add(self.min_seq_size) => {
                self.min_seq_size = self.min_seq_size.saturating_add(needed);
            }
            _ => {
                self.start_seq = Some(pos);
                self.min_seq_size = needed;
            }
        }
        let start = self.start_seq.unwrap_or(pos);
        if start.saturating_add(self.min_seq_size) > self.buf.limit() {
            return Err(Error::UnmarshalOutOfBounds {
                reason: format!("sequence of {} elements exceeds remaining bytes", sz),
            });
        }
        Ok(sz)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_size()?;
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.buf.get_slice(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::marshal("string is not valid UTF-8"))
    }

    /// Enumerator, see [`OutputStream::write_enum`](super::OutputStream::write_enum).
    pub fn read_enum(&mut self, max_value: i32) -> Result<i32> {
        let v = if self.encaps.encoding.is_1_0() {
            if max_value < 127 {
                i32::from(self.read_u8()?)
            } else if max_value < 32767 {
                i32::from(self.read_i16()?)
            } else {
                self.read_i32()?
            }
        } else {
            self.read_size()? as i32
        };
        if v < 0 || v > max_value {
            return Err(Error::marshal(format!("enumerator value {} out of range", v)));
        }
        Ok(v)
    }

    // ========================================================================
    // Sequences
    // ========================================================================

    pub fn read_byte_seq(&mut self) -> Result<Vec<u8>> {
        let n = self.read_and_check_seq_size(1)?;
        self.read_blob(n)
    }

    pub fn read_bool_seq(&mut self) -> Result<Vec<bool>> {
        let n = self.read_and_check_seq_size(1)?;
        (0..n).map(|_| self.read_bool()).collect()
    }

    pub fn read_i16_seq(&mut self) -> Result<Vec<i16>> {
        let n = self.read_and_check_seq_size(2)?;
        (0..n).map(|_| self.read_i16()).collect()
    }

    pub fn read_i32_seq(&mut self) -> Result<Vec<i32>> {
        let n = self.read_and_check_seq_size(4)?;
        (0..n).map(|_| self.read_i32()).collect()
    }

    pub fn read_i64_seq(&mut self) -> Result<Vec<i64>> {
        let n = self.read_and_check_seq_size(8)?;
        (0..n).map(|_| self.read_i64()).collect()
    }

    pub fn read_f32_seq(&mut self) -> Result<Vec<f32>> {
        let n = self.read_and_check_seq_size(4)?;
        (0..n).map(|_| self.read_f32()).collect()
    }

    pub fn read_f64_seq(&mut self) -> Result<Vec<f64>> {
        let n = self.read_and_check_seq_size(8)?;
        (0..n).map(|_| self.read_f64()).collect()
    }

    pub fn read_string_seq(&mut self) -> Result<Vec<String>> {
        let n = self.read_and_check_seq_size(1)?;
        (0..n).map(|_| self.read_string()).collect()
    }

    pub fn read_identity(&mut self) -> Result<Identity> {
        let name = self.read_string()?;
        let category = self.read_string()?;
        Ok(Identity { name, category })
    }

    pub fn read_context(&mut self) -> Result<Context> {
        let n = self.read_and_check_seq_size(2)?;
        let mut ctx = Context::new();
        for _ in 0..n {
            let k = self.read_string()?;
            let v = self.read_string()?;
            ctx.insert(k, v);
        }
        Ok(ctx)
    }

    // ========================================================================
    // Tagged members
    // ========================================================================

    /// Position the cursor on tagged member `tag` if present.
    ///
    /// Members with smaller tags are skipped; a larger tag or the end of
    /// the members leaves the cursor untouched and reports absence. A
    /// present member with a different format is a protocol error.
    pub fn read_optional(&mut self, tag: u32, expected: OptionalFormat) -> Result<bool> {
        if let Some(dec) = self.encaps.decoder.as_ref() {
            if !dec.accepts_optionals() {
                return Ok(false);
            }
        }
        self.read_opt_impl(tag, expected)
    }

    fn read_opt_impl(&mut self, read_tag: u32, expected: OptionalFormat) -> Result<bool> {
        if self.encaps.encoding.is_1_0() {
            return Ok(false);
        }
        loop {
            match self.next_optional_tag()? {
                OptionalTag::EndOfEncapsulation => return Ok(false),
                OptionalTag::EndMarker => {
                    let pos = self.buf.position() - 1;
                    self.buf.set_position(pos);
                    return Ok(false);
                }
                OptionalTag::Member { tag, format, start } => {
                    if tag > read_tag {
                        self.buf.set_position(start);
                        return Ok(false);
                    }
                    if tag < read_tag {
                        self.skip_optional(format)?;
                        continue;
                    }
                    if format != expected {
                        return Err(Error::marshal(format!(
                            "invalid optional data member `{}': unexpected format",
                            tag
                        )));
                    }
                    return Ok(true);
                }
            }
        }
    }

    fn next_optional_tag(&mut self) -> Result<OptionalTag> {
        if self.buf.position() >= self.encaps_end() {
            return Ok(OptionalTag::EndOfEncapsulation);
        }
        let start = self.buf.position();
        let v = self.read_u8()?;
        if v == OPTIONAL_END_MARKER {
            return Ok(OptionalTag::EndMarker);
        }
        let format = OptionalFormat::from_bits(v);
        let mut tag = u32::from(v >> 3);
        if tag == 30 {
            tag = self.read_size()? as u32;
        }
        Ok(OptionalTag::Member { tag, format, start })
    }

    /// Skip the value of a tagged member of the given format.
    pub fn skip_optional(&mut self, format: OptionalFormat) -> Result<()> {
        match format {
            OptionalFormat::F1 => self.skip(1),
            OptionalFormat::F2 => self.skip(2),
            OptionalFormat::F4 => self.skip(4),
            OptionalFormat::F8 => self.skip(8),
            OptionalFormat::Size => self.skip_size(),
            OptionalFormat::VSize => {
                let n = self.read_size()?;
                self.skip(n)
            }
            OptionalFormat::FSize => {
                let n = self.read_i32()?;
                if n < 0 {
                    return Err(Error::UnmarshalOutOfBounds {
                        reason: format!("negative member size {}", n),
                    });
                }
                self.skip(n as usize)
            }
            OptionalFormat::Class => self.read_value(Box::new(|_| {})),
        }
    }

    /// Skip every remaining tagged member up to and including the end
    /// marker (or the end of the encapsulation).
    pub fn skip_optionals(&mut self) -> Result<()> {
        loop {
            match self.next_optional_tag()? {
                OptionalTag::EndOfEncapsulation | OptionalTag::EndMarker => return Ok(()),
                OptionalTag::Member { format, .. } => self.skip_optional(format)?,
            }
        }
    }

    pub fn read_optional_u8(&mut self, tag: u32) -> Result<Option<u8>> {
        if self.read_optional(tag, OptionalFormat::F1)? {
            return self.read_u8().map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_bool(&mut self, tag: u32) -> Result<Option<bool>> {
        if self.read_optional(tag, OptionalFormat::F1)? {
            return self.read_bool().map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_i16(&mut self, tag: u32) -> Result<Option<i16>> {
        if self.read_optional(tag, OptionalFormat::F2)? {
            return self.read_i16().map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_i32(&mut self, tag: u32) -> Result<Option<i32>> {
        if self.read_optional(tag, OptionalFormat::F4)? {
            return self.read_i32().map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_i64(&mut self, tag: u32) -> Result<Option<i64>> {
        if self.read_optional(tag, OptionalFormat::F8)? {
            return self.read_i64().map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_f32(&mut self, tag: u32) -> Result<Option<f32>> {
        if self.read_optional(tag, OptionalFormat::F4)? {
            return self.read_f32().map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_f64(&mut self, tag: u32) -> Result<Option<f64>> {
        if self.read_optional(tag, OptionalFormat::F8)? {
            return self.read_f64().map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_string(&mut self, tag: u32) -> Result<Option<String>> {
        if self.read_optional(tag, OptionalFormat::VSize)? {
            return self.read_string().map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_enum(&mut self, tag: u32, max_value: i32) -> Result<Option<i32>> {
        if self.read_optional(tag, OptionalFormat::Size)? {
            return self.read_enum(max_value).map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_byte_seq(&mut self, tag: u32) -> Result<Option<Vec<u8>>> {
        if self.read_optional(tag, OptionalFormat::VSize)? {
            return self.read_byte_seq().map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_i32_seq(&mut self, tag: u32) -> Result<Option<Vec<i32>>> {
        if self.read_optional(tag, OptionalFormat::VSize)? {
            self.skip_size()?;
            return self.read_i32_seq().map(Some);
        }
        Ok(None)
    }

    /// Variable-size member written inside an FSize frame.
    pub fn read_optional_fsize<T, F>(&mut self, tag: u32, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut InputStream) -> Result<T>,
    {
        if self.read_optional(tag, OptionalFormat::FSize)? {
            self.skip(4)?;
            return f(self).map(Some);
        }
        Ok(None)
    }

    pub fn read_optional_value(&mut self, tag: u32, slot: &ValueSlot) -> Result<bool> {
        if self.read_optional(tag, OptionalFormat::Class)? {
            self.read_value_into(slot)?;
            return Ok(true);
        }
        Ok(false)
    }

    // ========================================================================
    // Classes and exceptions
    // ========================================================================

    /// Read a class instance reference; `cb` receives the instance once it
    /// is available, which may be after this call returns.
    pub fn read_value(&mut self, cb: PatchCallback) -> Result<()> {
        match self.strategy() {
            Strategy::V1_0 => self.read_value_10(cb),
            Strategy::V1_1 => self.read_value_11(cb),
        }
    }

    pub fn read_value_into(&mut self, slot: &ValueSlot) -> Result<()> {
        self.read_value(slot.patcher())
    }

    /// Read the instances queued after the top-level data under 1.0.
    pub fn read_pending_values(&mut self) -> Result<()> {
        match (self.strategy(), self.encaps.decoder.is_some()) {
            (Strategy::V1_0, true) => self.read_pending_values_10(),
            // 1.0 data that referenced no instance still carries an empty
            // pending sequence.
            (Strategy::V1_0, false) => self.skip_size(),
            (Strategy::V1_1, _) => Ok(()),
        }
    }

    /// Read a user exception. Unknown exception types surface as
    /// [`Error::UnknownUserException`] with the most-derived type id.
    pub fn read_exception(&mut self) -> Result<Box<dyn UserException>> {
        match self.strategy() {
            Strategy::V1_0 => self.read_exception_10(),
            Strategy::V1_1 => self.read_exception_11(),
        }
    }

    pub fn start_value(&mut self) -> Result<()> {
        self.start_instance_slices(SliceType::Value)
    }

    pub fn end_value(&mut self, preserve: bool) -> Result<Option<SlicedData>> {
        self.end_instance_slices(preserve)
    }

    pub fn start_exception(&mut self) -> Result<()> {
        self.start_instance_slices(SliceType::Exception)
    }

    pub fn end_exception(&mut self, preserve: bool) -> Result<Option<SlicedData>> {
        self.end_instance_slices(preserve)
    }

    /// Read a slice header, returning the slice's type id (empty for
    /// compact-format slices after the first).
    pub fn start_slice(&mut self) -> Result<String> {
        match self.strategy() {
            Strategy::V1_0 => self.start_slice_10(),
            Strategy::V1_1 => self.start_slice_11(),
        }
    }

    pub fn end_slice(&mut self) -> Result<()> {
        match self.strategy() {
            Strategy::V1_0 => Ok(()),
            Strategy::V1_1 => self.end_slice_11(),
        }
    }

    pub fn skip_slice(&mut self) -> Result<()> {
        match self.strategy() {
            Strategy::V1_0 => self.skip_slice_10(),
            Strategy::V1_1 => self.skip_slice_11(),
        }
    }
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("buf", &self.buf)
            .field("encoding", &self.encaps.encoding)
            .field("depth", &self.parents.len())
            .finish()
    }
}
