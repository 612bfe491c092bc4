// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Output stream: marshals data into a growable [`Buffer`].

use super::encoder::EncoderState;
use super::exception::UserException;
use super::value::{SlicedData, ValuePtr};
use super::{FormatType, OptionalFormat, Strategy};
use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::identity::{Context, Identity};
use crate::protocol::{
    check_supported_encoding, EncodingVersion, CURRENT_ENCODING, CURRENT_PROTOCOL_ENCODING,
};

/// Write-side encapsulation frame.
pub(crate) struct WriteEncaps {
    pub(crate) start: usize,
    pub(crate) encoding: EncodingVersion,
    pub(crate) format: FormatType,
    pub(crate) encoder: Option<EncoderState>,
}

impl WriteEncaps {
    fn new(start: usize, encoding: EncodingVersion, format: FormatType) -> Self {
        Self {
            start,
            encoding,
            format,
            encoder: None,
        }
    }
}

/// Marshals primitives, strings, sequences, tagged members, class graphs
/// and exceptions.
///
/// Data written outside an explicit encapsulation uses the stream's own
/// encoding and format.
pub struct OutputStream {
    pub(crate) buf: Buffer,
    encoding: EncodingVersion,
    format: FormatType,
    pub(crate) encaps: WriteEncaps,
    parents: Vec<WriteEncaps>,
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new(CURRENT_ENCODING)
    }
}

impl OutputStream {
    pub fn new(encoding: EncodingVersion) -> Self {
        Self::with_format(encoding, FormatType::Compact)
    }

    pub fn with_format(encoding: EncodingVersion, format: FormatType) -> Self {
        let format = format.or(FormatType::Compact);
        Self {
            buf: Buffer::new(),
            encoding,
            format,
            encaps: WriteEncaps::new(0, encoding, format),
            parents: Vec::new(),
        }
    }

    /// Stream for message headers and request/reply bodies.
    pub fn for_protocol() -> Self {
        Self::new(CURRENT_PROTOCOL_ENCODING)
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.into_vec()
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

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn resize(&mut self, size: usize) {
        self.buf.resize(size);
    }

    /// Encoding of the innermost encapsulation.
    pub fn encoding(&self) -> EncodingVersion {
        self.encaps.encoding
    }

    /// Exchange contents with another stream.
    pub fn swap(&mut self, other: &mut OutputStream) {
        std::mem::swap(self, other);
    }

    /// Drop all data and encapsulation state.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.encaps = WriteEncaps::new(0, self.encoding, self.format);
        self.parents.clear();
    }

    pub(crate) fn strategy(&self) -> Strategy {
        Strategy::for_encoding(self.encaps.encoding)
    }

    pub(crate) fn current_format(&self) -> FormatType {
        self.encaps.format.or(self.format)
    }

    // ========================================================================
    // Encapsulations
    // ========================================================================

    /// Open an encapsulation with the stream's encoding and format.
    pub fn start_encapsulation(&mut self) {
        let encoding = self.encaps.encoding;
        self.start_encapsulation_with(encoding, FormatType::Default);
    }

    pub fn start_encapsulation_with(&mut self, encoding: EncodingVersion, format: FormatType) {
        let frame = WriteEncaps::new(self.buf.position(), encoding, format.or(self.format));
        let parent = std::mem::replace(&mut self.encaps, frame);
        self.parents.push(parent);
        self.write_i32(0);
        self.write_encoding(encoding);
    }

    /// Close the innermost encapsulation, patching its size.
    pub fn end_encapsulation(&mut self) -> Result<()> {
        let parent = self
            .parents
            .pop()
            .ok_or_else(|| Error::encapsulation("no encapsulation to end"))?;
        let frame = std::mem::replace(&mut self.encaps, parent);
        let sz = self.buf.position() - frame.start;
        self.rewrite_i32(sz as i32, frame.start)
    }

    pub fn write_empty_encapsulation(&mut self, encoding: EncodingVersion) -> Result<()> {
        check_supported_encoding(encoding)?;
        self.write_i32(6);
        self.write_encoding(encoding);
        Ok(())
    }

    /// Append an already-marshaled encapsulation.
    pub fn write_encapsulation(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < 6 {
            return Err(Error::encapsulation("encapsulation shorter than 6 bytes"));
        }
        self.write_blob(bytes);
        Ok(())
    }

    pub fn write_encoding(&mut self, encoding: EncodingVersion) {
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
    }

    /// Reserve an i32 size placeholder, returning its position.
    pub fn start_size(&mut self) -> usize {
        let pos = self.buf.position();
        self.write_i32(0);
        pos
    }

    /// Patch the placeholder at `pos` with the number of bytes written since.
    pub fn end_size(&mut self, pos: usize) -> Result<()> {
        let sz = self.buf.position() - pos - 4;
        self.rewrite_i32(sz as i32, pos)
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_bool(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    pub fn rewrite_i32(&mut self, v: i32, pos: usize) -> Result<()> {
        self.buf.put_i32_at(pos, v).map_err(|e| Error::marshal(e.to_string()))
    }

    pub fn rewrite_u8(&mut self, v: u8, pos: usize) -> Result<()> {
        self.buf.put_u8_at(pos, v).map_err(|e| Error::marshal(e.to_string()))
    }

    /// Size: one byte up to 254, else `0xFF` followed by an i32.
    pub fn write_size(&mut self, v: usize) {
        if v > 254 {
            self.buf.put_u8(255);
            self.buf.put_i32(v as i32);
        } else {
            self.buf.put_u8(v as u8);
        }
    }

    pub fn write_string(&mut self, v: &str) {
        self.write_size(v.len());
        self.buf.put_slice(v.as_bytes());
    }

    /// Enumerator. Under 1.0 the width depends on the largest enumerator.
    pub fn write_enum(&mut self, v: i32, max_value: i32) {
        if self.encaps.encoding.is_1_0() {
            if max_value < 127 {
                self.write_u8(v as u8);
            } else if max_value < 32767 {
                self.write_i16(v as i16);
            } else {
                self.write_i32(v);
            }
        } else {
            self.write_size(v as usize);
        }
    }

    // ========================================================================
    // Sequences
    // ========================================================================

    pub fn write_byte_seq(&mut self, v: &[u8]) {
        self.write_size(v.len());
        self.buf.put_slice(v);
    }

    pub fn write_bool_seq(&mut self, v: &[bool]) {
        self.write_size(v.len());
        for b in v {
            self.buf.put_bool(*b);
        }
    }

    pub fn write_i16_seq(&mut self, v: &[i16]) {
        self.write_size(v.len());
        for x in v {
            self.buf.put_i16(*x);
        }
    }

    pub fn write_i32_seq(&mut self, v: &[i32]) {
        self.write_size(v.len());
        for x in v {
            self.buf.put_i32(*x);
        }
    }

    pub fn write_i64_seq(&mut self, v: &[i64]) {
        self.write_size(v.len());
        for x in v {
            self.buf.put_i64(*x);
        }
    }

    pub fn write_f32_seq(&mut self, v: &[f32]) {
        self.write_size(v.len());
        for x in v {
            self.buf.put_f32(*x);
        }
    }

    pub fn write_f64_seq(&mut self, v: &[f64]) {
        self.write_size(v.len());
        for x in v {
            self.buf.put_f64(*x);
        }
    }

    pub fn write_string_seq<S: AsRef<str>>(&mut self, v: &[S]) {
        self.write_size(v.len());
        for s in v {
            self.write_string(s.as_ref());
        }
    }

    pub fn write_identity(&mut self, id: &Identity) {
        self.write_string(&id.name);
        self.write_string(&id.category);
    }

    pub fn write_context(&mut self, ctx: &Context) {
        self.write_size(ctx.len());
        for (k, v) in ctx {
            self.write_string(k);
            self.write_string(v);
        }
    }

    // ========================================================================
    // Tagged members
    // ========================================================================

    /// Write a tag header if the encoding supports tagged members.
    ///
    /// Returns false under 1.0, in which case the member must be omitted.
    pub fn write_optional(&mut self, tag: u32, format: OptionalFormat) -> bool {
        if self.encaps.encoding.is_1_0() {
            return false;
        }
        self.write_opt_impl(tag, format);
        self.mark_optional_members();
        true
    }

    pub(crate) fn write_opt_impl(&mut self, tag: u32, format: OptionalFormat) {
        let mut v = format as u8;
        if tag < 30 {
            v |= (tag as u8) << 3;
            self.write_u8(v);
        } else {
            v |= 0xF0;
            self.write_u8(v);
            self.write_size(tag as usize);
        }
    }

    pub fn write_optional_u8(&mut self, tag: u32, v: Option<u8>) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::F1) {
                self.write_u8(v);
            }
        }
    }

    pub fn write_optional_bool(&mut self, tag: u32, v: Option<bool>) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::F1) {
                self.write_bool(v);
            }
        }
    }

    pub fn write_optional_i16(&mut self, tag: u32, v: Option<i16>) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::F2) {
                self.write_i16(v);
            }
        }
    }

    pub fn write_optional_i32(&mut self, tag: u32, v: Option<i32>) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::F4) {
                self.write_i32(v);
            }
        }
    }

    pub fn write_optional_i64(&mut self, tag: u32, v: Option<i64>) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::F8) {
                self.write_i64(v);
            }
        }
    }

    pub fn write_optional_f32(&mut self, tag: u32, v: Option<f32>) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::F4) {
                self.write_f32(v);
            }
        }
    }

    pub fn write_optional_f64(&mut self, tag: u32, v: Option<f64>) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::F8) {
                self.write_f64(v);
            }
        }
    }

    pub fn write_optional_string(&mut self, tag: u32, v: Option<&str>) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::VSize) {
                self.write_string(v);
            }
        }
    }

    pub fn write_optional_enum(&mut self, tag: u32, v: Option<i32>, max_value: i32) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::Size) {
                self.write_enum(v, max_value);
            }
        }
    }

    /// Byte sequence as a VSize member.
    pub fn write_optional_byte_seq(&mut self, tag: u32, v: Option<&[u8]>) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::VSize) {
                self.write_byte_seq(v);
            }
        }
    }

    /// Fixed-size element sequence as a VSize member: the element count
    /// size is preceded by the total byte length.
    pub fn write_optional_i32_seq(&mut self, tag: u32, v: Option<&[i32]>) {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::VSize) {
                let len = v.len();
                let count_size = if len > 254 { 5 } else { 1 };
                self.write_size(if len == 0 { 1 } else { len * 4 + count_size });
                self.write_i32_seq(v);
            }
        }
    }

    /// Variable-size member written through `f` inside an FSize frame.
    pub fn write_optional_fsize<F>(&mut self, tag: u32, f: F) -> Result<()>
    where
        F: FnOnce(&mut OutputStream) -> Result<()>,
    {
        if self.write_optional(tag, OptionalFormat::FSize) {
            let pos = self.start_size();
            f(self)?;
            self.end_size(pos)?;
        }
        Ok(())
    }

    /// Class-typed tagged member.
    pub fn write_optional_value(&mut self, tag: u32, v: Option<&ValuePtr>) -> Result<()> {
        if let Some(v) = v {
            if self.write_optional(tag, OptionalFormat::Class) {
                self.write_value(Some(v))?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Classes and exceptions
    // ========================================================================

    /// Write a class instance reference (null for `None`).
    pub fn write_value(&mut self, v: Option<&ValuePtr>) -> Result<()> {
        match self.strategy() {
            Strategy::V1_0 => {
                self.write_value_10(v);
                Ok(())
            }
            Strategy::V1_1 => self.write_value_11(v),
        }
    }

    /// Flush instances queued under 1.0. A no-op under 1.1.
    pub fn write_pending_values(&mut self) -> Result<()> {
        match self.strategy() {
            Strategy::V1_0 => self.write_pending_values_10(),
            Strategy::V1_1 => Ok(()),
        }
    }

    pub fn write_exception(&mut self, ex: &dyn UserException) -> Result<()> {
        match self.strategy() {
            Strategy::V1_0 => self.write_exception_10(ex),
            Strategy::V1_1 => super::exception::marshal_exception(ex, self),
        }
    }

    pub fn start_value(&mut self, sliced: Option<&SlicedData>) -> Result<()> {
        self.start_instance(super::SliceType::Value, sliced)
    }

    pub fn end_value(&mut self) -> Result<()> {
        self.end_instance()
    }

    pub fn start_exception(&mut self, sliced: Option<&SlicedData>) -> Result<()> {
        self.start_instance(super::SliceType::Exception, sliced)
    }

    pub fn end_exception(&mut self) -> Result<()> {
        self.end_instance()
    }

    /// Open a slice. `compact_id` is -1 when the type has no compact id.
    pub fn start_slice(&mut self, type_id: &str, compact_id: i32, last: bool) -> Result<()> {
        match self.strategy() {
            Strategy::V1_0 => {
                self.start_slice_10(type_id);
                Ok(())
            }
            Strategy::V1_1 => self.start_slice_11(type_id, compact_id, last),
        }
    }

    pub fn end_slice(&mut self) -> Result<()> {
        match self.strategy() {
            Strategy::V1_0 => self.end_slice_10(),
            Strategy::V1_1 => self.end_slice_11(),
        }
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("buf", &self.buf)
            .field("encoding", &self.encaps.encoding)
            .field("depth", &self.parents.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ENCODING_1_0, ENCODING_1_1};

    #[test]
    fn test_size_encoding() {
        let mut os = OutputStream::default();
        os.write_size(254);
        os.write_size(255);
        assert_eq!(os.as_bytes(), &[254, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn test_encapsulation_size_patched() {
        let mut os = OutputStream::default();
        os.start_encapsulation_with(ENCODING_1_1, FormatType::Default);
        os.write_i32(7);
        os.end_encapsulation().unwrap();
        assert_eq!(os.as_bytes(), &[10, 0, 0, 0, 1, 1, 7, 0, 0, 0]);
        assert!(os.end_encapsulation().is_err());
    }

    #[test]
    fn test_empty_encapsulation() {
        let mut os = OutputStream::default();
        os.write_empty_encapsulation(ENCODING_1_0).unwrap();
        assert_eq!(os.as_bytes(), &[6, 0, 0, 0, 1, 0]);
        assert!(os.write_encapsulation(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_tag_header_layout() {
        let mut os = OutputStream::new(ENCODING_1_1);
        assert!(os.write_optional(2, OptionalFormat::F4));
        assert!(os.write_optional(30, OptionalFormat::VSize));
        assert_eq!(os.as_bytes(), &[(2 << 3) | 2, 0xF5, 30]);
    }

    #[test]
    fn test_optional_unsupported_under_1_0() {
        let mut os = OutputStream::new(ENCODING_1_0);
        assert!(!os.write_optional(1, OptionalFormat::F1));
        os.write_optional_i32(1, Some(5));
        assert!(os.is_empty());
    }

    #[test]
    fn test_enum_width_by_encoding() {
        let mut os = OutputStream::new(ENCODING_1_0);
        os.write_enum(3, 10);
        os.write_enum(3, 200);
        os.write_enum(3, 40000);
        assert_eq!(os.size(), 1 + 2 + 4);

        let mut os = OutputStream::new(ENCODING_1_1);
        os.write_enum(3, 40000);
        assert_eq!(os.as_bytes(), &[3]);
    }

    #[test]
    fn test_fsize_member() {
        let mut os = OutputStream::new(ENCODING_1_1);
        os.write_optional_fsize(1, |os| {
            os.write_string("ab");
            Ok(())
        })
        .unwrap();
        assert_eq!(os.as_bytes(), &[(1 << 3) | 6, 3, 0, 0, 0, 2, b'a', b'b']);
    }
}
