// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Encapsulation codec.
//!
//! [`OutputStream`] and [`InputStream`] marshal primitives, strings,
//! sequences, tagged optionals, class graphs and user exceptions. Values
//! and exceptions are written inside *encapsulations*, each recording its
//! own encoding version; class and exception encoding is delegated to a
//! per-encapsulation strategy selected once when the first instance is
//! marshaled:
//!
//! ```text
//!               +--------------------+
//!  OutputStream |  encaps (current)  |--- EncoderState { V1_0 | V1_1 }
//!               |  parents: [encaps] |
//!               +--------------------+
//!
//!   1.0: instances as negative ids, pending instances flushed after the
//!        top-level data, "::Ice::Object" slice terminates an instance.
//!   1.1: instances inline (compact) or via slice-local indirection tables
//!        (sliced), flags byte per slice, explicit last-slice flag.
//! ```
//!
//! Slices of unknown types are skipped with their declared size and kept
//! in a [`SlicedData`] so they can be written back unchanged.

mod decoder;
mod encoder;
pub mod exception;
pub mod input;
pub mod output;
pub mod registry;
pub mod value;

pub use exception::UserException;
pub use input::InputStream;
pub use output::OutputStream;
pub use registry::{ExceptionFactory, TypeRegistry, ValueFactory};
pub use value::{
    value_ptr, with_value, PatchCallback, SliceInfo, SlicedData, UnknownSlicedValue, Value,
    ValuePtr, ValueSlot,
};

/// Type id of the root of every class hierarchy.
///
/// Under 1.0 its empty slice terminates an instance; under 1.1 a value
/// factory registered for it gets a last chance to preserve an instance of
/// an unknown type.
pub const BASE_VALUE_TYPE_ID: &str = "::Ice::Object";

/// Marks the end of tagged members inside a slice or encapsulation.
pub const OPTIONAL_END_MARKER: u8 = 0xFF;

/// Class and exception encoding format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FormatType {
    /// Use the stream (or configuration) default.
    #[default]
    Default,
    /// No slice sizes; unknown derived types cannot be skipped.
    Compact,
    /// Slice sizes and indirection tables; unknown slices can be preserved.
    Sliced,
}

impl FormatType {
    pub(crate) fn or(self, fallback: FormatType) -> FormatType {
        match self {
            FormatType::Default => fallback,
            other => other,
        }
    }
}

/// Wire format of a tagged member, stored in the low 3 bits of the tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OptionalFormat {
    F1 = 0,
    F2 = 1,
    F4 = 2,
    F8 = 3,
    Size = 4,
    VSize = 5,
    FSize = 6,
    Class = 7,
}

impl OptionalFormat {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => OptionalFormat::F1,
            1 => OptionalFormat::F2,
            2 => OptionalFormat::F4,
            3 => OptionalFormat::F8,
            4 => OptionalFormat::Size,
            5 => OptionalFormat::VSize,
            6 => OptionalFormat::FSize,
            _ => OptionalFormat::Class,
        }
    }
}

/// Slice flags (1.1).
pub(crate) mod flags {
    pub const HAS_TYPE_ID_STRING: u8 = 1 << 0;
    pub const HAS_TYPE_ID_INDEX: u8 = 1 << 1;
    pub const HAS_TYPE_ID_COMPACT: u8 = (1 << 0) | (1 << 1);
    pub const HAS_OPTIONAL_MEMBERS: u8 = 1 << 2;
    pub const HAS_INDIRECTION_TABLE: u8 = 1 << 3;
    pub const HAS_SLICE_SIZE: u8 = 1 << 4;
    pub const IS_LAST_SLICE: u8 = 1 << 5;
}

/// Kind of instance whose slices are being encoded or decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceType {
    None,
    Value,
    Exception,
}

/// Strategy chosen from the encapsulation encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strategy {
    V1_0,
    V1_1,
}

impl Strategy {
    pub(crate) fn for_encoding(encoding: crate::protocol::EncodingVersion) -> Self {
        if encoding.is_1_0() {
            Strategy::V1_0
        } else {
            Strategy::V1_1
        }
    }
}

/// Strip the leading `::` scope of a type id for exception reporting.
pub(crate) fn unscoped(type_id: &str) -> String {
    type_id.strip_prefix("::").unwrap_or(type_id).to_string()
}
