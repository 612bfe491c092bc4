// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Class instances, shared references and preserved slices.
//!
//! Class graphs may be cyclic, so instances are shared as [`ValuePtr`]
//! (`Arc<Mutex<dyn Value>>`). A class-typed member is a [`ValueSlot`]: the
//! decoder fills it through a patch callback, possibly after the member's
//! owner has finished reading, once the referenced instance is available.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::input::InputStream;
use super::output::OutputStream;
use crate::error::Result;

/// Shared, mutable class instance.
pub type ValuePtr = Arc<Mutex<dyn Value>>;

/// Callback invoked by the decoder once the referenced instance is known.
/// `None` is delivered for null references.
pub type PatchCallback = Box<dyn FnOnce(Option<ValuePtr>) + Send>;

/// Wrap a concrete value into a [`ValuePtr`].
pub fn value_ptr<V: Value>(value: V) -> ValuePtr {
    Arc::new(Mutex::new(value))
}

/// A class instance that knows how to marshal its own slices.
///
/// `write_impl`/`read_impl` handle every slice the type knows, most-derived
/// first, each bracketed by `start_slice`/`end_slice`. Slice framing of the
/// instance itself (`start_value`/`end_value`) is done by the streams.
pub trait Value: Any + Send {
    /// Type id of the most-derived type of this instance.
    fn class_id(&self) -> &str;

    fn write_impl(&self, os: &mut OutputStream) -> Result<()>;

    fn read_impl(&mut self, is: &mut InputStream) -> Result<()>;

    /// Called before the instance is marshaled.
    fn pre_marshal(&mut self) {}

    /// Called once the whole graph the instance belongs to is unmarshaled.
    fn post_unmarshal(&mut self) {}

    /// Slices of unknown derived types preserved when this instance was read.
    fn sliced_data(&self) -> Option<&SlicedData> {
        None
    }

    /// Storage for preserved slices. Types returning `None` drop unknown
    /// slices instead of preserving them.
    fn sliced_data_mut(&mut self) -> Option<&mut Option<SlicedData>> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Run `f` on the concrete type behind a [`ValuePtr`], if it matches.
pub fn with_value<V: Value, R>(ptr: &ValuePtr, f: impl FnOnce(&V) -> R) -> Option<R> {
    let guard = ptr.lock();
    guard.as_any().downcast_ref::<V>().map(f)
}

/// Identity key of a shared instance.
pub(crate) fn value_key(ptr: &ValuePtr) -> usize {
    Arc::as_ptr(ptr) as *const () as usize
}

pub(crate) fn marshal_value(value: &dyn Value, os: &mut OutputStream) -> Result<()> {
    os.start_value(value.sliced_data())?;
    value.write_impl(os)?;
    os.end_value()
}

pub(crate) fn unmarshal_value(value: &mut dyn Value, is: &mut InputStream) -> Result<()> {
    is.start_value()?;
    value.read_impl(is)?;
    let preserve = value.sliced_data_mut().is_some();
    let sliced = is.end_value(preserve)?;
    if let Some(slot) = value.sliced_data_mut() {
        *slot = sliced;
    }
    Ok(())
}

// ============================================================================
// ValueSlot
// ============================================================================

/// Class-typed member: a shared cell the decoder patches once the
/// referenced instance is unmarshaled.
#[derive(Clone, Default)]
pub struct ValueSlot(Arc<Mutex<Option<ValuePtr>>>);

impl ValueSlot {
    pub fn new(value: Option<ValuePtr>) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub fn get(&self) -> Option<ValuePtr> {
        self.0.lock().clone()
    }

    pub fn set(&self, value: Option<ValuePtr>) {
        *self.0.lock() = value;
    }

    pub fn is_null(&self) -> bool {
        self.0.lock().is_none()
    }

    /// Patch callback storing the decoded instance in this slot.
    pub fn patcher(&self) -> PatchCallback {
        let slot = self.clone();
        Box::new(move |value| slot.set(value))
    }

    /// True when the slot holds exactly `other`.
    pub fn points_to(&self, other: &ValuePtr) -> bool {
        self.get().is_some_and(|v| Arc::ptr_eq(&v, other))
    }
}

impl fmt::Debug for ValueSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(v) => write!(f, "ValueSlot({:#x})", value_key(&v)),
            None => write!(f, "ValueSlot(null)"),
        }
    }
}

// ============================================================================
// Preserved slices
// ============================================================================

/// One preserved slice of an unknown type.
#[derive(Clone, Debug, Default)]
pub struct SliceInfo {
    /// Type id of the slice, empty when the slice carried a compact id.
    pub type_id: String,
    /// Compact id of the slice, -1 when none.
    pub compact_id: i32,
    /// Slice payload, excluding the tagged-member end marker.
    pub bytes: Vec<u8>,
    /// Instances referenced from the slice's indirection table.
    pub instances: Vec<ValueSlot>,
    pub has_optional_members: bool,
    pub is_last_slice: bool,
}

/// Slices of unknown derived types, most-derived first.
#[derive(Clone, Debug, Default)]
pub struct SlicedData {
    pub slices: Vec<SliceInfo>,
}

/// Instance of a type for which no slice is known locally.
///
/// Every slice is kept in the sliced data so the instance can be forwarded
/// unchanged.
#[derive(Debug, Default)]
pub struct UnknownSlicedValue {
    unknown_type_id: String,
    sliced: Option<SlicedData>,
}

impl UnknownSlicedValue {
    pub fn new(unknown_type_id: impl Into<String>) -> Self {
        Self {
            unknown_type_id: unknown_type_id.into(),
            sliced: None,
        }
    }

    pub fn unknown_type_id(&self) -> &str {
        &self.unknown_type_id
    }
}

impl Value for UnknownSlicedValue {
    fn class_id(&self) -> &str {
        &self.unknown_type_id
    }

    fn write_impl(&self, _os: &mut OutputStream) -> Result<()> {
        Ok(())
    }

    fn read_impl(&mut self, _is: &mut InputStream) -> Result<()> {
        Ok(())
    }

    fn sliced_data(&self) -> Option<&SlicedData> {
        self.sliced.as_ref()
    }

    fn sliced_data_mut(&mut self) -> Option<&mut Option<SlicedData>> {
        Some(&mut self.sliced)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_patcher_sets_value() {
        let slot = ValueSlot::default();
        assert!(slot.is_null());
        let v = value_ptr(UnknownSlicedValue::new("::X"));
        (slot.patcher())(Some(v.clone()));
        assert!(slot.points_to(&v));
        (slot.patcher())(None);
        assert!(slot.is_null());
    }

    #[test]
    fn test_with_value_downcast() {
        let v = value_ptr(UnknownSlicedValue::new("::Demo::Thing"));
        let id = with_value(&v, |u: &UnknownSlicedValue| u.unknown_type_id().to_string());
        assert_eq!(id.as_deref(), Some("::Demo::Thing"));
        assert_eq!(v.lock().class_id(), "::Demo::Thing");
    }

    #[test]
    fn test_value_key_identity() {
        let a = value_ptr(UnknownSlicedValue::new("::A"));
        let b = value_ptr(UnknownSlicedValue::new("::A"));
        assert_eq!(value_key(&a), value_key(&a.clone()));
        assert_ne!(value_key(&a), value_key(&b));
    }
}
