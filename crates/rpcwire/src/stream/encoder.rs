// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Class and exception encoding for the 1.0 and 1.1 encodings.
//!
//! The encoder state lives in the innermost write encapsulation and is
//! created on first use. It is only borrowed for short bookkeeping steps,
//! never across calls into `Value::write_impl`, so nested instances can be
//! marshaled re-entrantly.

use std::collections::HashMap;

use super::exception::{marshal_exception, UserException};
use super::output::OutputStream;
use super::value::{marshal_value, value_key, SlicedData, ValuePtr};
use super::{flags, FormatType, SliceType, Strategy, BASE_VALUE_TYPE_ID, OPTIONAL_END_MARKER};
use crate::error::{Error, Result};

/// Per-instance slice bookkeeping (1.1).
struct InstanceFrame {
    slice_type: SliceType,
    first_slice: bool,
    slice_flags: u8,
    slice_flags_pos: usize,
    write_slice: usize,
    indirection_table: Vec<ValuePtr>,
    indirection_map: HashMap<usize, usize>,
}

impl InstanceFrame {
    fn new(slice_type: SliceType) -> Self {
        Self {
            slice_type,
            first_slice: true,
            slice_flags: 0,
            slice_flags_pos: 0,
            write_slice: 0,
            indirection_table: Vec::new(),
            indirection_map: HashMap::new(),
        }
    }
}

pub(crate) struct EncoderState {
    strategy: Strategy,
    type_ids: HashMap<String, usize>,
    type_id_index: usize,
    /// Instances already written, with their id. Holding the pointer keeps
    /// the identity key valid for the lifetime of the encapsulation.
    marshaled: HashMap<usize, (i32, ValuePtr)>,
    value_id_index: i32,

    // 1.0
    slice_type: SliceType,
    write_slice: usize,
    to_be_marshaled: Vec<(ValuePtr, i32)>,
    to_be_marshaled_ids: HashMap<usize, i32>,

    // 1.1
    instances: Vec<InstanceFrame>,
}

impl EncoderState {
    fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            type_ids: HashMap::new(),
            type_id_index: 0,
            marshaled: HashMap::new(),
            value_id_index: match strategy {
                Strategy::V1_0 => 0,
                Strategy::V1_1 => 1,
            },
            slice_type: SliceType::None,
            write_slice: 0,
            to_be_marshaled: Vec::new(),
            to_be_marshaled_ids: HashMap::new(),
            instances: Vec::new(),
        }
    }

    /// Index of an already-seen type id; `None` registers it.
    fn register_type_id(&mut self, type_id: &str) -> Option<usize> {
        if let Some(index) = self.type_ids.get(type_id) {
            return Some(*index);
        }
        self.type_id_index += 1;
        self.type_ids.insert(type_id.to_string(), self.type_id_index);
        None
    }

    fn register_value_10(&mut self, v: &ValuePtr) -> i32 {
        let key = value_key(v);
        if let Some(index) = self.to_be_marshaled_ids.get(&key) {
            return *index;
        }
        if let Some((index, _)) = self.marshaled.get(&key) {
            return *index;
        }
        self.value_id_index += 1;
        self.to_be_marshaled.push((v.clone(), self.value_id_index));
        self.to_be_marshaled_ids.insert(key, self.value_id_index);
        self.value_id_index
    }

    fn current(&mut self) -> Result<&mut InstanceFrame> {
        self.instances
            .last_mut()
            .ok_or_else(|| Error::marshal("slice written outside of a value or exception"))
    }
}

impl OutputStream {
    fn encoder(&mut self) -> &mut EncoderState {
        let strategy = self.strategy();
        self.encaps
            .encoder
            .get_or_insert_with(|| EncoderState::new(strategy))
    }

    pub(crate) fn start_instance(
        &mut self,
        slice_type: SliceType,
        sliced: Option<&SlicedData>,
    ) -> Result<()> {
        let enc = self.encoder();
        match enc.strategy {
            Strategy::V1_0 => {
                enc.slice_type = slice_type;
                Ok(())
            }
            Strategy::V1_1 => {
                enc.instances.push(InstanceFrame::new(slice_type));
                match sliced {
                    Some(sliced) => self.write_sliced_data(sliced),
                    None => Ok(()),
                }
            }
        }
    }

    pub(crate) fn end_instance(&mut self) -> Result<()> {
        let enc = self.encoder();
        match enc.strategy {
            Strategy::V1_0 => {
                if enc.slice_type == SliceType::Value {
                    // Trailing base slice with an empty facet map.
                    self.start_slice_10(BASE_VALUE_TYPE_ID);
                    self.write_size(0);
                    self.end_slice_10()?;
                }
                self.encoder().slice_type = SliceType::None;
            }
            Strategy::V1_1 => {
                enc.instances.pop();
            }
        }
        Ok(())
    }

    pub(crate) fn mark_optional_members(&mut self) {
        if let Some(enc) = self.encaps.encoder.as_mut() {
            if let Some(frame) = enc.instances.last_mut() {
                frame.slice_flags |= flags::HAS_OPTIONAL_MEMBERS;
            }
        }
    }

    // ========================================================================
    // 1.0
    // ========================================================================

    pub(crate) fn write_value_10(&mut self, v: Option<&ValuePtr>) {
        match v {
            Some(v) => {
                let index = self.encoder().register_value_10(v);
                self.write_i32(-index);
            }
            None => self.write_i32(0),
        }
    }

    pub(crate) fn write_exception_10(&mut self, ex: &dyn UserException) -> Result<()> {
        let uses_classes = ex.uses_classes();
        self.write_bool(uses_classes);
        marshal_exception(ex, self)?;
        if uses_classes {
            self.write_pending_values_10()?;
        }
        Ok(())
    }

    pub(crate) fn start_slice_10(&mut self, type_id: &str) {
        let enc = self.encoder();
        if enc.slice_type == SliceType::Value {
            match enc.register_type_id(type_id) {
                None => {
                    self.write_bool(false);
                    self.write_string(type_id);
                }
                Some(index) => {
                    self.write_bool(true);
                    self.write_size(index);
                }
            }
        } else {
            self.write_string(type_id);
        }
        self.write_i32(0);
        let pos = self.pos();
        self.encoder().write_slice = pos;
    }

    pub(crate) fn end_slice_10(&mut self) -> Result<()> {
        let write_slice = self.encoder().write_slice;
        let sz = self.pos() - write_slice + 4;
        self.rewrite_i32(sz as i32, write_slice - 4)
    }

    pub(crate) fn write_pending_values_10(&mut self) -> Result<()> {
        loop {
            let pending = {
                let enc = self.encoder();
                if enc.to_be_marshaled.is_empty() {
                    break;
                }
                // Pending instances count as marshaled from here on, so
                // references found while writing them are not queued again.
                let pending = std::mem::take(&mut enc.to_be_marshaled);
                enc.to_be_marshaled_ids.clear();
                for (v, index) in &pending {
                    enc.marshaled.insert(value_key(v), (*index, v.clone()));
                }
                pending
            };
            self.write_size(pending.len());
            for (v, index) in pending {
                self.write_i32(index);
                let mut guard = v.lock();
                guard.pre_marshal();
                marshal_value(&*guard, self)?;
            }
        }
        self.write_size(0);
        Ok(())
    }

    // ========================================================================
    // 1.1
    // ========================================================================

    pub(crate) fn write_value_11(&mut self, v: Option<&ValuePtr>) -> Result<()> {
        let Some(v) = v else {
            self.write_size(0);
            return Ok(());
        };
        let sliced = self.current_format() == FormatType::Sliced;
        let enc = self.encoder();
        let indirect = match enc.instances.last_mut() {
            // Inside a sliced-format slice: reference through the slice's
            // indirection table (1-based).
            Some(frame) if sliced => {
                let key = value_key(v);
                Some(match frame.indirection_map.get(&key) {
                    Some(index) => *index,
                    None => {
                        frame.indirection_table.push(v.clone());
                        let index = frame.indirection_table.len();
                        frame.indirection_map.insert(key, index);
                        index
                    }
                })
            }
            _ => None,
        };
        match indirect {
            Some(index) => {
                self.write_size(index);
                Ok(())
            }
            None => self.write_instance_11(v),
        }
    }

    fn write_instance_11(&mut self, v: &ValuePtr) -> Result<()> {
        let key = value_key(v);
        let existing = self.encoder().marshaled.get(&key).map(|(index, _)| *index);
        if let Some(index) = existing {
            self.write_size(index as usize);
            return Ok(());
        }
        let enc = self.encoder();
        enc.value_id_index += 1;
        let index = enc.value_id_index;
        enc.marshaled.insert(key, (index, v.clone()));

        let mut guard = v.lock();
        guard.pre_marshal();
        self.write_size(1);
        marshal_value(&*guard, self)
    }

    pub(crate) fn start_slice_11(&mut self, type_id: &str, compact_id: i32, last: bool) -> Result<()> {
        let format = self.current_format();
        let flags_pos = self.pos();
        let (slice_type, first_slice) = {
            let frame = self.encoder().current()?;
            frame.slice_flags_pos = flags_pos;
            frame.slice_flags = 0;
            if format == FormatType::Sliced {
                frame.slice_flags |= flags::HAS_SLICE_SIZE;
            }
            if last {
                frame.slice_flags |= flags::IS_LAST_SLICE;
            }
            (frame.slice_type, frame.first_slice)
        };

        // Flags placeholder, rewritten by end_slice.
        self.write_u8(0);

        let mut type_flags = 0;
        if slice_type == SliceType::Value {
            // Compact format only encodes the type id of the first slice.
            if format == FormatType::Sliced || first_slice {
                if compact_id >= 0 {
                    type_flags = flags::HAS_TYPE_ID_COMPACT;
                    self.write_size(compact_id as usize);
                } else {
                    match self.encoder().register_type_id(type_id) {
                        None => {
                            type_flags = flags::HAS_TYPE_ID_STRING;
                            self.write_string(type_id);
                        }
                        Some(index) => {
                            type_flags = flags::HAS_TYPE_ID_INDEX;
                            self.write_size(index);
                        }
                    }
                }
            }
        } else {
            self.write_string(type_id);
        }

        let has_size = {
            let frame = self.encoder().current()?;
            frame.slice_flags |= type_flags;
            frame.slice_flags & flags::HAS_SLICE_SIZE != 0
        };
        if has_size {
            self.write_i32(0);
        }
        let pos = self.pos();
        let frame = self.encoder().current()?;
        frame.write_slice = pos;
        frame.first_slice = false;
        Ok(())
    }

    pub(crate) fn end_slice_11(&mut self) -> Result<()> {
        let (slice_flags, write_slice) = {
            let frame = self.encoder().current()?;
            (frame.slice_flags, frame.write_slice)
        };

        // Tagged members precede the indirection table and count in the
        // slice size.
        if slice_flags & flags::HAS_OPTIONAL_MEMBERS != 0 {
            self.write_u8(OPTIONAL_END_MARKER);
        }

        if slice_flags & flags::HAS_SLICE_SIZE != 0 {
            let sz = self.pos() - write_slice + 4;
            self.rewrite_i32(sz as i32, write_slice - 4)?;
        }

        let table = {
            let frame = self.encoder().current()?;
            frame.indirection_map.clear();
            let table = std::mem::take(&mut frame.indirection_table);
            if !table.is_empty() {
                frame.slice_flags |= flags::HAS_INDIRECTION_TABLE;
            }
            table
        };
        if !table.is_empty() {
            self.write_size(table.len());
            for v in &table {
                self.write_instance_11(v)?;
            }
        }

        let (slice_flags, flags_pos) = {
            let frame = self.encoder().current()?;
            (frame.slice_flags, frame.slice_flags_pos)
        };
        self.rewrite_u8(slice_flags, flags_pos)
    }

    /// Replay preserved slices ahead of the instance's own slices. Only the
    /// sliced format carries them; compact format slices the instance down
    /// to its most-derived known type.
    fn write_sliced_data(&mut self, sliced: &SlicedData) -> Result<()> {
        if self.current_format() != FormatType::Sliced {
            return Ok(());
        }
        for info in &sliced.slices {
            self.start_slice_11(&info.type_id, info.compact_id, info.is_last_slice)?;
            self.write_blob(&info.bytes);
            let frame = self.encoder().current()?;
            if info.has_optional_members {
                frame.slice_flags |= flags::HAS_OPTIONAL_MEMBERS;
            }
            for slot in &info.instances {
                if let Some(v) = slot.get() {
                    frame.indirection_table.push(v);
                }
            }
            self.end_slice_11()?;
        }
        Ok(())
    }
}
