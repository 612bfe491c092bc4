// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Class and exception decoding for the 1.0 and 1.1 encodings.
//!
//! Instances referenced before they are read are resolved through patch
//! entries keyed by instance id. Once no patch is outstanding, every
//! instance read so far gets its `post_unmarshal` hook.

use std::collections::HashMap;

use super::exception::{unmarshal_exception, UserException};
use super::input::InputStream;
use super::value::{
    unmarshal_value, value_ptr, PatchCallback, SliceInfo, SlicedData, UnknownSlicedValue,
    ValuePtr, ValueSlot,
};
use super::{flags, unscoped, SliceType, Strategy, BASE_VALUE_TYPE_ID};
use crate::error::{Error, Result};

struct PatchEntry {
    cb: PatchCallback,
    class_graph_depth: usize,
}

/// Reference into the current slice's indirection table, resolved at
/// `end_slice`.
struct IndirectPatch {
    index: usize,
    cb: PatchCallback,
}

/// Per-instance read state (1.1).
struct InstanceFrame {
    slice_type: SliceType,
    skip_first_slice: bool,
    slices: Vec<SliceInfo>,
    indirection_tables: Vec<Option<Vec<i32>>>,
    slice_flags: u8,
    slice_size: i32,
    type_id: String,
    compact_id: i32,
    indirect_patches: Vec<IndirectPatch>,
}

impl InstanceFrame {
    fn new(slice_type: SliceType) -> Self {
        Self {
            slice_type,
            skip_first_slice: false,
            slices: Vec::new(),
            indirection_tables: Vec::new(),
            slice_flags: 0,
            slice_size: 0,
            type_id: String::new(),
            compact_id: -1,
            indirect_patches: Vec::new(),
        }
    }
}

pub(crate) struct DecoderState {
    strategy: Strategy,
    type_ids: HashMap<usize, String>,
    type_id_index: usize,
    unmarshaled: HashMap<i32, ValuePtr>,
    patch_map: HashMap<i32, Vec<PatchEntry>>,
    value_list: Vec<ValuePtr>,
    class_graph_depth: usize,
    compact_ids: HashMap<i32, String>,

    // 1.0
    slice_type: SliceType,
    skip_first_slice: bool,
    slice_size: i32,
    type_id: String,

    // 1.1
    value_id_index: i32,
    instances: Vec<InstanceFrame>,
}

impl DecoderState {
    fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            type_ids: HashMap::new(),
            type_id_index: 0,
            unmarshaled: HashMap::new(),
            patch_map: HashMap::new(),
            value_list: Vec::new(),
            class_graph_depth: 0,
            compact_ids: HashMap::new(),
            slice_type: SliceType::None,
            skip_first_slice: false,
            slice_size: 0,
            type_id: String::new(),
            value_id_index: 1,
            instances: Vec::new(),
        }
    }

    /// Tagged members are only readable at top level or inside a slice
    /// flagged as carrying them.
    pub(crate) fn accepts_optionals(&self) -> bool {
        match self.strategy {
            Strategy::V1_0 => false,
            Strategy::V1_1 => self
                .instances
                .last()
                .map_or(true, |f| f.slice_flags & flags::HAS_OPTIONAL_MEMBERS != 0),
        }
    }

    fn current(&mut self) -> Result<&mut InstanceFrame> {
        self.instances
            .last_mut()
            .ok_or_else(|| Error::marshal("no instance is being read"))
    }
}

impl InputStream {
    fn decoder(&mut self) -> &mut DecoderState {
        let strategy = self.strategy();
        self.encaps
            .decoder
            .get_or_insert_with(|| DecoderState::new(strategy))
    }

    fn read_type_id(&mut self, is_index: bool) -> Result<String> {
        if is_index {
            let index = self.read_size()?;
            return self
                .decoder()
                .type_ids
                .get(&index)
                .cloned()
                .ok_or_else(|| Error::UnmarshalOutOfBounds {
                    reason: format!("unknown type id index {}", index),
                });
        }
        let type_id = self.read_string()?;
        let dec = self.decoder();
        dec.type_id_index += 1;
        dec.type_ids.insert(dec.type_id_index, type_id.clone());
        Ok(type_id)
    }

    fn add_patch_entry(&mut self, index: i32, cb: PatchCallback) {
        let dec = self.decoder();
        if let Some(v) = dec.unmarshaled.get(&index) {
            cb(Some(v.clone()));
            return;
        }
        let class_graph_depth = dec.class_graph_depth;
        dec.patch_map.entry(index).or_default().push(PatchEntry {
            cb,
            class_graph_depth,
        });
    }

    /// Read the state of `v`, then resolve every reference waiting for it.
    fn unmarshal(&mut self, index: i32, v: ValuePtr) -> Result<()> {
        // Registered first so self-references resolve while reading.
        self.decoder().unmarshaled.insert(index, v.clone());

        {
            let mut guard = v.lock();
            unmarshal_value(&mut *guard, self)?;
        }

        if let Some(entries) = self.decoder().patch_map.remove(&index) {
            for entry in entries {
                (entry.cb)(Some(v.clone()));
            }
        }

        let dec = self.decoder();
        dec.value_list.push(v);
        if dec.patch_map.is_empty() {
            let ready = std::mem::take(&mut dec.value_list);
            for value in ready {
                value.lock().post_unmarshal();
            }
        }
        Ok(())
    }

    fn check_class_graph_depth(&mut self) -> Result<()> {
        let max = self.class_graph_depth_max;
        if self.decoder().class_graph_depth > max {
            return Err(Error::marshal("maximum class graph depth reached"));
        }
        Ok(())
    }

    fn trace_skip_slice(&self, slice_type: SliceType, type_id: &str) {
        if self.trace_slicing > 0 {
            let kind = match slice_type {
                SliceType::Exception => "exception",
                _ => "class",
            };
            log::debug!("[Slicing] unknown {} type `{}'", kind, type_id);
        }
    }

    pub(crate) fn start_instance_slices(&mut self, slice_type: SliceType) -> Result<()> {
        let dec = self.decoder();
        match dec.strategy {
            Strategy::V1_0 => {
                dec.slice_type = slice_type;
                dec.skip_first_slice = true;
            }
            Strategy::V1_1 => dec.current()?.skip_first_slice = true,
        }
        Ok(())
    }

    pub(crate) fn end_instance_slices(&mut self, preserve: bool) -> Result<Option<SlicedData>> {
        match self.decoder().strategy {
            Strategy::V1_0 => {
                if self.decoder().slice_type == SliceType::Value {
                    // Base object slice: an empty facet map.
                    self.start_slice_10()?;
                    if self.read_size()? != 0 {
                        return Err(Error::marshal("invalid Object slice"));
                    }
                }
                self.decoder().slice_type = SliceType::None;
                Ok(None)
            }
            Strategy::V1_1 => {
                let sliced = if preserve {
                    self.read_sliced_data()?
                } else {
                    None
                };
                self.decoder().instances.pop();
                Ok(sliced)
            }
        }
    }

    // ========================================================================
    // 1.0
    // ========================================================================

    pub(crate) fn read_value_10(&mut self, cb: PatchCallback) -> Result<()> {
        let index = self.read_i32()?;
        if index > 0 {
            return Err(Error::marshal("invalid object id"));
        }
        let index = index
            .checked_neg()
            .ok_or_else(|| Error::marshal("invalid object id"))?;
        if index == 0 {
            cb(None);
        } else {
            self.add_patch_entry(index, cb);
        }
        Ok(())
    }

    pub(crate) fn read_exception_10(&mut self) -> Result<Box<dyn UserException>> {
        let uses_classes = self.read_bool()?;
        {
            let dec = self.decoder();
            dec.slice_type = SliceType::Exception;
            dec.skip_first_slice = false;
        }
        self.start_slice_10()?;
        let most_derived = self.decoder().type_id.clone();

        loop {
            let type_id = self.decoder().type_id.clone();
            if let Some(mut ex) = self.registry.create_exception(&type_id) {
                unmarshal_exception(&mut *ex, self)?;
                if uses_classes {
                    self.read_pending_values_10()?;
                }
                return Ok(ex);
            }

            self.skip_slice_10()?;

            // 1.0 has no last-slice flag: the search ends when the
            // encapsulation runs out or the next header is unreadable.
            let unknown = Error::UnknownUserException {
                type_id: unscoped(&most_derived),
            };
            if self.pos() >= self.encaps_end() {
                return Err(unknown);
            }
            if self.start_slice_10().is_err() {
                return Err(unknown);
            }
        }
    }

    pub(crate) fn start_slice_10(&mut self) -> Result<String> {
        let dec = self.decoder();
        if dec.skip_first_slice {
            dec.skip_first_slice = false;
            return Ok(dec.type_id.clone());
        }
        let type_id = if dec.slice_type == SliceType::Value {
            let is_index = self.read_bool()?;
            self.read_type_id(is_index)?
        } else {
            self.read_string()?
        };
        let slice_size = self.read_i32()?;
        if slice_size < 4 {
            return Err(Error::marshal("invalid slice size"));
        }
        let dec = self.decoder();
        dec.type_id = type_id.clone();
        dec.slice_size = slice_size;
        Ok(type_id)
    }

    pub(crate) fn skip_slice_10(&mut self) -> Result<()> {
        let (slice_type, type_id, size) = {
            let dec = self.decoder();
            (dec.slice_type, dec.type_id.clone(), dec.slice_size)
        };
        self.trace_skip_slice(slice_type, &type_id);
        self.skip((size - 4) as usize)
    }

    pub(crate) fn read_pending_values_10(&mut self) -> Result<()> {
        loop {
            let count = self.read_size()?;
            for _ in 0..count {
                self.read_instance_10()?;
            }
            if count == 0 {
                break;
            }
        }
        if !self.decoder().patch_map.is_empty() {
            return Err(Error::marshal("index for class received, but no instance"));
        }
        Ok(())
    }

    fn read_instance_10(&mut self) -> Result<()> {
        let index = self.read_i32()?;
        if index <= 0 {
            return Err(Error::marshal("invalid object id"));
        }

        {
            let dec = self.decoder();
            dec.slice_type = SliceType::Value;
            dec.skip_first_slice = false;
        }
        self.start_slice_10()?;
        let most_derived = self.decoder().type_id.clone();

        let v = loop {
            let type_id = self.decoder().type_id.clone();
            // Reaching the root slice means no known type in the hierarchy.
            if type_id == BASE_VALUE_TYPE_ID {
                return Err(Error::no_value_factory("no value factory found", most_derived));
            }
            if let Some(v) = self.registry.create_value(&type_id) {
                break v;
            }
            if !self.slice_values {
                return Err(Error::no_value_factory(
                    "no value factory found and value slicing is disabled",
                    type_id,
                ));
            }
            self.skip_slice_10()?;
            self.start_slice_10()?;
        };

        let dec = self.decoder();
        let depth = dec
            .patch_map
            .get(&index)
            .and_then(|entries| entries.iter().map(|e| e.class_graph_depth).max())
            .unwrap_or(0);
        dec.class_graph_depth = depth + 1;
        self.check_class_graph_depth()?;

        self.unmarshal(index, v)
    }

    // ========================================================================
    // 1.1
    // ========================================================================

    pub(crate) fn read_value_11(&mut self, cb: PatchCallback) -> Result<()> {
        let index = self.read_size()? as i32;
        if index == 0 {
            cb(None);
            return Ok(());
        }
        let dec = self.decoder();
        if let Some(frame) = dec.instances.last_mut() {
            if frame.slice_flags & flags::HAS_INDIRECTION_TABLE != 0 {
                frame.indirect_patches.push(IndirectPatch {
                    index: (index - 1) as usize,
                    cb,
                });
                return Ok(());
            }
        }
        self.read_instance_11(index, Some(cb)).map(|_| ())
    }

    /// Read an instance, or register `cb` for an already-seen id. Returns
    /// the instance id.
    fn read_instance_11(&mut self, index: i32, cb: Option<PatchCallback>) -> Result<i32> {
        if index <= 0 {
            return Err(Error::marshal("invalid object id"));
        }
        if index > 1 {
            if let Some(cb) = cb {
                self.add_patch_entry(index, cb);
            }
            return Ok(index);
        }

        let index = {
            let dec = self.decoder();
            dec.instances.push(InstanceFrame::new(SliceType::Value));
            dec.value_id_index += 1;
            dec.value_id_index
        };

        self.start_slice_11()?;
        let mut most_derived: Option<String> = None;
        let v = loop {
            let type_id = self.resolve_slice_type_id()?;
            let most_derived = most_derived.get_or_insert_with(|| type_id.clone());

            if !type_id.is_empty() {
                if let Some(v) = self.registry.create_value(&type_id) {
                    break v;
                }
            }
            if !self.slice_values {
                return Err(Error::no_value_factory(
                    "no value factory found and value slicing is disabled",
                    type_id,
                ));
            }

            self.skip_slice_11()?;

            if self.decoder().current()?.slice_flags & flags::IS_LAST_SLICE != 0 {
                let most_derived = most_derived.clone();
                break self
                    .registry
                    .create_value(BASE_VALUE_TYPE_ID)
                    .unwrap_or_else(|| value_ptr(UnknownSlicedValue::new(most_derived)));
            }
            self.start_slice_11()?;
        };

        self.decoder().class_graph_depth += 1;
        self.check_class_graph_depth()?;
        self.unmarshal(index, v.clone())?;

        let dec = self.decoder();
        dec.class_graph_depth -= 1;
        if dec.instances.is_empty() && !dec.patch_map.is_empty() {
            return Err(Error::marshal("index for class received, but no instance"));
        }

        if let Some(cb) = cb {
            cb(Some(v));
        }
        Ok(index)
    }

    /// Type id of the current slice, resolving a compact id if needed.
    fn resolve_slice_type_id(&mut self) -> Result<String> {
        let (compact_id, type_id) = {
            let frame = self.decoder().current()?;
            (frame.compact_id, frame.type_id.clone())
        };
        if compact_id < 0 {
            return Ok(type_id);
        }
        if let Some(cached) = self.decoder().compact_ids.get(&compact_id) {
            let resolved = cached.clone();
            self.decoder().current()?.type_id = resolved.clone();
            return Ok(resolved);
        }
        let resolved = self
            .registry
            .resolve_compact_id(compact_id)
            .unwrap_or_default();
        let dec = self.decoder();
        if !resolved.is_empty() {
            dec.compact_ids.insert(compact_id, resolved.clone());
        }
        dec.current()?.type_id = resolved.clone();
        Ok(resolved)
    }

    pub(crate) fn read_exception_11(&mut self) -> Result<Box<dyn UserException>> {
        self.decoder()
            .instances
            .push(InstanceFrame::new(SliceType::Exception));
        self.start_slice_11()?;
        let most_derived = self.decoder().current()?.type_id.clone();

        loop {
            let type_id = self.decoder().current()?.type_id.clone();
            if let Some(mut ex) = self.registry.create_exception(&type_id) {
                unmarshal_exception(&mut *ex, self)?;
                return Ok(ex);
            }

            self.skip_slice_11()?;

            if self.decoder().current()?.slice_flags & flags::IS_LAST_SLICE != 0 {
                self.decoder().instances.pop();
                return Err(Error::UnknownUserException {
                    type_id: unscoped(&most_derived),
                });
            }
            self.start_slice_11()?;
        }
    }

    pub(crate) fn start_slice_11(&mut self) -> Result<String> {
        let slice_type = {
            let frame = self.decoder().current()?;
            if frame.skip_first_slice {
                frame.skip_first_slice = false;
                return Ok(frame.type_id.clone());
            }
            frame.slice_type
        };

        let slice_flags = self.read_u8()?;
        let (type_id, compact_id) = if slice_type == SliceType::Value {
            if slice_flags & flags::HAS_TYPE_ID_COMPACT == flags::HAS_TYPE_ID_COMPACT {
                (String::new(), self.read_size()? as i32)
            } else if slice_flags & (flags::HAS_TYPE_ID_INDEX | flags::HAS_TYPE_ID_STRING) != 0 {
                let is_index = slice_flags & flags::HAS_TYPE_ID_INDEX != 0;
                (self.read_type_id(is_index)?, -1)
            } else {
                (String::new(), -1)
            }
        } else {
            (self.read_string()?, -1)
        };

        let slice_size = if slice_flags & flags::HAS_SLICE_SIZE != 0 {
            let size = self.read_i32()?;
            if size < 4 {
                return Err(Error::marshal("invalid slice size"));
            }
            size
        } else {
            0
        };

        let frame = self.decoder().current()?;
        frame.slice_flags = slice_flags;
        frame.type_id = type_id.clone();
        frame.compact_id = compact_id;
        frame.slice_size = slice_size;
        Ok(type_id)
    }

    pub(crate) fn end_slice_11(&mut self) -> Result<()> {
        let slice_flags = self.decoder().current()?.slice_flags;
        if slice_flags & flags::HAS_OPTIONAL_MEMBERS != 0 {
            self.skip_optionals()?;
        }
        if slice_flags & flags::HAS_INDIRECTION_TABLE == 0 {
            return Ok(());
        }

        let table = self.read_indirection_table()?;
        if table.is_empty() {
            return Err(Error::marshal("empty indirection table"));
        }
        let patches = std::mem::take(&mut self.decoder().current()?.indirect_patches);
        if patches.is_empty() && slice_flags & flags::HAS_OPTIONAL_MEMBERS == 0 {
            return Err(Error::marshal("no references to indirection table"));
        }
        for patch in patches {
            let id = *table
                .get(patch.index)
                .ok_or_else(|| Error::marshal("indirection out of range"))?;
            self.add_patch_entry(id, patch.cb);
        }
        Ok(())
    }

    fn read_indirection_table(&mut self) -> Result<Vec<i32>> {
        let len = self.read_and_check_seq_size(1)?;
        let mut table = Vec::with_capacity(len);
        for _ in 0..len {
            let index = self.read_size()? as i32;
            table.push(self.read_instance_11(index, None)?);
        }
        Ok(table)
    }

    pub(crate) fn skip_slice_11(&mut self) -> Result<()> {
        let (slice_type, slice_flags, slice_size, type_id, compact_id) = {
            let frame = self.decoder().current()?;
            (
                frame.slice_type,
                frame.slice_flags,
                frame.slice_size,
                frame.type_id.clone(),
                frame.compact_id,
            )
        };
        self.trace_skip_slice(slice_type, &type_id);

        let start = self.pos();
        if slice_flags & flags::HAS_SLICE_SIZE == 0 {
            return Err(match slice_type {
                SliceType::Value => Error::no_value_factory(
                    "no value factory found and compact format prevents slicing \
                     (the sender should use the sliced format instead)",
                    type_id,
                ),
                _ => Error::UnknownUserException {
                    type_id: unscoped(&type_id),
                },
            });
        }
        self.skip((slice_size - 4) as usize)?;

        let has_optional_members = slice_flags & flags::HAS_OPTIONAL_MEMBERS != 0;
        let mut end = self.pos();
        if has_optional_members {
            // The end marker is re-emitted when the slice is written back.
            if end == start {
                return Err(Error::marshal("invalid slice size"));
            }
            end -= 1;
        }
        let info = SliceInfo {
            type_id,
            compact_id,
            bytes: self.buf.as_slice()[start..end].to_vec(),
            instances: Vec::new(),
            has_optional_members,
            is_last_slice: slice_flags & flags::IS_LAST_SLICE != 0,
        };

        let table = if slice_flags & flags::HAS_INDIRECTION_TABLE != 0 {
            Some(self.read_indirection_table()?)
        } else {
            None
        };

        let frame = self.decoder().current()?;
        frame.indirection_tables.push(table);
        frame.slices.push(info);
        Ok(())
    }

    fn read_sliced_data(&mut self) -> Result<Option<SlicedData>> {
        let (slices, tables) = {
            let frame = self.decoder().current()?;
            if frame.slices.is_empty() {
                return Ok(None);
            }
            (
                std::mem::take(&mut frame.slices),
                std::mem::take(&mut frame.indirection_tables),
            )
        };

        let mut out = Vec::with_capacity(slices.len());
        for (mut info, table) in slices.into_iter().zip(tables) {
            if let Some(table) = table {
                info.instances = table.iter().map(|_| ValueSlot::default()).collect();
                for (id, slot) in table.iter().zip(info.instances.iter()) {
                    self.add_patch_entry(*id, slot.patcher());
                }
            }
            out.push(info);
        }
        Ok(Some(SlicedData { slices: out }))
    }
}
