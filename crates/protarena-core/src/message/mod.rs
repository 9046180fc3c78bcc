//! Messages: construction, presence and field access.
//!
//! A message is a row of *slots*, one per field of its layout, plus a
//! presence bitmap, one case word per real oneof and a list of unknown-field
//! spans. Containers (submessages, arrays, maps) start out as
//! unset and are materialized in the owning arena the first time a
//! mutating accessor needs them.
//!
//! Reads go through [`MessageView`], writes through [`MessageMut`]; both are
//! obtained from the [`Arena`] that owns the message.

use crate::arena::{Arena, ArrayId, MapId, MessageId, Span};
use crate::descriptor::{DefaultValue, FieldKind, FieldLayout, Label, MessageType, Presence};
use crate::error::{Error, Result};
use crate::value::array::ArrayData;
use crate::value::map::MapData;
use crate::value::{check, elem_value, Checked, Elem, MapKey, Optional, Value};
use crate::MAX_DEPTH;
use bytes::Bytes;

/// Storage of one field
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Slot {
    /// Never written, or cleared
    Unset,
    Scalar(crate::value::Scalar),
    Str(Span),
    Message(MessageId),
    Array(ArrayId),
    Map(MapId),
}

impl From<Elem> for Slot {
    fn from(elem: Elem) -> Self {
        match elem {
            Elem::Scalar(s) => Slot::Scalar(s),
            Elem::Str(span) => Slot::Str(span),
            Elem::Message(id) => Slot::Message(id),
        }
    }
}

/// A message instance as stored in an arena slab
#[derive(Debug, Clone)]
pub(crate) struct MessageData {
    pub(crate) ty: MessageType,
    hasbits: Vec<u64>,
    oneof_cases: Vec<u32>,
    pub(crate) slots: Vec<Slot>,
    pub(crate) unknown: Vec<Span>,
}

impl MessageData {
    fn new(ty: &MessageType) -> Self {
        let layout = ty.layout();
        Self {
            ty: ty.clone(),
            hasbits: vec![0; (layout.hasbit_count() as usize).div_ceil(64)],
            oneof_cases: vec![0; layout.oneof_count()],
            slots: vec![Slot::Unset; layout.fields().len()],
            unknown: Vec::new(),
        }
    }

    fn hasbit(&self, bit: u32) -> bool {
        self.hasbits[bit as usize / 64] & (1 << (bit % 64)) != 0
    }

    fn set_hasbit(&mut self, bit: u32, on: bool) {
        let word = &mut self.hasbits[bit as usize / 64];
        if on {
            *word |= 1 << (bit % 64);
        } else {
            *word &= !(1 << (bit % 64));
        }
    }

    pub(crate) fn oneof_case(&self, oneof: usize) -> u32 {
        self.oneof_cases[oneof]
    }

    /// Whether the field in `slot` counts as present
    pub(crate) fn is_present(&self, arena: &Arena, slot: usize, field: &FieldLayout) -> bool {
        match field.presence() {
            Presence::Hasbit(bit) => self.hasbit(bit),
            Presence::Oneof(oneof) => self.oneof_cases[oneof as usize] == field.number(),
            Presence::Implicit => match self.slots[slot] {
                Slot::Scalar(s) => !s.is_zero(),
                Slot::Str(span) => !span.is_empty(),
                _ => false,
            },
            Presence::None => match self.slots[slot] {
                Slot::Array(id) => arena.array(id).is_ok_and(|a| !a.is_empty()),
                Slot::Map(id) => arena.map(id).is_ok_and(|m| m.len() > 0),
                _ => false,
            },
        }
    }
}

impl Arena {
    /// Create an empty message of type `ty`
    ///
    /// Every field reads as its default and no field is present.
    pub fn new_message(&mut self, ty: &MessageType) -> Result<MessageId> {
        self.insert_message(MessageData::new(ty))
    }

    /// Read access to a message
    pub fn view(&self, id: MessageId) -> Result<MessageView<'_>> {
        let index = self.message_index(id)?;
        Ok(MessageView {
            arena: self,
            id,
            index,
        })
    }

    /// Write access to a message
    pub fn view_mut(&mut self, id: MessageId) -> Result<MessageMut<'_>> {
        let index = self.message_index(id)?;
        Ok(MessageMut {
            arena: self,
            id,
            index,
        })
    }

    /// Type of a message
    pub fn message_type(&self, id: MessageId) -> Result<MessageType> {
        Ok(self.msg(id)?.ty.clone())
    }

    pub(crate) fn msg(&self, id: MessageId) -> Result<&MessageData> {
        let index = self.message_index(id)?;
        Ok(&self.messages[index])
    }

    pub(crate) fn msg_mut(&mut self, id: MessageId) -> Result<&mut MessageData> {
        let index = self.message_index(id)?;
        self.journal_message(index);
        Ok(&mut self.messages[index])
    }

    /// Store a checked value as an element
    pub(crate) fn store_checked(&mut self, checked: Checked<'_>) -> Result<Elem> {
        Ok(match checked {
            Checked::Scalar(s) => Elem::Scalar(s),
            Checked::Bytes(b) => Elem::Str(self.store(b)?),
        })
    }

    /// Write a singular slot and record presence
    ///
    /// Setting a oneof member clears whichever member was set before.
    pub(crate) fn write_slot(
        &mut self,
        id: MessageId,
        ty: &MessageType,
        slot: usize,
        field: &FieldLayout,
        value: Slot,
    ) -> Result<()> {
        let data = self.msg_mut(id)?;
        match field.presence() {
            Presence::Hasbit(bit) => data.set_hasbit(bit, true),
            Presence::Oneof(oneof) => {
                let current = data.oneof_cases[oneof as usize];
                if current != 0 && current != field.number() {
                    if let Some(other) = ty.layout().slot(current) {
                        data.slots[other] = Slot::Unset;
                    }
                }
                data.oneof_cases[oneof as usize] = field.number();
            }
            Presence::Implicit | Presence::None => {}
        }
        data.slots[slot] = value;
        Ok(())
    }

    pub(crate) fn clear_slot(
        &mut self,
        id: MessageId,
        slot: usize,
        field: &FieldLayout,
    ) -> Result<()> {
        let data = self.msg_mut(id)?;
        match field.presence() {
            Presence::Hasbit(bit) => data.set_hasbit(bit, false),
            Presence::Oneof(oneof) => {
                if data.oneof_cases[oneof as usize] == field.number() {
                    data.oneof_cases[oneof as usize] = 0;
                }
            }
            Presence::Implicit | Presence::None => {}
        }
        data.slots[slot] = Slot::Unset;
        Ok(())
    }

    /// The submessage in a singular message slot, created if absent
    pub(crate) fn child_message(
        &mut self,
        id: MessageId,
        ty: &MessageType,
        slot: usize,
        field: &FieldLayout,
    ) -> Result<MessageId> {
        let data = self.msg(id)?;
        if let Slot::Message(child) = data.slots[slot] {
            if data.is_present(self, slot, field) {
                return Ok(child);
            }
        }
        let index = field
            .kind()
            .message_index()
            .ok_or_else(|| Error::invalid_op(field.full_name(), "not a message field"))?;
        let child = self.new_message(&ty.sibling(index))?;
        self.write_slot(id, ty, slot, field, Slot::Message(child))?;
        Ok(child)
    }

    /// The array behind a repeated slot, created if absent
    pub(crate) fn array_for(&mut self, id: MessageId, slot: usize) -> Result<ArrayId> {
        if let Slot::Array(array) = self.msg(id)?.slots[slot] {
            return Ok(array);
        }
        let array = self.insert_array(ArrayData::default())?;
        self.msg_mut(id)?.slots[slot] = Slot::Array(array);
        Ok(array)
    }

    /// The map behind a map slot, created if absent
    pub(crate) fn map_for(&mut self, id: MessageId, slot: usize) -> Result<MapId> {
        if let Slot::Map(map) = self.msg(id)?.slots[slot] {
            return Ok(map);
        }
        let map = self.insert_map(MapData::default())?;
        self.msg_mut(id)?.slots[slot] = Slot::Map(map);
        Ok(map)
    }

    pub(crate) fn add_unknown(&mut self, id: MessageId, span: Span) -> Result<()> {
        if !span.is_empty() {
            self.msg_mut(id)?.unknown.push(span);
        }
        Ok(())
    }

    /// Direct submessages of a message, in slot order
    pub(crate) fn children(&self, id: MessageId) -> Result<Vec<MessageId>> {
        let data = self.msg(id)?;
        let mut children = Vec::new();
        for (slot, field) in data.ty.layout().fields().iter().enumerate() {
            match data.slots[slot] {
                Slot::Message(child) if data.is_present(self, slot, field) => children.push(child),
                Slot::Array(array) => children.extend(self.array(array)?.iter().filter_map(
                    |elem| match elem {
                        Elem::Message(child) => Some(child),
                        _ => None,
                    },
                )),
                Slot::Map(map) => children.extend(self.map(map)?.sorted().filter_map(
                    |(_, elem)| match elem {
                        Elem::Message(child) => Some(child),
                        _ => None,
                    },
                )),
                _ => {}
            }
        }
        Ok(children)
    }
}

/// Read-only view of a message
#[derive(Clone, Copy)]
pub struct MessageView<'a> {
    arena: &'a Arena,
    id: MessageId,
    index: usize,
}

impl std::fmt::Debug for MessageView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageView")
            .field("id", &self.id)
            .field("type", &self.data().ty)
            .finish()
    }
}

impl<'a> MessageView<'a> {
    fn data(&self) -> &'a MessageData {
        &self.arena.messages[self.index]
    }

    fn singular(&self, number: u32) -> Result<(usize, &'a FieldLayout)> {
        let (slot, field) = self.data().ty.slot(number)?;
        if field.is_repeated() {
            return Err(Error::invalid_op(
                field.full_name(),
                "repeated fields are read with get_at, list or map_get",
            ));
        }
        Ok((slot, field))
    }

    fn repeated(&self, number: u32) -> Result<(usize, &'a FieldLayout)> {
        let (slot, field) = self.data().ty.slot(number)?;
        if !field.is_repeated() || field.is_map() {
            return Err(Error::invalid_op(field.full_name(), "not a repeated field"));
        }
        Ok((slot, field))
    }

    fn map_field(&self, number: u32) -> Result<(usize, &'a FieldLayout)> {
        let (slot, field) = self.data().ty.slot(number)?;
        field.map_kinds()?;
        Ok((slot, field))
    }

    /// Handle of this message
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Type of this message
    pub fn message_type(&self) -> &'a MessageType {
        &self.data().ty
    }

    /// The arena holding this message
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Presence of a field that tracks it
    ///
    /// Repeated fields and proto3 implicit-presence scalars have no presence
    /// and are rejected with [`Error::InvalidFieldOp`].
    pub fn has(&self, number: u32) -> Result<bool> {
        let (slot, field) = self.data().ty.slot(number)?;
        match field.presence() {
            Presence::Hasbit(_) | Presence::Oneof(_) => {
                Ok(self.data().is_present(self.arena, slot, field))
            }
            Presence::Implicit | Presence::None => {
                Err(Error::invalid_op(field.full_name(), "field does not track presence"))
            }
        }
    }

    /// Value of a singular field, or its default when absent
    ///
    /// Absent message fields have no value to return and fail with
    /// [`Error::InvalidFieldOp`]; use [`MessageView::message`] to probe them.
    pub fn get(&self, number: u32) -> Result<Value<'a>> {
        let (slot, field) = self.singular(number)?;
        let data = self.data();
        let stored = data.slots[slot];
        let present = match field.presence() {
            Presence::Implicit => stored != Slot::Unset,
            _ => data.is_present(self.arena, slot, field),
        };
        if present {
            self.slot_value(stored, field)
        } else {
            self.default_value(field)
        }
    }

    /// Value of a field with presence, tagged with whether it is set
    pub fn get_opt(&self, number: u32) -> Result<Optional<Value<'a>>> {
        let (_, field) = self.singular(number)?;
        if field.is_singular_message() {
            return Err(Error::invalid_op(
                field.full_name(),
                "message fields are probed with message()",
            ));
        }
        if self.has(number)? {
            Ok(Optional::Set(self.get(number)?))
        } else {
            Ok(Optional::Unset(self.default_value(field)?))
        }
    }

    /// View of a singular submessage if it is present
    pub fn message(&self, number: u32) -> Result<Option<MessageView<'a>>> {
        let (slot, field) = self.singular(number)?;
        if !field.is_singular_message() {
            return Err(Error::invalid_op(field.full_name(), "not a message field"));
        }
        let data = self.data();
        match data.slots[slot] {
            Slot::Message(child) if data.is_present(self.arena, slot, field) => {
                Ok(Some(self.arena.view(child)?))
            }
            _ => Ok(None),
        }
    }

    /// Number of elements of a repeated field or entries of a map
    pub fn len(&self, number: u32) -> Result<usize> {
        let (slot, field) = self.data().ty.slot(number)?;
        if !field.is_repeated() {
            return Err(Error::invalid_op(field.full_name(), "not a repeated field"));
        }
        Ok(match self.data().slots[slot] {
            Slot::Array(id) => self.arena.array(id)?.len(),
            Slot::Map(id) => self.arena.map(id)?.len(),
            _ => 0,
        })
    }

    /// Element `index` of a repeated field
    pub fn get_at(&self, number: u32, index: usize) -> Result<Value<'a>> {
        let (slot, field) = self.repeated(number)?;
        match self.data().slots[slot] {
            Slot::Array(id) => {
                let elem = self.arena.array(id)?.get(index)?;
                elem_value(self.arena, field.kind(), elem)
            }
            _ => Err(Error::IndexOutOfBounds { index, len: 0 }),
        }
    }

    /// All elements of a repeated field
    pub fn list(&self, number: u32) -> Result<Vec<Value<'a>>> {
        let (slot, field) = self.repeated(number)?;
        match self.data().slots[slot] {
            Slot::Array(id) => self
                .arena
                .array(id)?
                .iter()
                .map(|elem| elem_value(self.arena, field.kind(), elem))
                .collect(),
            _ => Ok(Vec::new()),
        }
    }

    /// Number of entries of a map field
    pub fn map_len(&self, number: u32) -> Result<usize> {
        let (slot, _) = self.map_field(number)?;
        Ok(match self.data().slots[slot] {
            Slot::Map(id) => self.arena.map(id)?.len(),
            _ => 0,
        })
    }

    /// Value stored under `key` in a map field
    pub fn map_get(&self, number: u32, key: &MapKey) -> Result<Option<Value<'a>>> {
        let (slot, field) = self.map_field(number)?;
        let kinds = field.map_kinds()?;
        match self.data().slots[slot] {
            Slot::Map(id) => self
                .arena
                .map(id)?
                .get(key)
                .map(|elem| elem_value(self.arena, &kinds.value, elem))
                .transpose(),
            _ => Ok(None),
        }
    }

    /// Entries of a map field in ascending key order
    pub fn map_entries(&self, number: u32) -> Result<Vec<(&'a MapKey, Value<'a>)>> {
        let (slot, field) = self.map_field(number)?;
        let kinds = field.map_kinds()?;
        match self.data().slots[slot] {
            Slot::Map(id) => self
                .arena
                .map(id)?
                .sorted()
                .map(|(key, elem)| Ok((key, elem_value(self.arena, &kinds.value, elem)?)))
                .collect(),
            _ => Ok(Vec::new()),
        }
    }

    /// Number of the member currently set in the oneof called `name`
    pub fn which_oneof(&self, name: &str) -> Result<Option<u32>> {
        let layout = self.data().ty.layout();
        let index = layout.oneof_index(name).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "message '{}' has no oneof '{}'",
                layout.full_name(),
                name
            ))
        })?;
        let case = self.data().oneof_case(index);
        Ok((case != 0).then_some(case))
    }

    /// Present fields in ascending field-number order
    pub fn present_fields(&self) -> Vec<&'a FieldLayout> {
        let data = self.data();
        data.ty
            .layout()
            .fields()
            .iter()
            .enumerate()
            .filter(|(slot, field)| data.is_present(self.arena, *slot, field))
            .map(|(_, field)| field)
            .collect()
    }

    /// Unknown-field bytes in the order they were received or appended
    pub fn unknown_fields(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.unknown_len());
        for span in &self.data().unknown {
            out.extend_from_slice(self.arena.bytes(*span)?);
        }
        Ok(out)
    }

    /// Total size of the unknown-field bytes
    pub fn unknown_len(&self) -> usize {
        self.data().unknown.iter().map(Span::len).sum()
    }

    /// Returns true if every required field is set, recursively
    pub fn is_initialized(&self) -> Result<bool> {
        self.initialized(0)
    }

    fn initialized(&self, depth: u32) -> Result<bool> {
        if depth > MAX_DEPTH {
            return Err(Error::DepthExceeded { limit: MAX_DEPTH });
        }
        let data = self.data();
        for (slot, field) in data.ty.layout().fields().iter().enumerate() {
            if field.label() == Label::Required && !data.is_present(self.arena, slot, field) {
                return Ok(false);
            }
        }
        for child in self.arena.children(self.id)? {
            if !self.arena.view(child)?.initialized(depth + 1)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn slot_value(&self, stored: Slot, field: &'a FieldLayout) -> Result<Value<'a>> {
        match stored {
            Slot::Scalar(s) => Ok(s.to_value(field.kind())),
            Slot::Str(span) => elem_value(self.arena, field.kind(), Elem::Str(span)),
            Slot::Message(id) => Ok(Value::Message(id)),
            Slot::Unset => self.default_value(field),
            Slot::Array(_) | Slot::Map(_) => Err(Error::invalid_op(
                field.full_name(),
                "repeated fields are read with get_at, list or map_get",
            )),
        }
    }

    fn default_value(&self, field: &'a FieldLayout) -> Result<Value<'a>> {
        match &field.default {
            DefaultValue::Scalar(s) => Ok(s.to_value(field.kind())),
            DefaultValue::Bytes(bytes) => match field.kind() {
                FieldKind::String => std::str::from_utf8(bytes).map(Value::String).map_err(|_| {
                    Error::descriptor_build(format!(
                        "default of '{}' is not UTF-8",
                        field.full_name()
                    ))
                }),
                _ => Ok(Value::Bytes(bytes)),
            },
            DefaultValue::None => Err(Error::invalid_op(
                field.full_name(),
                "message field is not set",
            )),
        }
    }
}

/// Mutable view of a message
pub struct MessageMut<'a> {
    arena: &'a mut Arena,
    id: MessageId,
    index: usize,
}

impl std::fmt::Debug for MessageMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageMut").field("id", &self.id).finish()
    }
}

impl<'a> MessageMut<'a> {
    fn ty(&self) -> MessageType {
        self.arena.messages[self.index].ty.clone()
    }

    /// Handle of this message
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Read-only view of the same message
    pub fn as_view(&self) -> MessageView<'_> {
        MessageView {
            arena: &*self.arena,
            id: self.id,
            index: self.index,
        }
    }

    /// Set a singular scalar, enum, string or bytes field
    pub fn set(&mut self, number: u32, value: Value<'_>) -> Result<()> {
        let ty = self.ty();
        let (slot, field) = ty.slot(number)?;
        if field.is_repeated() {
            return Err(Error::invalid_op(
                field.full_name(),
                "repeated fields are written with push, set_at or map_insert",
            ));
        }
        let checked = check(field, field.kind(), value)?;
        let elem = self.arena.store_checked(checked)?;
        self.arena.write_slot(self.id, &ty, slot, field, elem.into())
    }

    /// Set a string or bytes field to an external buffer without copying it
    ///
    /// The buffer is kept alive by the arena until teardown.
    pub fn set_bytes_alias(&mut self, number: u32, data: Bytes) -> Result<()> {
        let ty = self.ty();
        let (slot, field) = ty.slot(number)?;
        if field.is_repeated() || !field.kind().is_string_like() {
            return Err(Error::invalid_op(
                field.full_name(),
                "only singular string and bytes fields can alias",
            ));
        }
        if matches!(field.kind(), FieldKind::String) && std::str::from_utf8(&data).is_err() {
            return Err(Error::InvalidArgument(format!(
                "value for string field '{}' is not UTF-8",
                field.full_name()
            )));
        }
        let span = self.arena.alias(data)?;
        self.arena
            .write_slot(self.id, &ty, slot, field, Slot::Str(span))
    }

    /// Clear a field: absent, default value, empty container
    pub fn clear_field(&mut self, number: u32) -> Result<()> {
        let ty = self.ty();
        let (slot, field) = ty.slot(number)?;
        self.arena.clear_slot(self.id, slot, field)
    }

    /// Clear every field and drop unknown fields
    pub fn clear(&mut self) -> Result<()> {
        let ty = self.ty();
        *self.arena.msg_mut(self.id)? = MessageData::new(&ty);
        Ok(())
    }

    /// Handle of a singular submessage, creating it if absent
    pub fn mutable_message(&mut self, number: u32) -> Result<MessageId> {
        let ty = self.ty();
        let (slot, field) = ty.slot(number)?;
        if !field.is_singular_message() {
            return Err(Error::invalid_op(field.full_name(), "not a singular message field"));
        }
        self.arena.child_message(self.id, &ty, slot, field)
    }

    fn repeated_slot<'t>(
        &self,
        ty: &'t MessageType,
        number: u32,
    ) -> Result<(usize, &'t FieldLayout)> {
        let (slot, field) = ty.slot(number)?;
        if !field.is_repeated() || field.is_map() {
            return Err(Error::invalid_op(field.full_name(), "not a repeated field"));
        }
        Ok((slot, field))
    }

    /// Append to a repeated scalar, enum, string or bytes field
    pub fn push(&mut self, number: u32, value: Value<'_>) -> Result<()> {
        let ty = self.ty();
        let (slot, field) = self.repeated_slot(&ty, number)?;
        let checked = check(field, field.kind(), value)?;
        let elem = self.arena.store_checked(checked)?;
        let array = self.arena.array_for(self.id, slot)?;
        self.arena.array_mut(array)?.push(elem)
    }

    /// Append a new empty message to a repeated message field
    pub fn push_message(&mut self, number: u32) -> Result<MessageId> {
        let ty = self.ty();
        let (slot, field) = self.repeated_slot(&ty, number)?;
        let index = field
            .kind()
            .message_index()
            .ok_or_else(|| Error::invalid_op(field.full_name(), "not a message field"))?;
        let child = self.arena.new_message(&ty.sibling(index))?;
        let array = self.arena.array_for(self.id, slot)?;
        self.arena.array_mut(array)?.push(Elem::Message(child))?;
        Ok(child)
    }

    /// Replace element `index` of a repeated scalar, enum, string or bytes field
    pub fn set_at(&mut self, number: u32, index: usize, value: Value<'_>) -> Result<()> {
        let ty = self.ty();
        let (slot, field) = self.repeated_slot(&ty, number)?;
        let checked = check(field, field.kind(), value)?;
        let Slot::Array(array) = self.arena.msg(self.id)?.slots[slot] else {
            return Err(Error::IndexOutOfBounds { index, len: 0 });
        };
        let len = self.arena.array(array)?.len();
        if index >= len {
            return Err(Error::IndexOutOfBounds { index, len });
        }
        let elem = self.arena.store_checked(checked)?;
        self.arena.array_mut(array)?.set(index, elem)
    }

    fn map_slot<'t>(
        &self,
        ty: &'t MessageType,
        number: u32,
        key: &MapKey,
    ) -> Result<(usize, &'t FieldLayout)> {
        let (slot, field) = ty.slot(number)?;
        let kinds = field.map_kinds()?;
        if !key.matches(&kinds.key) {
            return Err(Error::type_mismatch(
                format!("{} key ({})", field.full_name(), kinds.key.name()),
                key.as_value().type_name(),
            ));
        }
        Ok((slot, field))
    }

    /// Insert or replace a scalar, enum, string or bytes map value
    pub fn map_insert(
        &mut self,
        number: u32,
        key: impl Into<MapKey>,
        value: Value<'_>,
    ) -> Result<()> {
        let key = key.into();
        let ty = self.ty();
        let (slot, field) = self.map_slot(&ty, number, &key)?;
        let kinds = field.map_kinds()?;
        let checked = check(field, &kinds.value, value)?;
        let elem = self.arena.store_checked(checked)?;
        let map = self.arena.map_for(self.id, slot)?;
        self.arena.map_mut(map)?.insert(key, elem);
        Ok(())
    }

    /// Handle of the message stored under `key`, creating it if absent
    pub fn map_message(&mut self, number: u32, key: impl Into<MapKey>) -> Result<MessageId> {
        let key = key.into();
        let ty = self.ty();
        let (slot, field) = self.map_slot(&ty, number, &key)?;
        let index = field
            .map_kinds()?
            .value
            .message_index()
            .ok_or_else(|| Error::invalid_op(field.full_name(), "map values are not messages"))?;
        let map = self.arena.map_for(self.id, slot)?;
        if let Some(Elem::Message(existing)) = self.arena.map(map)?.get(&key) {
            return Ok(existing);
        }
        let child = self.arena.new_message(&ty.sibling(index))?;
        self.arena.map_mut(map)?.insert(key, Elem::Message(child));
        Ok(child)
    }

    /// Remove a map entry; returns whether it existed
    pub fn map_remove(&mut self, number: u32, key: &MapKey) -> Result<bool> {
        let ty = self.ty();
        let (slot, _) = self.map_slot(&ty, number, key)?;
        match self.arena.msg(self.id)?.slots[slot] {
            Slot::Map(map) => Ok(self.arena.map_mut(map)?.remove(key).is_some()),
            _ => Ok(false),
        }
    }

    /// Append raw wire bytes to the unknown-field list
    pub fn append_unknown(&mut self, data: &[u8]) -> Result<()> {
        let span = self.arena.store(data)?;
        self.arena.add_unknown(self.id, span)
    }

    /// Drop unknown fields from this message and every submessage
    pub fn discard_unknown(&mut self) -> Result<()> {
        let mut stack = vec![self.id];
        while let Some(id) = stack.pop() {
            self.arena.msg_mut(id)?.unknown.clear();
            stack.extend(self.arena.children(id)?);
        }
        Ok(())
    }
}
