//! Merge and deep copy.
//!
//! Merging `src` into `dst` follows the protobuf rules:
//!
//! - present singular scalars, strings and bytes overwrite
//! - present submessages merge recursively (created in `dst` if absent)
//! - repeated fields append
//! - map entries overwrite per key; message values are deep-copied and
//!   replace the destination value instead of merging into it
//! - unknown fields are appended in encounter order
//!
//! Everything copied into `dst` is allocated in the destination arena, so the
//! result shares nothing with the source arena.

use crate::arena::{Arena, MessageId};
use crate::error::{Error, Result};
use crate::message::Slot;
use crate::value::Elem;
use crate::MAX_DEPTH;
use tracing::trace;

/// Merge `src` (in `src_arena`) into `dst` (in `dst_arena`)
///
/// Both messages must have the same [`MessageType`](crate::MessageType);
/// otherwise [`Error::TypeMismatch`] is returned before anything changes.
/// Any later failure, such as [`Error::DepthExceeded`] on a deep source,
/// leaves `dst` as it was before the call.
pub fn merge_into(
    src_arena: &Arena,
    src: MessageId,
    dst_arena: &mut Arena,
    dst: MessageId,
) -> Result<()> {
    let src_ty = src_arena.message_type(src)?;
    let dst_ty = dst_arena.message_type(dst)?;
    if src_ty != dst_ty {
        return Err(Error::type_mismatch(dst_ty.full_name(), src_ty.full_name()));
    }
    dst_arena.transaction(|arena| Merger { src: src_arena, dst: arena }.merge(src, dst, 0))
}

/// Merge two messages of the same arena
///
/// The source is snapshotted first, so `src == dst` is allowed: merging a
/// message into itself doubles its repeated fields.
pub fn merge_within(arena: &mut Arena, src: MessageId, dst: MessageId) -> Result<()> {
    let src_ty = arena.message_type(src)?;
    let dst_ty = arena.message_type(dst)?;
    if src_ty != dst_ty {
        return Err(Error::type_mismatch(dst_ty.full_name(), src_ty.full_name()));
    }
    let mut scratch = Arena::with_config(arena.config().clone());
    let snapshot = deep_copy(arena, src, &mut scratch)?;
    merge_into(&scratch, snapshot, arena, dst)
}

/// Copy `src` and everything it references into a new message in `dst_arena`
pub fn deep_copy(src_arena: &Arena, src: MessageId, dst_arena: &mut Arena) -> Result<MessageId> {
    let ty = src_arena.message_type(src)?;
    dst_arena.transaction(|arena| {
        let copy = arena.new_message(&ty)?;
        Merger { src: src_arena, dst: arena }.merge(src, copy, 0)?;
        Ok(copy)
    })
}

struct Merger<'s, 'd> {
    src: &'s Arena,
    dst: &'d mut Arena,
}

impl Merger<'_, '_> {
    fn merge(&mut self, src: MessageId, dst: MessageId, depth: u32) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(Error::DepthExceeded { limit: MAX_DEPTH });
        }

        let src_arena = self.src;
        let data = src_arena.msg(src)?;
        let ty = data.ty.clone();
        for (slot, field) in ty.layout().fields().iter().enumerate() {
            if !data.is_present(src_arena, slot, field) {
                continue;
            }
            match data.slots[slot] {
                Slot::Scalar(s) => {
                    self.dst.write_slot(dst, &ty, slot, field, Slot::Scalar(s))?;
                }
                Slot::Str(span) => {
                    let copy = self.dst.store(src_arena.bytes(span)?)?;
                    self.dst.write_slot(dst, &ty, slot, field, Slot::Str(copy))?;
                }
                Slot::Message(child) => {
                    let target = self.dst.child_message(dst, &ty, slot, field)?;
                    self.merge(child, target, depth + 1)?;
                }
                Slot::Array(array) => {
                    let target = self.dst.array_for(dst, slot)?;
                    for elem in src_arena.array(array)?.iter() {
                        let elem = self.copy_elem(elem, depth)?;
                        self.dst.array_mut(target)?.push(elem)?;
                    }
                }
                Slot::Map(map) => {
                    let target = self.dst.map_for(dst, slot)?;
                    for (key, elem) in src_arena.map(map)?.sorted() {
                        let elem = self.copy_elem(elem, depth)?;
                        self.dst.map_mut(target)?.insert(key.clone(), elem);
                    }
                }
                Slot::Unset => {}
            }
        }

        for span in &data.unknown {
            let copy = self.dst.store(src_arena.bytes(*span)?)?;
            self.dst.add_unknown(dst, copy)?;
        }
        trace!("merged {} into {:?}", ty, dst);
        Ok(())
    }

    /// Copy an array element or map value into the destination arena
    fn copy_elem(&mut self, elem: Elem, depth: u32) -> Result<Elem> {
        Ok(match elem {
            Elem::Scalar(s) => Elem::Scalar(s),
            Elem::Str(span) => Elem::Str(self.dst.store(self.src.bytes(span)?)?),
            Elem::Message(child) => {
                let ty = self.src.message_type(child)?;
                let copy = self.dst.new_message(&ty)?;
                self.merge(child, copy, depth + 1)?;
                Elem::Message(copy)
            }
        })
    }
}
