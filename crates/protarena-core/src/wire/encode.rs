//! Binary encoder.
//!
//! Encoding runs in two passes. The first computes the encoded size of every
//! reachable message (needed for length prefixes) and caches it; the second
//! writes fields in ascending field-number order, followed by the unknown
//! fields exactly as they were received.

use super::{encode_varint, make_tag, varint_len, zigzag_encode_32, zigzag_encode_64, WireType};
use crate::arena::{Arena, MessageId};
use crate::descriptor::{FieldKind, FieldLayout};
use crate::error::{Error, Result};
use crate::message::Slot;
use crate::value::{Elem, MapKey, Scalar};
use crate::MAX_DEPTH;
use bytes::BufMut;
use std::collections::HashMap;

/// Encoded size of a message in bytes
pub fn encoded_len(arena: &Arena, msg: MessageId) -> Result<usize> {
    Encoder::new(arena).size(msg, 0)
}

/// Encode a message into a new buffer
pub fn encode(arena: &Arena, msg: MessageId) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(arena);
    let len = encoder.size(msg, 0)?;
    let mut buf = Vec::with_capacity(len);
    encoder.write(msg, &mut buf)?;
    Ok(buf)
}

/// Encode a message into `buf`
pub fn encode_to(arena: &Arena, msg: MessageId, buf: &mut impl BufMut) -> Result<()> {
    let mut encoder = Encoder::new(arena);
    let len = encoder.size(msg, 0)?;
    if buf.remaining_mut() < len {
        return Err(Error::InvalidArgument(format!(
            "buffer has room for {} bytes, message needs {}",
            buf.remaining_mut(),
            len
        )));
    }
    encoder.write(msg, buf)
}

/// Wire type used for a single (unpacked) value of `kind`
pub(crate) fn wire_type_of(kind: &FieldKind) -> WireType {
    match kind {
        FieldKind::Int32
        | FieldKind::Int64
        | FieldKind::UInt32
        | FieldKind::UInt64
        | FieldKind::SInt32
        | FieldKind::SInt64
        | FieldKind::Bool
        | FieldKind::Enum(_) => WireType::Varint,
        FieldKind::Fixed32 | FieldKind::SFixed32 | FieldKind::Float => WireType::I32,
        FieldKind::Fixed64 | FieldKind::SFixed64 | FieldKind::Double => WireType::I64,
        FieldKind::String | FieldKind::Bytes | FieldKind::Message(_) => WireType::Len,
        FieldKind::Group(_) => WireType::StartGroup,
    }
}

/// Wire form of a scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payload {
    Varint(u64),
    Fixed32(u32),
    Fixed64(u64),
}

impl Payload {
    fn of(kind: &FieldKind, scalar: Scalar) -> Result<Self> {
        Ok(match (kind, scalar) {
            // Negative int32 and enum values are sign-extended to ten bytes
            (FieldKind::Int32 | FieldKind::Enum(_), Scalar::I32(v)) => Payload::Varint(v as i64 as u64),
            (FieldKind::Int64, Scalar::I64(v)) => Payload::Varint(v as u64),
            (FieldKind::UInt32, Scalar::U32(v)) => Payload::Varint(v as u64),
            (FieldKind::UInt64, Scalar::U64(v)) => Payload::Varint(v),
            (FieldKind::SInt32, Scalar::I32(v)) => Payload::Varint(zigzag_encode_32(v) as u64),
            (FieldKind::SInt64, Scalar::I64(v)) => Payload::Varint(zigzag_encode_64(v)),
            (FieldKind::Bool, Scalar::Bool(v)) => Payload::Varint(v as u64),
            (FieldKind::Fixed32, Scalar::U32(v)) => Payload::Fixed32(v),
            (FieldKind::SFixed32, Scalar::I32(v)) => Payload::Fixed32(v as u32),
            (FieldKind::Float, Scalar::F32(v)) => Payload::Fixed32(v.to_bits()),
            (FieldKind::Fixed64, Scalar::U64(v)) => Payload::Fixed64(v),
            (FieldKind::SFixed64, Scalar::I64(v)) => Payload::Fixed64(v as u64),
            (FieldKind::Double, Scalar::F64(v)) => Payload::Fixed64(v.to_bits()),
            (kind, scalar) => {
                return Err(Error::type_mismatch(kind.name(), format!("{:?}", scalar)))
            }
        })
    }

    fn len(self) -> usize {
        match self {
            Payload::Varint(v) => varint_len(v),
            Payload::Fixed32(_) => 4,
            Payload::Fixed64(_) => 8,
        }
    }

    fn write(self, buf: &mut impl BufMut) {
        match self {
            Payload::Varint(v) => encode_varint(v, buf),
            Payload::Fixed32(v) => buf.put_u32_le(v),
            Payload::Fixed64(v) => buf.put_u64_le(v),
        }
    }
}

#[inline]
fn tag_len(number: u32) -> usize {
    varint_len(make_tag(number, WireType::Varint))
}

#[inline]
fn put_tag(number: u32, wire_type: WireType, buf: &mut impl BufMut) {
    encode_varint(make_tag(number, wire_type), buf);
}

struct Encoder<'a> {
    arena: &'a Arena,
    sizes: HashMap<MessageId, usize>,
}

impl<'a> Encoder<'a> {
    fn new(arena: &'a Arena) -> Self {
        Self {
            arena,
            sizes: HashMap::new(),
        }
    }

    fn cached(&self, id: MessageId) -> Result<usize> {
        self.sizes
            .get(&id)
            .copied()
            .ok_or_else(|| Error::InvalidArgument("message size was not computed".into()))
    }

    /// First pass: size of `id`, caching it and every submessage size
    fn size(&mut self, id: MessageId, depth: u32) -> Result<usize> {
        if depth > MAX_DEPTH {
            return Err(Error::DepthExceeded { limit: MAX_DEPTH });
        }
        let arena = self.arena;
        let data = arena.msg(id)?;
        let mut total = 0;

        for (slot, field) in data.ty.layout().fields().iter().enumerate() {
            if !data.is_present(arena, slot, field) {
                continue;
            }
            let number = field.number();
            total += match data.slots[slot] {
                Slot::Scalar(s) => tag_len(number) + Payload::of(field.kind(), s)?.len(),
                Slot::Str(span) => tag_len(number) + len_delimited(span.len()),
                Slot::Message(child) => {
                    let n = self.size(child, depth + 1)?;
                    self.message_field_len(field.kind(), number, n)
                }
                Slot::Array(array) => {
                    let elems: Vec<Elem> = arena.array(array)?.iter().collect();
                    if field.is_packed() {
                        let payload = self.packed_payload_len(field, &elems)?;
                        tag_len(number) + len_delimited(payload)
                    } else {
                        let mut sum = 0;
                        for elem in elems {
                            sum += self.elem_field_len(field.kind(), number, elem, depth)?;
                        }
                        sum
                    }
                }
                Slot::Map(map) => {
                    let kinds = field.map_kinds()?;
                    let mut sum = 0;
                    for (key, value) in arena.map(map)?.sorted() {
                        let entry = key_field_len(&kinds.key, key)?
                            + self.elem_field_len(&kinds.value, 2, value, depth)?;
                        sum += tag_len(number) + len_delimited(entry);
                    }
                    sum
                }
                Slot::Unset => 0,
            };
        }

        total += data.unknown.iter().map(|span| span.len()).sum::<usize>();
        self.sizes.insert(id, total);
        Ok(total)
    }

    fn message_field_len(&self, kind: &FieldKind, number: u32, size: usize) -> usize {
        match kind {
            FieldKind::Group(_) => 2 * tag_len(number) + size,
            _ => tag_len(number) + len_delimited(size),
        }
    }

    fn packed_payload_len(&self, field: &FieldLayout, elems: &[Elem]) -> Result<usize> {
        let mut payload = 0;
        for elem in elems {
            match elem {
                Elem::Scalar(s) => payload += Payload::of(field.kind(), *s)?.len(),
                _ => {
                    return Err(Error::invalid_op(
                        field.full_name(),
                        "packed field holds a non-scalar element",
                    ))
                }
            }
        }
        Ok(payload)
    }

    /// Size of one tagged element (array element or map value)
    fn elem_field_len(&mut self, kind: &FieldKind, number: u32, elem: Elem, depth: u32) -> Result<usize> {
        Ok(match elem {
            Elem::Scalar(s) => tag_len(number) + Payload::of(kind, s)?.len(),
            Elem::Str(span) => tag_len(number) + len_delimited(span.len()),
            Elem::Message(child) => {
                let n = self.size(child, depth + 1)?;
                self.message_field_len(kind, number, n)
            }
        })
    }

    /// Second pass: write `id` using the cached sizes
    fn write(&self, id: MessageId, buf: &mut impl BufMut) -> Result<()> {
        let arena = self.arena;
        let data = arena.msg(id)?;

        for (slot, field) in data.ty.layout().fields().iter().enumerate() {
            if !data.is_present(arena, slot, field) {
                continue;
            }
            let number = field.number();
            match data.slots[slot] {
                Slot::Scalar(s) => {
                    let payload = Payload::of(field.kind(), s)?;
                    put_tag(number, wire_type_of(field.kind()), buf);
                    payload.write(buf);
                }
                Slot::Str(span) => {
                    put_tag(number, WireType::Len, buf);
                    put_bytes(arena.bytes(span)?, buf);
                }
                Slot::Message(child) => self.write_message(field.kind(), number, child, buf)?,
                Slot::Array(array) => {
                    let array = arena.array(array)?;
                    if field.is_packed() {
                        let elems: Vec<Elem> = array.iter().collect();
                        put_tag(number, WireType::Len, buf);
                        encode_varint(self.packed_payload_len(field, &elems)? as u64, buf);
                        for elem in elems {
                            if let Elem::Scalar(s) = elem {
                                Payload::of(field.kind(), s)?.write(buf);
                            }
                        }
                    } else {
                        for elem in array.iter() {
                            self.write_elem(field.kind(), number, elem, buf)?;
                        }
                    }
                }
                Slot::Map(map) => {
                    let kinds = field.map_kinds()?;
                    for (key, value) in arena.map(map)?.sorted() {
                        let entry = key_field_len(&kinds.key, key)?
                            + self.cached_elem_len(&kinds.value, 2, value)?;
                        put_tag(number, WireType::Len, buf);
                        encode_varint(entry as u64, buf);
                        write_key(&kinds.key, key, buf)?;
                        self.write_elem(&kinds.value, 2, value, buf)?;
                    }
                }
                Slot::Unset => {}
            }
        }

        for span in &data.unknown {
            buf.put_slice(arena.bytes(*span)?);
        }
        Ok(())
    }

    fn cached_elem_len(&self, kind: &FieldKind, number: u32, elem: Elem) -> Result<usize> {
        Ok(match elem {
            Elem::Scalar(s) => tag_len(number) + Payload::of(kind, s)?.len(),
            Elem::Str(span) => tag_len(number) + len_delimited(span.len()),
            Elem::Message(child) => self.message_field_len(kind, number, self.cached(child)?),
        })
    }

    fn write_elem(&self, kind: &FieldKind, number: u32, elem: Elem, buf: &mut impl BufMut) -> Result<()> {
        match elem {
            Elem::Scalar(s) => {
                let payload = Payload::of(kind, s)?;
                put_tag(number, wire_type_of(kind), buf);
                payload.write(buf);
            }
            Elem::Str(span) => {
                put_tag(number, WireType::Len, buf);
                put_bytes(self.arena.bytes(span)?, buf);
            }
            Elem::Message(child) => self.write_message(kind, number, child, buf)?,
        }
        Ok(())
    }

    fn write_message(&self, kind: &FieldKind, number: u32, child: MessageId, buf: &mut impl BufMut) -> Result<()> {
        match kind {
            FieldKind::Group(_) => {
                put_tag(number, WireType::StartGroup, buf);
                self.write(child, buf)?;
                put_tag(number, WireType::EndGroup, buf);
            }
            _ => {
                put_tag(number, WireType::Len, buf);
                encode_varint(self.cached(child)? as u64, buf);
                self.write(child, buf)?;
            }
        }
        Ok(())
    }
}

#[inline]
fn len_delimited(len: usize) -> usize {
    varint_len(len as u64) + len
}

fn put_bytes(bytes: &[u8], buf: &mut impl BufMut) {
    encode_varint(bytes.len() as u64, buf);
    buf.put_slice(bytes);
}

/// Size of the key field (number 1) of a map entry
fn key_field_len(kind: &FieldKind, key: &MapKey) -> Result<usize> {
    Ok(match key {
        MapKey::String(s) => tag_len(1) + len_delimited(s.len()),
        other => {
            let scalar = other
                .to_scalar()
                .ok_or_else(|| Error::type_mismatch(kind.name(), "string"))?;
            tag_len(1) + Payload::of(kind, scalar)?.len()
        }
    })
}

fn write_key(kind: &FieldKind, key: &MapKey, buf: &mut impl BufMut) -> Result<()> {
    match key {
        MapKey::String(s) => {
            put_tag(1, WireType::Len, buf);
            put_bytes(s.as_bytes(), buf);
        }
        other => {
            let scalar = other
                .to_scalar()
                .ok_or_else(|| Error::type_mismatch(kind.name(), "string"))?;
            let payload = Payload::of(kind, scalar)?;
            put_tag(1, wire_type_of(kind), buf);
            payload.write(buf);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Registry;
    use crate::testing::fixture_set;
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    fn registry() -> Registry {
        Registry::from_file_descriptor_set(fixture_set()).unwrap()
    }

    #[test]
    fn test_payloads() {
        assert_eq!(
            Payload::of(&FieldKind::Int32, Scalar::I32(-1)).unwrap(),
            Payload::Varint(u64::MAX)
        );
        assert_eq!(Payload::of(&FieldKind::Int32, Scalar::I32(-1)).unwrap().len(), 10);
        assert_eq!(
            Payload::of(&FieldKind::SInt32, Scalar::I32(-1)).unwrap(),
            Payload::Varint(1)
        );
        assert_eq!(
            Payload::of(&FieldKind::SFixed32, Scalar::I32(-2)).unwrap(),
            Payload::Fixed32(0xFFFF_FFFE)
        );
        assert!(Payload::of(&FieldKind::Int32, Scalar::I64(1)).is_err());
    }

    #[test]
    fn test_encode_scalars_in_field_order() {
        let registry = registry();
        let ty = registry.message("test3.AllTypes").unwrap();
        let mut arena = Arena::new();
        let msg = arena.new_message(&ty).unwrap();
        let mut view = arena.view_mut(msg).unwrap();
        view.set(14, Value::String("hi")).unwrap();
        view.set(1, Value::I32(150)).unwrap();
        view.set(12, Value::F64(1.0)).unwrap();
        // Zero values of implicit-presence fields are skipped
        view.set(2, Value::I64(0)).unwrap();

        let bytes = encode(&arena, msg).unwrap();
        assert_eq!(
            bytes,
            vec![
                0x08, 0x96, 0x01, // field 1 = 150
                0x61, 0, 0, 0, 0, 0, 0, 0xF0, 0x3F, // field 12 = 1.0
                0x72, 0x02, b'h', b'i', // field 14 = "hi"
            ]
        );
        assert_eq!(encoded_len(&arena, msg).unwrap(), bytes.len());
    }

    #[test]
    fn test_packed_and_unpacked() {
        let registry = registry();
        let ty = registry.message("test2.Legacy").unwrap();
        let mut arena = Arena::new();
        let msg = arena.new_message(&ty).unwrap();
        let mut view = arena.view_mut(msg).unwrap();
        for v in [1, 2, 300] {
            view.push(5, Value::I32(v)).unwrap();
            view.push(6, Value::I32(v)).unwrap();
        }

        let bytes = encode(&arena, msg).unwrap();
        assert_eq!(
            bytes,
            vec![
                0x2A, 0x04, 0x01, 0x02, 0xAC, 0x02, // field 5 packed
                0x30, 0x01, 0x30, 0x02, 0x30, 0xAC, 0x02, // field 6 unpacked
            ]
        );
    }

    #[test]
    fn test_group_and_nested() {
        let registry = registry();
        let ty = registry.message("test2.Legacy").unwrap();
        let mut arena = Arena::new();
        let msg = arena.new_message(&ty).unwrap();
        let item = arena.view_mut(msg).unwrap().mutable_message(7).unwrap();
        arena.view_mut(item).unwrap().set(1, Value::I32(5)).unwrap();

        let bytes = encode(&arena, msg).unwrap();
        assert_eq!(bytes, vec![0x3B, 0x08, 0x05, 0x3C]);

        let all = registry.message("test3.AllTypes").unwrap();
        let msg = arena.new_message(&all).unwrap();
        let nested = arena.view_mut(msg).unwrap().mutable_message(18).unwrap();
        arena.view_mut(nested).unwrap().set(1, Value::I32(1)).unwrap();
        // An empty present submessage still produces a tag and zero length
        arena.view_mut(nested).unwrap().mutable_message(2).unwrap();
        let bytes = encode(&arena, msg).unwrap();
        assert_eq!(bytes, vec![0x92, 0x01, 0x04, 0x08, 0x01, 0x12, 0x00]);
    }

    #[test]
    fn test_map_entries_sorted_with_key_and_value() {
        let registry = registry();
        let ty = registry.message("test3.AllTypes").unwrap();
        let mut arena = Arena::new();
        let msg = arena.new_message(&ty).unwrap();
        let mut view = arena.view_mut(msg).unwrap();
        view.map_insert(56, "b", Value::I32(0)).unwrap();
        view.map_insert(56, "a", Value::I32(1)).unwrap();

        let bytes = encode(&arena, msg).unwrap();
        assert_eq!(
            bytes,
            vec![
                0xC2, 0x03, 0x05, 0x0A, 0x01, b'a', 0x10, 0x01, // "a" => 1
                0xC2, 0x03, 0x05, 0x0A, 0x01, b'b', 0x10, 0x00, // "b" => 0, value written
            ]
        );
    }

    #[test]
    fn test_unknown_fields_last() {
        let registry = registry();
        let ty = registry.message("test3.Nested").unwrap();
        let mut arena = Arena::new();
        let msg = arena.new_message(&ty).unwrap();
        let mut view = arena.view_mut(msg).unwrap();
        view.append_unknown(&[0xF8, 0x01, 0x01]).unwrap();
        view.set(1, Value::I32(2)).unwrap();

        assert_eq!(
            encode(&arena, msg).unwrap(),
            vec![0x08, 0x02, 0xF8, 0x01, 0x01]
        );
    }

    #[test]
    fn test_encode_to_checks_capacity() {
        let registry = registry();
        let ty = registry.message("test3.Nested").unwrap();
        let mut arena = Arena::new();
        let msg = arena.new_message(&ty).unwrap();
        arena.view_mut(msg).unwrap().set(1, Value::I32(2)).unwrap();

        let mut small = [0u8; 1];
        assert!(encode_to(&arena, msg, &mut &mut small[..]).is_err());

        let mut buf = bytes::BytesMut::new();
        encode_to(&arena, msg, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x08, 0x02]);
    }
}
