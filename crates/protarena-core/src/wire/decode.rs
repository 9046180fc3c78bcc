//! Binary decoder.
//!
//! Decoding is a single forward pass. Known fields are dispatched through the
//! message layout; unknown field numbers are kept as raw tag-plus-payload
//! bytes. Any malformed input aborts the whole decode with
//! [`Error::MalformedWire`] carrying the byte offset of the problem.

use super::{
    decode_varint, encode_varint, encode::wire_type_of, length_to_usize, make_tag, skip_payload,
    split_tag, take, zigzag_decode_32, zigzag_decode_64, WireType,
};
use crate::arena::{Arena, MessageId, Span};
use crate::descriptor::{FieldKind, FieldLayout, MessageType};
use crate::error::{Error, Result, WireErrorKind};
use crate::message::Slot;
use crate::value::{Elem, MapKey, Scalar};
use crate::MAX_DEPTH;
use bytes::Bytes;
use tracing::trace;

/// Decoder settings
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Maximum message nesting (submessages and groups)
    pub max_depth: u32,
    /// Reference string, bytes and unknown-field payloads in the input
    /// instead of copying each of them
    pub alias: bool,
    /// Drop unknown fields instead of retaining them
    pub discard_unknown: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_depth: MAX_DEPTH,
            alias: false,
            discard_unknown: false,
        }
    }
}

impl DecodeOptions {
    /// Create options with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the nesting limit
    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    /// Enable or disable aliasing of the input buffer
    pub fn alias(mut self, enabled: bool) -> Self {
        self.alias = enabled;
        self
    }

    /// Enable or disable dropping unknown fields
    pub fn discard_unknown(mut self, enabled: bool) -> Self {
        self.discard_unknown = enabled;
        self
    }
}

/// Decode `data` as a new message of type `ty`
pub fn decode(arena: &mut Arena, ty: &MessageType, data: &[u8]) -> Result<MessageId> {
    decode_with(arena, ty, data, &DecodeOptions::default())
}

/// Decode `data` as a new message of type `ty` with explicit options
///
/// With [`DecodeOptions::alias`] the input is copied into the arena once and
/// every string, bytes and unknown-field span points into that copy.
pub fn decode_with(
    arena: &mut Arena,
    ty: &MessageType,
    data: &[u8],
    options: &DecodeOptions,
) -> Result<MessageId> {
    let source = if options.alias {
        Some(arena.store(data)?)
    } else {
        None
    };
    run(arena, ty, data, source, options)
}

/// Decode a shared buffer without copying it
///
/// When [`DecodeOptions::alias`] is set the arena keeps `data` alive until
/// teardown and the decoded message references it directly.
pub fn decode_bytes(
    arena: &mut Arena,
    ty: &MessageType,
    data: Bytes,
    options: &DecodeOptions,
) -> Result<MessageId> {
    if !options.alias {
        return decode_with(arena, ty, &data, options);
    }
    let source = arena.alias(data.clone())?;
    run(arena, ty, &data, Some(source), options)
}

/// Decode `data` into an existing message
///
/// Every field on the wire is assigned as it is read, including proto3
/// fields explicitly encoded with their zero value. Repeated fields append
/// and submessages merge. When the input is malformed `target` is left as
/// it was.
pub fn merge_from_bytes(
    arena: &mut Arena,
    target: MessageId,
    data: &[u8],
    options: &DecodeOptions,
) -> Result<()> {
    let ty = arena.message_type(target)?;
    arena.transaction(|arena| {
        let source = if options.alias {
            Some(arena.store(data)?)
        } else {
            None
        };
        let decoder = Decoder { options, source };
        decoder.message(arena, target, &ty, data, 0, data.len(), None, 0)?;
        Ok(())
    })
}

fn run(
    arena: &mut Arena,
    ty: &MessageType,
    data: &[u8],
    source: Option<Span>,
    options: &DecodeOptions,
) -> Result<MessageId> {
    arena.transaction(|arena| {
        let msg = arena.new_message(ty)?;
        let decoder = Decoder { options, source };
        decoder.message(arena, msg, ty, data, 0, data.len(), None, 0)?;
        Ok(msg)
    })
}

struct Decoder<'o> {
    options: &'o DecodeOptions,
    /// Arena copy (or alias) of the whole input, when aliasing
    source: Option<Span>,
}

impl Decoder<'_> {
    /// Decode fields of `id` from `data[start..end]`
    ///
    /// With `group` set the message is a group body that must end with a
    /// matching end-group tag. Returns the position after the last byte
    /// consumed.
    #[allow(clippy::too_many_arguments)]
    fn message(
        &self,
        arena: &mut Arena,
        id: MessageId,
        ty: &MessageType,
        data: &[u8],
        start: usize,
        end: usize,
        group: Option<u32>,
        depth: u32,
    ) -> Result<usize> {
        if depth > self.options.max_depth {
            return Err(Error::malformed(
                start,
                WireErrorKind::DepthExceeded(self.options.max_depth),
            ));
        }
        let data = &data[..end];
        let mut pos = start;

        while pos < end {
            let field_start = pos;
            let (tag, tag_len) =
                decode_varint(&data[pos..]).map_err(|kind| Error::malformed(pos, kind))?;
            let (number, wire_type) = split_tag(tag).map_err(|kind| Error::malformed(pos, kind))?;
            pos += tag_len;

            if wire_type == WireType::EndGroup {
                return match group {
                    Some(open) if open == number => Ok(pos),
                    Some(open) => Err(Error::malformed(
                        field_start,
                        WireErrorKind::GroupMismatch {
                            start: open,
                            end: number,
                        },
                    )),
                    None => Err(Error::malformed(
                        field_start,
                        WireErrorKind::UnexpectedEndGroup(number),
                    )),
                };
            }

            pos = match ty.layout().slot(number) {
                Some(slot) => {
                    let field = &ty.layout().fields()[slot];
                    self.field(arena, id, ty, slot, field, wire_type, data, field_start, pos, depth)?
                }
                None => {
                    let limit = self.options.max_depth.saturating_sub(depth);
                    let after = skip_payload(data, pos, number, wire_type, limit)?;
                    trace!(field = number, len = after - field_start, "unknown field");
                    self.unknown(arena, id, data, field_start, after)?;
                    after
                }
            };
        }

        match group {
            Some(open) => Err(Error::malformed(pos, WireErrorKind::UnterminatedGroup(open))),
            None => Ok(pos),
        }
    }

    /// Decode one occurrence of a known field; returns the position after it
    #[allow(clippy::too_many_arguments)]
    fn field(
        &self,
        arena: &mut Arena,
        id: MessageId,
        ty: &MessageType,
        slot: usize,
        field: &FieldLayout,
        wire_type: WireType,
        data: &[u8],
        field_start: usize,
        pos: usize,
        depth: u32,
    ) -> Result<usize> {
        let kind = field.kind();
        let number = field.number();
        let expected = wire_type_of(kind);

        if field.is_map() {
            expect(wire_type, WireType::Len, number, field_start)?;
            let (payload, after) = len_payload(data, pos)?;
            if !self.map_entry(arena, id, ty, slot, field, data, payload, depth)? {
                // An entry whose closed-enum value is unknown is kept whole
                self.unknown(arena, id, data, field_start, after)?;
            }
            return Ok(after);
        }

        if field.is_repeated() && wire_type == WireType::Len && kind.is_packable() {
            let (payload, after) = len_payload(data, pos)?;
            let mut cursor = payload.0;
            while cursor < payload.1 {
                let (scalar, next) = read_scalar(data, cursor, payload.1, kind, number)
                    .map_err(|err| packed_error(err, number, payload.1))?;
                if closed_enum_rejects(kind, scalar) {
                    self.unknown_varint(arena, id, number, scalar)?;
                } else {
                    let array = arena.array_for(id, slot)?;
                    arena.array_mut(array)?.push(Elem::Scalar(scalar))?;
                }
                cursor = next;
            }
            return Ok(after);
        }

        expect(wire_type, expected, number, field_start)?;

        match kind {
            FieldKind::Message(index) | FieldKind::Group(index) => {
                let child_ty = ty.sibling(*index);
                let child = if field.is_repeated() {
                    let child = arena.new_message(&child_ty)?;
                    let array = arena.array_for(id, slot)?;
                    arena.array_mut(array)?.push(Elem::Message(child))?;
                    child
                } else {
                    arena.child_message(id, ty, slot, field)?
                };
                if matches!(kind, FieldKind::Group(_)) {
                    self.message(arena, child, &child_ty, data, pos, data.len(), Some(number), depth + 1)
                } else {
                    let (payload, after) = len_payload(data, pos)?;
                    self.message(arena, child, &child_ty, data, payload.0, payload.1, None, depth + 1)?;
                    Ok(after)
                }
            }
            FieldKind::String | FieldKind::Bytes => {
                let (payload, after) = len_payload(data, pos)?;
                if matches!(kind, FieldKind::String) {
                    check_utf8(data, payload, number)?;
                }
                let span = self.span(arena, data, payload.0, payload.1)?;
                if field.is_repeated() {
                    let array = arena.array_for(id, slot)?;
                    arena.array_mut(array)?.push(Elem::Str(span))?;
                } else {
                    arena.write_slot(id, ty, slot, field, Slot::Str(span))?;
                }
                Ok(after)
            }
            _ => {
                let (scalar, after) = read_scalar(data, pos, data.len(), kind, number)?;
                if closed_enum_rejects(kind, scalar) {
                    self.unknown(arena, id, data, field_start, after)?;
                } else if field.is_repeated() {
                    let array = arena.array_for(id, slot)?;
                    arena.array_mut(array)?.push(Elem::Scalar(scalar))?;
                } else {
                    arena.write_slot(id, ty, slot, field, Slot::Scalar(scalar))?;
                }
                Ok(after)
            }
        }
    }

    /// Decode one map entry and insert it, replacing any previous value
    ///
    /// Returns false when the entry was not inserted because its value is
    /// not declared by a closed enum.
    #[allow(clippy::too_many_arguments)]
    fn map_entry(
        &self,
        arena: &mut Arena,
        id: MessageId,
        ty: &MessageType,
        slot: usize,
        field: &FieldLayout,
        data: &[u8],
        payload: (usize, usize),
        depth: u32,
    ) -> Result<bool> {
        let kinds = field.map_kinds()?;
        let entry = data_window(data, payload);
        let mut key: Option<MapKey> = None;
        let mut value: Option<Elem> = None;
        let mut pos = payload.0;

        while pos < payload.1 {
            let field_start = pos;
            let (tag, tag_len) =
                decode_varint(&entry[pos..]).map_err(|kind| Error::malformed(pos, kind))?;
            let (number, wire_type) = split_tag(tag).map_err(|kind| Error::malformed(pos, kind))?;
            pos += tag_len;

            match number {
                1 => {
                    expect(wire_type, wire_type_of(&kinds.key), field.number(), field_start)?;
                    pos = if matches!(kinds.key, FieldKind::String) {
                        let (bytes, after) = len_payload(entry, pos)?;
                        let text = check_utf8(entry, bytes, field.number())?;
                        key = Some(MapKey::String(text.to_string()));
                        after
                    } else {
                        let (scalar, after) =
                            read_scalar(entry, pos, payload.1, &kinds.key, field.number())?;
                        key = MapKey::from_scalar(scalar);
                        after
                    };
                }
                2 => {
                    expect(wire_type, wire_type_of(&kinds.value), field.number(), field_start)?;
                    pos = match &kinds.value {
                        FieldKind::Message(index) => {
                            let (bytes, after) = len_payload(entry, pos)?;
                            let child = match value {
                                Some(Elem::Message(child)) => child,
                                _ => arena.new_message(&ty.sibling(*index))?,
                            };
                            let child_ty = ty.sibling(*index);
                            self.message(arena, child, &child_ty, entry, bytes.0, bytes.1, None, depth + 1)?;
                            value = Some(Elem::Message(child));
                            after
                        }
                        FieldKind::String | FieldKind::Bytes => {
                            let (bytes, after) = len_payload(entry, pos)?;
                            if matches!(kinds.value, FieldKind::String) {
                                check_utf8(entry, bytes, field.number())?;
                            }
                            value = Some(Elem::Str(self.span(arena, entry, bytes.0, bytes.1)?));
                            after
                        }
                        other => {
                            let (scalar, after) =
                                read_scalar(entry, pos, payload.1, other, field.number())?;
                            value = Some(Elem::Scalar(scalar));
                            after
                        }
                    };
                }
                _ => {
                    let limit = self.options.max_depth.saturating_sub(depth);
                    pos = skip_payload(entry, pos, number, wire_type, limit)?;
                }
            }
        }

        if let Some(Elem::Scalar(scalar)) = value {
            if closed_enum_rejects(&kinds.value, scalar) {
                return Ok(false);
            }
        }

        let key = match key {
            Some(key) => key,
            None => MapKey::default_for(&kinds.key)
                .ok_or_else(|| Error::invalid_op(field.full_name(), "map key kind has no default"))?,
        };
        let value = match value {
            Some(value) => value,
            None => match &kinds.value {
                FieldKind::Message(index) => Elem::Message(arena.new_message(&ty.sibling(*index))?),
                FieldKind::String | FieldKind::Bytes => Elem::Str(self.span(arena, entry, 0, 0)?),
                other => Elem::Scalar(other.zero().ok_or_else(|| {
                    Error::invalid_op(field.full_name(), "map value kind has no default")
                })?),
            },
        };

        let map = arena.map_for(id, slot)?;
        arena.map_mut(map)?.insert(key, value);
        Ok(true)
    }

    /// Span for `data[start..end]`, copied or aliased
    fn span(&self, arena: &mut Arena, data: &[u8], start: usize, end: usize) -> Result<Span> {
        match self.source {
            Some(source) => source.subspan(start, end - start).ok_or_else(|| {
                Error::InvalidArgument("decoded range lies outside the input".into())
            }),
            None => arena.store(&data[start..end]),
        }
    }

    fn unknown(&self, arena: &mut Arena, id: MessageId, data: &[u8], start: usize, end: usize) -> Result<()> {
        if self.options.discard_unknown {
            return Ok(());
        }
        let span = self.span(arena, data, start, end)?;
        arena.add_unknown(id, span)
    }

    /// Keep a packed closed-enum value the enum does not declare
    fn unknown_varint(&self, arena: &mut Arena, id: MessageId, number: u32, scalar: Scalar) -> Result<()> {
        if self.options.discard_unknown {
            return Ok(());
        }
        let Scalar::I32(value) = scalar else {
            return Ok(());
        };
        let mut raw = Vec::with_capacity(16);
        encode_varint(make_tag(number, WireType::Varint), &mut raw);
        encode_varint(value as i64 as u64, &mut raw);
        let span = arena.store(&raw)?;
        arena.add_unknown(id, span)
    }
}

fn data_window(data: &[u8], payload: (usize, usize)) -> &[u8] {
    &data[..payload.1]
}

fn expect(found: WireType, expected: WireType, field: u32, offset: usize) -> Result<()> {
    if found != expected {
        return Err(Error::malformed(
            offset,
            WireErrorKind::WireTypeMismatch {
                field,
                expected,
                found,
            },
        ));
    }
    Ok(())
}

/// Read a length prefix at `pos`; returns the payload range and the
/// position after it
fn len_payload(data: &[u8], pos: usize) -> Result<((usize, usize), usize)> {
    let (length, len) = decode_varint(&data[pos..]).map_err(|kind| Error::malformed(pos, kind))?;
    let start = pos + len;
    let end = take(data, start, length_to_usize(length, pos)?)?;
    Ok(((start, end), end))
}

fn check_utf8(data: &[u8], payload: (usize, usize), field: u32) -> Result<&str> {
    std::str::from_utf8(&data[payload.0..payload.1]).map_err(|err| {
        Error::malformed(
            payload.0 + err.valid_up_to(),
            WireErrorKind::InvalidUtf8 { field },
        )
    })
}

fn closed_enum_rejects(kind: &FieldKind, scalar: Scalar) -> bool {
    match (kind, scalar) {
        (FieldKind::Enum(layout), Scalar::I32(value)) => layout.is_closed() && !layout.contains(value),
        _ => false,
    }
}

/// A truncated element inside a packed payload is reported as such
fn packed_error(err: Error, field: u32, end: usize) -> Error {
    match err {
        Error::MalformedWire {
            offset,
            kind: WireErrorKind::Truncated { .. } | WireErrorKind::TruncatedVarint,
        } if offset <= end => Error::malformed(offset, WireErrorKind::PackedLength { field }),
        other => other,
    }
}

/// Read one scalar of `kind` at `pos`, bounded by `end`
fn read_scalar(data: &[u8], pos: usize, end: usize, kind: &FieldKind, field: u32) -> Result<(Scalar, usize)> {
    let window = &data[..end];
    let out_of_range = |value: u64| Error::malformed(pos, WireErrorKind::ValueOutOfRange { field, value });

    match wire_type_of(kind) {
        WireType::Varint => {
            let (raw, len) = decode_varint(&window[pos..]).map_err(|kind| Error::malformed(pos, kind))?;
            let scalar = match kind {
                FieldKind::Int32 | FieldKind::Enum(_) => {
                    // Negative values arrive sign-extended to 64 bits
                    let value = raw as i64;
                    let narrowed = i32::try_from(value).map_err(|_| out_of_range(raw))?;
                    Scalar::I32(narrowed)
                }
                FieldKind::Int64 => Scalar::I64(raw as i64),
                FieldKind::UInt32 => Scalar::U32(u32::try_from(raw).map_err(|_| out_of_range(raw))?),
                FieldKind::UInt64 => Scalar::U64(raw),
                FieldKind::SInt32 => {
                    let zigzag = u32::try_from(raw).map_err(|_| out_of_range(raw))?;
                    Scalar::I32(zigzag_decode_32(zigzag))
                }
                FieldKind::SInt64 => Scalar::I64(zigzag_decode_64(raw)),
                FieldKind::Bool => Scalar::Bool(raw != 0),
                _ => return Err(Error::type_mismatch("varint kind", kind.name())),
            };
            Ok((scalar, pos + len))
        }
        WireType::I32 => {
            let after = take(window, pos, 4)?;
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&window[pos..after]);
            let raw = u32::from_le_bytes(bytes);
            let scalar = match kind {
                FieldKind::Fixed32 => Scalar::U32(raw),
                FieldKind::SFixed32 => Scalar::I32(raw as i32),
                _ => Scalar::F32(f32::from_bits(raw)),
            };
            Ok((scalar, after))
        }
        WireType::I64 => {
            let after = take(window, pos, 8)?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&window[pos..after]);
            let raw = u64::from_le_bytes(bytes);
            let scalar = match kind {
                FieldKind::Fixed64 => Scalar::U64(raw),
                FieldKind::SFixed64 => Scalar::I64(raw as i64),
                _ => Scalar::F64(f64::from_bits(raw)),
            };
            Ok((scalar, after))
        }
        other => Err(Error::type_mismatch(kind.name(), format!("{:?} payload", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Registry;
    use crate::testing::fixture_set;
    use crate::value::Value;
    use crate::wire::encode;
    use pretty_assertions::assert_eq;

    fn registry() -> Registry {
        Registry::from_file_descriptor_set(fixture_set()).unwrap()
    }

    fn kind_of(err: Error) -> WireErrorKind {
        match err {
            Error::MalformedWire { kind, .. } => kind,
            other => panic!("expected malformed wire error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_scalars() {
        let registry = registry();
        let ty = registry.message("test3.AllTypes").unwrap();
        let mut arena = Arena::new();
        let msg = decode(
            &mut arena,
            &ty,
            &[
                0x08, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01, // int32 -1
                0x28, 0x03, // sint32 -2
                0x3D, 0x01, 0, 0, 0, // fixed32 1
                0x68, 0x05, // bool (any nonzero)
                0x72, 0x02, b'o', b'k', // string
            ],
        )
        .unwrap();

        let view = arena.view(msg).unwrap();
        assert_eq!(view.get(1).unwrap(), Value::I32(-1));
        assert_eq!(view.get(5).unwrap(), Value::I32(-2));
        assert_eq!(view.get(7).unwrap(), Value::U32(1));
        assert_eq!(view.get(13).unwrap(), Value::Bool(true));
        assert_eq!(view.get(14).unwrap(), Value::String("ok"));
    }

    #[test]
    fn test_int32_range() {
        let registry = registry();
        let ty = registry.message("test3.AllTypes").unwrap();
        let mut arena = Arena::new();

        // 2147483648 does not fit int32
        let err = decode(&mut arena, &ty, &[0x08, 0x80, 0x80, 0x80, 0x80, 0x08]).unwrap_err();
        assert_eq!(
            kind_of(err),
            WireErrorKind::ValueOutOfRange {
                field: 1,
                value: 2_147_483_648
            }
        );

        // uint32 rejects anything past u32::MAX
        let err = decode(&mut arena, &ty, &[0x18, 0x80, 0x80, 0x80, 0x80, 0x10]).unwrap_err();
        assert!(matches!(kind_of(err), WireErrorKind::ValueOutOfRange { field: 3, .. }));
    }

    #[test]
    fn test_malformed_input() {
        let registry = registry();
        let ty = registry.message("test3.AllTypes").unwrap();
        let mut arena = Arena::new();

        let cases: Vec<(&[u8], WireErrorKind)> = vec![
            (&[0x08, 0x80], WireErrorKind::TruncatedVarint),
            (
                &[0x72, 0x05, b'a'],
                WireErrorKind::Truncated {
                    needed: 5,
                    available: 1,
                },
            ),
            (&[0x0E, 0x00], WireErrorKind::InvalidWireType(6)),
            (
                &[0x10, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F],
                WireErrorKind::VarintOverflow,
            ),
            (&[0x00, 0x00], WireErrorKind::InvalidFieldNumber(0)),
            (
                &[0x09, 0, 0, 0, 0, 0, 0, 0, 0],
                WireErrorKind::WireTypeMismatch {
                    field: 1,
                    expected: WireType::Varint,
                    found: WireType::I64,
                },
            ),
            (&[0x72, 0x01, 0xC0], WireErrorKind::InvalidUtf8 { field: 14 }),
            (&[0xFC, 0x07], WireErrorKind::UnexpectedEndGroup(127)),
        ];
        for (input, expected) in cases {
            let err = decode(&mut arena, &ty, input).unwrap_err();
            assert_eq!(kind_of(err), expected, "input {:02X?}", input);
        }
    }

    #[test]
    fn test_unknown_fields_retained() {
        let registry = registry();
        let ty = registry.message("test3.Nested").unwrap();
        let mut arena = Arena::new();
        let input = [
            0xF8, 0x01, 0x01, // field 31 varint
            0x08, 0x07, // a = 7
            0xA3, 0x06, 0x08, 0x01, 0xA4, 0x06, // group 100 with one varint
        ];
        let msg = decode(&mut arena, &ty, &input).unwrap();
        let view = arena.view(msg).unwrap();
        assert_eq!(view.get(1).unwrap(), Value::I32(7));
        assert_eq!(
            view.unknown_fields().unwrap(),
            vec![0xF8, 0x01, 0x01, 0xA3, 0x06, 0x08, 0x01, 0xA4, 0x06]
        );

        let options = DecodeOptions::new().discard_unknown(true);
        let msg = decode_with(&mut arena, &ty, &input, &options).unwrap();
        assert_eq!(arena.view(msg).unwrap().unknown_len(), 0);
    }

    #[test]
    fn test_group_mismatch() {
        let registry = registry();
        let ty = registry.message("test2.Legacy").unwrap();
        let mut arena = Arena::new();

        let msg = decode(&mut arena, &ty, &[0x3B, 0x08, 0x05, 0x3C]).unwrap();
        let item = arena.view(msg).unwrap().message(7).unwrap().unwrap();
        assert_eq!(item.get(1).unwrap(), Value::I32(5));

        let err = decode(&mut arena, &ty, &[0x3B, 0x08, 0x05, 0x44]).unwrap_err();
        assert_eq!(kind_of(err), WireErrorKind::GroupMismatch { start: 7, end: 8 });
        let err = decode(&mut arena, &ty, &[0x3B, 0x08, 0x05]).unwrap_err();
        assert_eq!(kind_of(err), WireErrorKind::UnterminatedGroup(7));
    }

    #[test]
    fn test_packed_and_unpacked_accepted() {
        let registry = registry();
        let ty = registry.message("test3.AllTypes").unwrap();
        let mut arena = Arena::new();
        let msg = decode(
            &mut arena,
            &ty,
            &[
                0xFA, 0x01, 0x02, 0x01, 0x02, // packed 1, 2
                0xF8, 0x01, 0x03, // unpacked 3
            ],
        )
        .unwrap();
        assert_eq!(
            arena.view(msg).unwrap().list(31).unwrap(),
            vec![Value::I32(1), Value::I32(2), Value::I32(3)]
        );

        let err = decode(&mut arena, &ty, &[0xFA, 0x01, 0x01, 0x80]).unwrap_err();
        assert_eq!(kind_of(err), WireErrorKind::PackedLength { field: 31 });
    }

    #[test]
    fn test_closed_enum_unknown_value() {
        let registry = registry();
        let ty = registry.message("test2.Legacy").unwrap();
        let mut arena = Arena::new();
        let input = [0x18, 0x09, 0x20, 0x01];
        let msg = decode(&mut arena, &ty, &input).unwrap();
        let view = arena.view(msg).unwrap();
        assert!(!view.has(3).unwrap());
        assert_eq!(view.unknown_fields().unwrap(), vec![0x18, 0x09]);
        assert_eq!(encode(&arena, msg).unwrap(), vec![0x20, 0x01, 0x18, 0x09]);
    }

    #[test]
    fn test_map_entries() {
        let registry = registry();
        let ty = registry.message("test3.AllTypes").unwrap();
        let mut arena = Arena::new();
        let msg = decode(
            &mut arena,
            &ty,
            &[
                0xC2, 0x03, 0x05, 0x0A, 0x01, b'k', 0x10, 0x01, // "k" => 1
                0xC2, 0x03, 0x05, 0x0A, 0x01, b'k', 0x10, 0x02, // "k" => 2
                0xC2, 0x03, 0x02, 0x10, 0x09, // missing key => ""
                0xCA, 0x03, 0x02, 0x08, 0x04, // 4 => empty Nested
            ],
        )
        .unwrap();
        let view = arena.view(msg).unwrap();
        assert_eq!(view.map_len(56).unwrap(), 2);
        assert_eq!(view.map_get(56, &MapKey::from("k")).unwrap(), Some(Value::I32(2)));
        assert_eq!(view.map_get(56, &MapKey::from("")).unwrap(), Some(Value::I32(9)));
        let nested = view.map_get(57, &MapKey::I32(4)).unwrap().unwrap();
        let nested = arena.view(nested.as_message().unwrap()).unwrap();
        assert_eq!(nested.get(1).unwrap(), Value::I32(0));
    }

    #[test]
    fn test_depth_limit() {
        let registry = registry();
        let ty = registry.message("test3.Nested").unwrap();
        let mut arena = Arena::new();

        // child { child { child {} } }
        let input = [0x12, 0x04, 0x12, 0x02, 0x12, 0x00];
        assert!(decode(&mut arena, &ty, &input).is_ok());
        let options = DecodeOptions::new().max_depth(2);
        let err = decode_with(&mut arena, &ty, &input, &options).unwrap_err();
        assert_eq!(kind_of(err), WireErrorKind::DepthExceeded(2));
    }

    #[test]
    fn test_alias_mode() {
        let registry = registry();
        let ty = registry.message("test3.AllTypes").unwrap();
        let mut arena = Arena::new();
        let input = Bytes::from_static(&[0x7A, 0x03, 1, 2, 3]);
        let options = DecodeOptions::new().alias(true);
        let msg = decode_bytes(&mut arena, &ty, input.clone(), &options).unwrap();

        match arena.view(msg).unwrap().get(15).unwrap() {
            Value::Bytes(b) => {
                assert_eq!(b, &[1, 2, 3]);
                assert_eq!(b.as_ptr(), input[2..].as_ptr());
            }
            other => panic!("unexpected value {:?}", other),
        }
        assert_eq!(arena.stats().aliases, 1);
    }

    #[test]
    fn test_merge_from_bytes_is_atomic() {
        let registry = registry();
        let ty = registry.message("test3.AllTypes").unwrap();
        let mut arena = Arena::new();
        let msg = arena.new_message(&ty).unwrap();
        arena.view_mut(msg).unwrap().push(31, Value::I32(1)).unwrap();

        let options = DecodeOptions::default();
        merge_from_bytes(&mut arena, msg, &[0xF8, 0x01, 0x02, 0x08, 0x05], &options).unwrap();
        let view = arena.view(msg).unwrap();
        assert_eq!(view.list(31).unwrap(), vec![Value::I32(1), Value::I32(2)]);
        assert_eq!(view.get(1).unwrap(), Value::I32(5));

        // A valid field followed by garbage leaves the target as it was
        let before = arena.stats().messages;
        let err = merge_from_bytes(
            &mut arena,
            msg,
            &[0x08, 0x06, 0xF8, 0x01, 0x03, 0x92, 0x01, 0x02, 0x08, 0x01, 0x72, 0x09],
            &options,
        );
        assert!(err.is_err());
        let view = arena.view(msg).unwrap();
        assert_eq!(view.get(1).unwrap(), Value::I32(5));
        assert_eq!(view.list(31).unwrap(), vec![Value::I32(1), Value::I32(2)]);
        assert!(view.message(18).unwrap().is_none());
        assert_eq!(arena.stats().messages, before);
    }

    #[test]
    fn test_merge_from_bytes_assigns_zero_values() {
        let registry = registry();
        let ty = registry.message("test3.AllTypes").unwrap();
        let mut arena = Arena::new();
        let msg = arena.new_message(&ty).unwrap();
        let mut view = arena.view_mut(msg).unwrap();
        view.set(1, Value::I32(5)).unwrap();
        view.set(14, Value::String("old")).unwrap();
        let nested = view.mutable_message(18).unwrap();
        arena.view_mut(nested).unwrap().set(1, Value::I32(3)).unwrap();

        // optional_int32 = 0, optional_string = "", nested { child {} }
        let input = [0x08, 0x00, 0x72, 0x00, 0x92, 0x01, 0x02, 0x12, 0x00];
        merge_from_bytes(&mut arena, msg, &input, &DecodeOptions::default()).unwrap();

        let view = arena.view(msg).unwrap();
        assert_eq!(view.get(1).unwrap(), Value::I32(0));
        assert_eq!(view.get(14).unwrap(), Value::String(""));
        // The existing submessage is merged into, not replaced
        let child = view.message(18).unwrap().unwrap();
        assert_eq!(child.id(), nested);
        assert_eq!(child.get(1).unwrap(), Value::I32(3));
        assert!(child.message(2).unwrap().is_some());
    }
}
