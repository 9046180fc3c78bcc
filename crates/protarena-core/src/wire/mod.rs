//! Protocol Buffers binary wire format.
//!
//! Each field on the wire is a varint *tag* followed by a payload whose
//! shape is selected by the tag's low three bits:
//!
//! - 0: VARINT (int32, int64, uint32, uint64, sint32, sint64, bool, enum)
//! - 1: I64 (fixed64, sfixed64, double)
//! - 2: LEN (string, bytes, embedded messages, packed repeated fields)
//! - 3/4: start/end group (legacy nested messages)
//! - 5: I32 (fixed32, sfixed32, float)
//!
//! The helpers here are shared by the [`encode`] and [`decode`] halves of
//! the codec and are public so tooling can walk raw wire data without a
//! descriptor.

pub mod decode;
pub mod encode;

use crate::error::{Error, Result, WireErrorKind};
use crate::MAX_FIELD_NUMBER;
use bytes::BufMut;

pub use decode::{decode, decode_bytes, decode_with, merge_from_bytes, DecodeOptions};
pub use encode::{encode, encode_to, encoded_len};

/// Protobuf wire types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireType {
    /// Variable-length integer
    Varint = 0,
    /// 64-bit fixed-width
    I64 = 1,
    /// Length-delimited (strings, bytes, embedded messages)
    Len = 2,
    /// Start group (deprecated)
    StartGroup = 3,
    /// End group (deprecated)
    EndGroup = 4,
    /// 32-bit fixed-width
    I32 = 5,
}

impl TryFrom<u8> for WireType {
    type Error = WireErrorKind;

    fn try_from(value: u8) -> std::result::Result<Self, WireErrorKind> {
        match value {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::I64),
            2 => Ok(WireType::Len),
            3 => Ok(WireType::StartGroup),
            4 => Ok(WireType::EndGroup),
            5 => Ok(WireType::I32),
            _ => Err(WireErrorKind::InvalidWireType(value)),
        }
    }
}

/// Maximum length of an encoded varint
pub const MAX_VARINT_LEN: usize = 10;

/// Decode a varint from the given bytes.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn decode_varint(data: &[u8]) -> std::result::Result<(u64, usize), WireErrorKind> {
    let mut result: u64 = 0;
    let mut shift = 0;

    for (i, &byte) in data.iter().enumerate() {
        // The tenth byte holds only bit 63 and must end the varint
        if i >= MAX_VARINT_LEN || (i == MAX_VARINT_LEN - 1 && byte > 0x01) {
            return Err(WireErrorKind::VarintOverflow);
        }

        result |= ((byte & 0x7F) as u64) << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }

    if data.len() >= MAX_VARINT_LEN {
        Err(WireErrorKind::VarintOverflow)
    } else {
        Err(WireErrorKind::TruncatedVarint)
    }
}

/// Append `value` as a base-128 varint.
#[inline]
pub fn encode_varint(mut value: u64, buf: &mut impl BufMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Number of bytes `value` occupies as a varint.
#[inline]
pub fn varint_len(value: u64) -> usize {
    let highest_bit = 63 - (value | 1).leading_zeros() as usize;
    (highest_bit * 9 + 73) / 64
}

/// Zig-zag encode a 32-bit signed value (`sint32`).
#[inline]
pub fn zigzag_encode_32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

/// Zig-zag decode a 32-bit value.
#[inline]
pub fn zigzag_decode_32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Zig-zag encode a 64-bit signed value (`sint64`).
#[inline]
pub fn zigzag_encode_64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Zig-zag decode a 64-bit value.
#[inline]
pub fn zigzag_decode_64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Compose a tag from a field number and wire type.
#[inline]
pub fn make_tag(number: u32, wire_type: WireType) -> u64 {
    ((number as u64) << 3) | wire_type as u64
}

/// Split a decoded tag into a validated field number and wire type.
pub fn split_tag(tag: u64) -> std::result::Result<(u32, WireType), WireErrorKind> {
    let wire_type = WireType::try_from((tag & 0x07) as u8)?;
    let number = tag >> 3;
    if number == 0 || number > MAX_FIELD_NUMBER as u64 {
        return Err(WireErrorKind::InvalidFieldNumber(number));
    }
    Ok((number as u32, wire_type))
}

/// One top-level field as found on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawField {
    /// Field number from the tag
    pub number: u32,
    /// Wire type from the tag
    pub wire_type: WireType,
    /// Offset of the tag within the scanned buffer
    pub offset: usize,
    /// Total encoded length, tag included
    pub len: usize,
}

/// Consume a single protobuf field starting at `offset`.
///
/// Groups are walked structurally, so the returned length covers the whole
/// group through its matching end tag. `depth_limit` bounds group nesting.
pub fn consume_field(data: &[u8], offset: usize, depth_limit: u32) -> Result<RawField> {
    let (tag, tag_len) =
        decode_varint(&data[offset..]).map_err(|kind| Error::malformed(offset, kind))?;
    let (number, wire_type) = split_tag(tag).map_err(|kind| Error::malformed(offset, kind))?;

    let end = skip_payload(data, offset + tag_len, number, wire_type, depth_limit)?;
    Ok(RawField {
        number,
        wire_type,
        offset,
        len: end - offset,
    })
}

/// Skip the payload of a field whose tag has already been read.
///
/// Returns the offset just past the payload. An `EndGroup` wire type is
/// rejected here: end tags are only legal where a group is open.
pub(crate) fn skip_payload(
    data: &[u8],
    pos: usize,
    number: u32,
    wire_type: WireType,
    depth_limit: u32,
) -> Result<usize> {
    match wire_type {
        WireType::Varint => {
            let (_, len) =
                decode_varint(&data[pos..]).map_err(|kind| Error::malformed(pos, kind))?;
            Ok(pos + len)
        }
        WireType::I64 => take(data, pos, 8),
        WireType::I32 => take(data, pos, 4),
        WireType::Len => {
            let (length, len) =
                decode_varint(&data[pos..]).map_err(|kind| Error::malformed(pos, kind))?;
            take(data, pos + len, length_to_usize(length, pos)?)
        }
        WireType::StartGroup => {
            if depth_limit == 0 {
                return Err(Error::malformed(pos, WireErrorKind::DepthExceeded(0)));
            }
            let mut cursor = pos;
            loop {
                if cursor >= data.len() {
                    return Err(Error::malformed(
                        cursor,
                        WireErrorKind::UnterminatedGroup(number),
                    ));
                }
                let (tag, tag_len) = decode_varint(&data[cursor..])
                    .map_err(|kind| Error::malformed(cursor, kind))?;
                let (inner, inner_type) =
                    split_tag(tag).map_err(|kind| Error::malformed(cursor, kind))?;
                if inner_type == WireType::EndGroup {
                    if inner != number {
                        return Err(Error::malformed(
                            cursor,
                            WireErrorKind::GroupMismatch {
                                start: number,
                                end: inner,
                            },
                        ));
                    }
                    return Ok(cursor + tag_len);
                }
                cursor = skip_payload(data, cursor + tag_len, inner, inner_type, depth_limit - 1)?;
            }
        }
        WireType::EndGroup => Err(Error::malformed(
            pos,
            WireErrorKind::UnexpectedEndGroup(number),
        )),
    }
}

/// Bounds-checked advance by `len` bytes.
#[inline]
pub(crate) fn take(data: &[u8], pos: usize, len: usize) -> Result<usize> {
    let available = data.len().saturating_sub(pos);
    if len > available {
        return Err(Error::malformed(
            pos,
            WireErrorKind::Truncated {
                needed: len,
                available,
            },
        ));
    }
    Ok(pos + len)
}

#[inline]
pub(crate) fn length_to_usize(length: u64, pos: usize) -> Result<usize> {
    usize::try_from(length).map_err(|_| {
        Error::malformed(
            pos,
            WireErrorKind::Truncated {
                needed: usize::MAX,
                available: 0,
            },
        )
    })
}

/// Iterate over the top-level fields of a buffer.
///
/// Stops after the first malformed field, yielding its error.
pub fn raw_fields(data: &[u8], depth_limit: u32) -> RawFields<'_> {
    RawFields {
        data,
        position: 0,
        depth_limit,
        failed: false,
    }
}

/// Iterator returned by [`raw_fields`]
#[derive(Debug)]
pub struct RawFields<'a> {
    data: &'a [u8],
    position: usize,
    depth_limit: u32,
    failed: bool,
}

impl Iterator for RawFields<'_> {
    type Item = Result<RawField>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.data.len() {
            return None;
        }
        match consume_field(self.data, self.position, self.depth_limit) {
            Ok(field) => {
                self.position += field.len;
                Some(Ok(field))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
