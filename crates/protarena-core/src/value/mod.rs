//! Dynamic values.
//!
//! [`Value`] is what field accessors hand out and accept. Strings and bytes
//! borrow from the arena that owns them, and submessages are referred to by
//! [`MessageId`]. Internally a field is stored in its narrowest shape: a
//! scalar for numbers, bools and enums, a [`Span`] for strings and bytes,
//! or a handle for messages, arrays and maps.

pub(crate) mod array;
pub(crate) mod map;

use crate::arena::{Arena, MessageId, Span};
use crate::descriptor::{FieldKind, FieldLayout};
use crate::error::{Error, Result, WireErrorKind};
use std::fmt;

/// A field value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    /// `bool`
    Bool(bool),
    /// `int32`, `sint32`, `sfixed32`
    I32(i32),
    /// `int64`, `sint64`, `sfixed64`
    I64(i64),
    /// `uint32`, `fixed32`
    U32(u32),
    /// `uint64`, `fixed64`
    U64(u64),
    /// `float`
    F32(f32),
    /// `double`
    F64(f64),
    /// Enum number
    Enum(i32),
    /// `string`
    String(&'a str),
    /// `bytes`
    Bytes(&'a [u8]),
    /// Embedded message or group
    Message(MessageId),
}

impl<'a> Value<'a> {
    /// Name of the variant, used in type mismatch errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Enum(_) => "enum",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Message(_) => "message",
        }
    }

    /// The value as `bool`
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Any signed integer (or enum) widened to `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I32(v) | Value::Enum(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Any unsigned integer widened to `u64`
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U32(v) => Some(v as u64),
            Value::U64(v) => Some(v),
            _ => None,
        }
    }

    /// Any floating point value widened to `f64`
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    /// The value as a string slice
    pub fn as_str(&self) -> Option<&'a str> {
        match *self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The raw bytes of a `string` or `bytes` value
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match *self {
            Value::String(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The handle of a message value
    pub fn as_message(&self) -> Option<MessageId> {
        match *self {
            Value::Message(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::I32(v) | Value::Enum(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "{} bytes", b.len()),
            Value::Message(id) => write!(f, "message {}#{}", id.arena(), id.index),
        }
    }
}

/// A value that is either explicitly set or the field default
///
/// Returned by [`MessageView::get_opt`](crate::MessageView::get_opt).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Optional<T> {
    /// The field is present
    Set(T),
    /// The field is absent; holds the default
    Unset(T),
}

impl<T> Optional<T> {
    /// Returns true if the field is present
    pub fn is_set(&self) -> bool {
        matches!(self, Optional::Set(_))
    }

    /// The value, whether set or default
    pub fn into_inner(self) -> T {
        match self {
            Optional::Set(v) | Optional::Unset(v) => v,
        }
    }

    /// `Some` only when the field is present
    pub fn into_option(self) -> Option<T> {
        match self {
            Optional::Set(v) => Some(v),
            Optional::Unset(_) => None,
        }
    }
}

impl<T> From<Optional<T>> for Option<T> {
    fn from(value: Optional<T>) -> Self {
        value.into_option()
    }
}

/// Key of a map entry
///
/// Ordering matches serialization order: numeric ascending, `false` before
/// `true`, strings bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKey {
    /// `bool` keys
    Bool(bool),
    /// `int32`, `sint32`, `sfixed32` keys
    I32(i32),
    /// `int64`, `sint64`, `sfixed64` keys
    I64(i64),
    /// `uint32`, `fixed32` keys
    U32(u32),
    /// `uint64`, `fixed64` keys
    U64(u64),
    /// `string` keys
    String(String),
}

impl MapKey {
    /// Returns true if the key variant fits a map whose key kind is `kind`
    pub fn matches(&self, kind: &FieldKind) -> bool {
        matches!(
            (self, kind),
            (MapKey::Bool(_), FieldKind::Bool)
                | (
                    MapKey::I32(_),
                    FieldKind::Int32 | FieldKind::SInt32 | FieldKind::SFixed32
                )
                | (
                    MapKey::I64(_),
                    FieldKind::Int64 | FieldKind::SInt64 | FieldKind::SFixed64
                )
                | (MapKey::U32(_), FieldKind::UInt32 | FieldKind::Fixed32)
                | (MapKey::U64(_), FieldKind::UInt64 | FieldKind::Fixed64)
                | (MapKey::String(_), FieldKind::String)
        )
    }

    /// The key as a [`Value`]
    pub fn as_value(&self) -> Value<'_> {
        match self {
            MapKey::Bool(v) => Value::Bool(*v),
            MapKey::I32(v) => Value::I32(*v),
            MapKey::I64(v) => Value::I64(*v),
            MapKey::U32(v) => Value::U32(*v),
            MapKey::U64(v) => Value::U64(*v),
            MapKey::String(s) => Value::String(s),
        }
    }

    /// Default key for a key kind (used for entries without a key)
    pub(crate) fn default_for(kind: &FieldKind) -> Option<MapKey> {
        Some(match kind {
            FieldKind::Bool => MapKey::Bool(false),
            FieldKind::Int32 | FieldKind::SInt32 | FieldKind::SFixed32 => MapKey::I32(0),
            FieldKind::Int64 | FieldKind::SInt64 | FieldKind::SFixed64 => MapKey::I64(0),
            FieldKind::UInt32 | FieldKind::Fixed32 => MapKey::U32(0),
            FieldKind::UInt64 | FieldKind::Fixed64 => MapKey::U64(0),
            FieldKind::String => MapKey::String(String::new()),
            _ => return None,
        })
    }

    /// Key from a decoded scalar of the key kind
    pub(crate) fn from_scalar(scalar: Scalar) -> Option<MapKey> {
        Some(match scalar {
            Scalar::Bool(v) => MapKey::Bool(v),
            Scalar::I32(v) => MapKey::I32(v),
            Scalar::I64(v) => MapKey::I64(v),
            Scalar::U32(v) => MapKey::U32(v),
            Scalar::U64(v) => MapKey::U64(v),
            Scalar::F32(_) | Scalar::F64(_) => return None,
        })
    }

    /// Scalar form of a numeric or bool key
    pub(crate) fn to_scalar(&self) -> Option<Scalar> {
        Some(match *self {
            MapKey::Bool(v) => Scalar::Bool(v),
            MapKey::I32(v) => Scalar::I32(v),
            MapKey::I64(v) => Scalar::I64(v),
            MapKey::U32(v) => Scalar::U32(v),
            MapKey::U64(v) => Scalar::U64(v),
            MapKey::String(_) => return None,
        })
    }
}

impl From<&str> for MapKey {
    fn from(value: &str) -> Self {
        MapKey::String(value.to_string())
    }
}

impl From<String> for MapKey {
    fn from(value: String) -> Self {
        MapKey::String(value)
    }
}

impl From<bool> for MapKey {
    fn from(value: bool) -> Self {
        MapKey::Bool(value)
    }
}

impl From<i32> for MapKey {
    fn from(value: i32) -> Self {
        MapKey::I32(value)
    }
}

impl From<i64> for MapKey {
    fn from(value: i64) -> Self {
        MapKey::I64(value)
    }
}

impl From<u32> for MapKey {
    fn from(value: u32) -> Self {
        MapKey::U32(value)
    }
}

impl From<u64> for MapKey {
    fn from(value: u64) -> Self {
        MapKey::U64(value)
    }
}

/// Stored form of numeric, bool and enum values (enums as `I32`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Scalar {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Scalar {
    /// True for the type default of the scalar (implicit presence)
    ///
    /// `-0.0` is not a default: it must survive a round trip.
    pub(crate) fn is_zero(&self) -> bool {
        match *self {
            Scalar::Bool(v) => !v,
            Scalar::I32(v) => v == 0,
            Scalar::I64(v) => v == 0,
            Scalar::U32(v) => v == 0,
            Scalar::U64(v) => v == 0,
            Scalar::F32(v) => v.to_bits() == 0,
            Scalar::F64(v) => v.to_bits() == 0,
        }
    }

    /// Public value for a field of kind `kind`
    pub(crate) fn to_value(self, kind: &FieldKind) -> Value<'static> {
        match (self, kind) {
            (Scalar::I32(v), FieldKind::Enum(_)) => Value::Enum(v),
            (Scalar::Bool(v), _) => Value::Bool(v),
            (Scalar::I32(v), _) => Value::I32(v),
            (Scalar::I64(v), _) => Value::I64(v),
            (Scalar::U32(v), _) => Value::U32(v),
            (Scalar::U64(v), _) => Value::U64(v),
            (Scalar::F32(v), _) => Value::F32(v),
            (Scalar::F64(v), _) => Value::F64(v),
        }
    }
}

/// One stored element: a field's value, an array element or a map value
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Elem {
    Scalar(Scalar),
    Str(Span),
    Message(MessageId),
}

/// A value checked against a field kind, ready to be stored
#[derive(Debug, Clone, Copy)]
pub(crate) enum Checked<'a> {
    Scalar(Scalar),
    Bytes(&'a [u8]),
}

/// Check that `value` fits a field of kind `kind`
///
/// Messages are never accepted: they are created in place with
/// `mutable_message`, `push_message` or `map_message`.
pub(crate) fn check<'v>(
    field: &FieldLayout,
    kind: &FieldKind,
    value: Value<'v>,
) -> Result<Checked<'v>> {
    let mismatch = || {
        Error::type_mismatch(
            format!("{} ({})", field.full_name(), kind.name()),
            value.type_name(),
        )
    };
    let scalar = match (kind, value) {
        (FieldKind::Bool, Value::Bool(v)) => Scalar::Bool(v),
        (FieldKind::Int32 | FieldKind::SInt32 | FieldKind::SFixed32, Value::I32(v)) => {
            Scalar::I32(v)
        }
        (FieldKind::Int64 | FieldKind::SInt64 | FieldKind::SFixed64, Value::I64(v)) => {
            Scalar::I64(v)
        }
        (FieldKind::UInt32 | FieldKind::Fixed32, Value::U32(v)) => Scalar::U32(v),
        (FieldKind::UInt64 | FieldKind::Fixed64, Value::U64(v)) => Scalar::U64(v),
        (FieldKind::Float, Value::F32(v)) => Scalar::F32(v),
        (FieldKind::Double, Value::F64(v)) => Scalar::F64(v),
        (FieldKind::Enum(layout), Value::Enum(v) | Value::I32(v)) => {
            if layout.is_closed() && !layout.contains(v) {
                return Err(Error::InvalidEnumValue {
                    enum_name: layout.full_name().to_string(),
                    value: v,
                });
            }
            Scalar::I32(v)
        }
        (FieldKind::String, Value::String(s)) => return Ok(Checked::Bytes(s.as_bytes())),
        (FieldKind::Bytes, Value::Bytes(b)) => return Ok(Checked::Bytes(b)),
        (FieldKind::Message(_) | FieldKind::Group(_), Value::Message(_)) => {
            return Err(Error::invalid_op(
                field.full_name(),
                "message values are created in place, not assigned",
            ))
        }
        _ => return Err(mismatch()),
    };
    Ok(Checked::Scalar(scalar))
}

/// Read a stored element as a public value
pub(crate) fn elem_value<'a>(arena: &'a Arena, kind: &FieldKind, elem: Elem) -> Result<Value<'a>> {
    Ok(match elem {
        Elem::Scalar(scalar) => scalar.to_value(kind),
        Elem::Message(id) => Value::Message(id),
        Elem::Str(span) => {
            let bytes = arena.bytes(span)?;
            match kind {
                FieldKind::String => Value::String(utf8(bytes, 0)?),
                _ => Value::Bytes(bytes),
            }
        }
    })
}

/// Validate UTF-8 for a string field
pub(crate) fn utf8(bytes: &[u8], field: u32) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| {
        Error::malformed(e.valid_up_to(), WireErrorKind::InvalidUtf8 { field })
    })
}
