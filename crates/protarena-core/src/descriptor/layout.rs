//! Per-message layout tables computed once from descriptors.
//!
//! A [`MessageLayout`] lists the fields of one message type sorted by field
//! number. The position of a field in that list is its *slot*: every message
//! instance stores exactly one slot per field. Alongside the kind of each
//! field the layout records how presence is tracked (hasbit index, oneof
//! index, or implicit), whether repeated values are packed, and the default
//! value parsed from the descriptor.

use super::ProtoSyntax;
use crate::error::{Error, Result};
use crate::value::Scalar;
use prost_reflect::{EnumDescriptor, ExtensionDescriptor, FieldDescriptor, Kind, MessageDescriptor};
use prost_types::field_descriptor_proto::{Label as ProtoLabel, Type as ProtoType};
use prost_types::FieldDescriptorProto;
use std::collections::HashMap;
use std::sync::Arc;

/// Field cardinality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    /// Singular field
    Optional,
    /// Singular field that must be set for the message to be initialized
    Required,
    /// Repeated field or map
    Repeated,
}

/// How the presence of a field is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Repeated and map fields have no presence
    None,
    /// Present iff the value differs from the type default (proto3 scalars)
    Implicit,
    /// Explicit presence bit at this index
    Hasbit(u32),
    /// Member of the real oneof at this index
    Oneof(u32),
}

/// Layout of an enum type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumLayout {
    full_name: String,
    closed: bool,
    values: Vec<i32>,
    default: i32,
}

impl EnumLayout {
    fn from_descriptor(desc: &EnumDescriptor) -> Self {
        let syntax = ProtoSyntax::try_from(desc.parent_file().file_descriptor_proto().syntax())
            .unwrap_or(ProtoSyntax::Proto2);
        let mut values: Vec<i32> = desc.values().map(|v| v.number()).collect();
        let default = values.first().copied().unwrap_or(0);
        values.sort_unstable();
        values.dedup();
        Self {
            full_name: desc.full_name().to_string(),
            closed: syntax == ProtoSyntax::Proto2,
            values,
            default,
        }
    }

    /// Fully qualified enum name
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Closed enums reject numbers they do not declare
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true if `number` is declared by the enum
    pub fn contains(&self, number: i32) -> bool {
        self.values.binary_search(&number).is_ok()
    }

    /// Number of the first declared value
    pub fn default_number(&self) -> i32 {
        self.default
    }
}

/// Value kind of a field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// `double`
    Double,
    /// `float`
    Float,
    /// `int32`
    Int32,
    /// `int64`
    Int64,
    /// `uint32`
    UInt32,
    /// `uint64`
    UInt64,
    /// `sint32` (zig-zag)
    SInt32,
    /// `sint64` (zig-zag)
    SInt64,
    /// `fixed32`
    Fixed32,
    /// `fixed64`
    Fixed64,
    /// `sfixed32`
    SFixed32,
    /// `sfixed64`
    SFixed64,
    /// `bool`
    Bool,
    /// `string` (UTF-8 validated)
    String,
    /// `bytes`
    Bytes,
    /// Enum
    Enum(Arc<EnumLayout>),
    /// Embedded message; index of its layout in the registry
    Message(u32),
    /// Group-encoded message; index of its layout in the registry
    Group(u32),
}

impl FieldKind {
    /// Short protobuf name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Double => "double",
            FieldKind::Float => "float",
            FieldKind::Int32 => "int32",
            FieldKind::Int64 => "int64",
            FieldKind::UInt32 => "uint32",
            FieldKind::UInt64 => "uint64",
            FieldKind::SInt32 => "sint32",
            FieldKind::SInt64 => "sint64",
            FieldKind::Fixed32 => "fixed32",
            FieldKind::Fixed64 => "fixed64",
            FieldKind::SFixed32 => "sfixed32",
            FieldKind::SFixed64 => "sfixed64",
            FieldKind::Bool => "bool",
            FieldKind::String => "string",
            FieldKind::Bytes => "bytes",
            FieldKind::Enum(_) => "enum",
            FieldKind::Message(_) => "message",
            FieldKind::Group(_) => "group",
        }
    }

    /// Registry index of a message or group kind
    pub fn message_index(&self) -> Option<u32> {
        match self {
            FieldKind::Message(index) | FieldKind::Group(index) => Some(*index),
            _ => None,
        }
    }

    /// Returns true for string and bytes
    pub fn is_string_like(&self) -> bool {
        matches!(self, FieldKind::String | FieldKind::Bytes)
    }

    /// Returns true for kinds that can use packed repeated encoding
    pub fn is_packable(&self) -> bool {
        !matches!(
            self,
            FieldKind::String | FieldKind::Bytes | FieldKind::Message(_) | FieldKind::Group(_)
        )
    }

    /// Type default for scalar kinds
    pub(crate) fn zero(&self) -> Option<Scalar> {
        Some(match self {
            FieldKind::Double => Scalar::F64(0.0),
            FieldKind::Float => Scalar::F32(0.0),
            FieldKind::Int32 | FieldKind::SInt32 | FieldKind::SFixed32 => Scalar::I32(0),
            FieldKind::Int64 | FieldKind::SInt64 | FieldKind::SFixed64 => Scalar::I64(0),
            FieldKind::UInt32 | FieldKind::Fixed32 => Scalar::U32(0),
            FieldKind::UInt64 | FieldKind::Fixed64 => Scalar::U64(0),
            FieldKind::Bool => Scalar::Bool(false),
            FieldKind::Enum(layout) => Scalar::I32(layout.default),
            FieldKind::String | FieldKind::Bytes | FieldKind::Message(_) | FieldKind::Group(_) => {
                return None
            }
        })
    }
}

/// Default value of a singular field
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DefaultValue {
    /// Repeated, map and message fields
    None,
    /// Numeric, bool and enum fields
    Scalar(Scalar),
    /// String and bytes fields
    Bytes(Box<[u8]>),
}

/// Key and value kinds of a map field
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MapLayout {
    pub(crate) key: FieldKind,
    pub(crate) value: FieldKind,
}

/// Layout of a single field
#[derive(Debug, Clone)]
pub struct FieldLayout {
    pub(crate) name: String,
    pub(crate) full_name: String,
    pub(crate) number: u32,
    pub(crate) kind: FieldKind,
    pub(crate) label: Label,
    pub(crate) presence: Presence,
    pub(crate) packed: bool,
    pub(crate) map: Option<MapLayout>,
    pub(crate) extension: bool,
    pub(crate) default: DefaultValue,
}

impl FieldLayout {
    /// Field name as declared
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified field name
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Field number
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Value kind (for maps, the kind of the entry message)
    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    /// Cardinality
    pub fn label(&self) -> Label {
        self.label
    }

    /// How presence is tracked
    pub fn presence(&self) -> Presence {
        self.presence
    }

    /// Returns true for repeated fields (maps included)
    pub fn is_repeated(&self) -> bool {
        self.label == Label::Repeated
    }

    /// Returns true for map fields
    pub fn is_map(&self) -> bool {
        self.map.is_some()
    }

    /// Returns true for repeated fields encoded packed
    pub fn is_packed(&self) -> bool {
        self.packed
    }

    /// Returns true if the field is an extension
    pub fn is_extension(&self) -> bool {
        self.extension
    }

    /// Returns true for singular message and group fields
    pub(crate) fn is_singular_message(&self) -> bool {
        self.label != Label::Repeated && self.kind.message_index().is_some()
    }

    /// Key and value kinds of a map field
    pub(crate) fn map_kinds(&self) -> Result<&MapLayout> {
        self.map
            .as_ref()
            .ok_or_else(|| Error::invalid_op(&self.full_name, "not a map field"))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OneofLayout {
    pub(crate) name: String,
    pub(crate) fields: Vec<u32>,
}

/// Layout of a message type
#[derive(Debug, Clone)]
pub struct MessageLayout {
    full_name: String,
    syntax: ProtoSyntax,
    fields: Vec<FieldLayout>,
    oneofs: Vec<OneofLayout>,
    hasbits: u32,
    map_entry: bool,
}

impl MessageLayout {
    /// Fully qualified message name
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Syntax of the file declaring the message
    pub fn syntax(&self) -> ProtoSyntax {
        self.syntax
    }

    /// Fields (extensions included) in ascending field-number order
    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    /// Field with the given number
    pub fn field(&self, number: u32) -> Option<&FieldLayout> {
        self.slot(number).map(|slot| &self.fields[slot])
    }

    /// Field with the given name (extensions by full name)
    pub fn field_by_name(&self, name: &str) -> Option<&FieldLayout> {
        self.fields
            .iter()
            .find(|f| (!f.extension && f.name == name) || (f.extension && f.full_name == name))
    }

    /// Slot index of the field with the given number
    pub(crate) fn slot(&self, number: u32) -> Option<usize> {
        self.fields.binary_search_by_key(&number, |f| f.number).ok()
    }

    /// Number of presence bits per instance
    pub fn hasbit_count(&self) -> u32 {
        self.hasbits
    }

    /// Number of real (non-synthetic) oneofs
    pub fn oneof_count(&self) -> usize {
        self.oneofs.len()
    }

    pub(crate) fn oneof_index(&self, name: &str) -> Option<usize> {
        self.oneofs.iter().position(|o| o.name == name)
    }

    pub(crate) fn oneof(&self, index: usize) -> Option<&OneofLayout> {
        self.oneofs.get(index)
    }

    /// Returns true for synthesized map entry messages
    pub fn is_map_entry(&self) -> bool {
        self.map_entry
    }
}

/// Computes layouts for all messages of a pool
pub(crate) struct LayoutBuilder<'a> {
    by_name: &'a HashMap<String, u32>,
    enums: HashMap<String, Arc<EnumLayout>>,
}

impl<'a> LayoutBuilder<'a> {
    pub(crate) fn new(by_name: &'a HashMap<String, u32>) -> Self {
        Self {
            by_name,
            enums: HashMap::new(),
        }
    }

    pub(crate) fn build(&mut self, desc: &MessageDescriptor) -> Result<MessageLayout> {
        let syntax =
            ProtoSyntax::try_from(desc.parent_file().file_descriptor_proto().syntax())?;
        let proto = desc.descriptor_proto();

        // Synthetic oneofs (proto3 `optional`) are not real oneofs
        let mut real_oneof = vec![None; proto.oneof_decl.len()];
        let mut oneofs = Vec::new();
        for (index, decl) in proto.oneof_decl.iter().enumerate() {
            let synthetic = proto.field.iter().any(|f| {
                f.oneof_index == Some(index as i32) && f.proto3_optional.unwrap_or(false)
            });
            if !synthetic {
                real_oneof[index] = Some(oneofs.len() as u32);
                oneofs.push(OneofLayout {
                    name: decl.name().to_string(),
                    fields: Vec::new(),
                });
            }
        }

        let mut fields = Vec::new();
        let mut hasbits = 0u32;
        for field in desc.fields() {
            let oneof = field
                .field_descriptor_proto()
                .oneof_index
                .and_then(|i| real_oneof.get(i as usize).copied().flatten());
            fields.push(self.field(&field, syntax, oneof, &mut hasbits)?);
        }
        for ext in desc.extensions() {
            fields.push(self.extension(&ext, &mut hasbits)?);
        }
        fields.sort_by_key(|f| f.number);

        for window in fields.windows(2) {
            if window[0].number == window[1].number {
                return Err(Error::descriptor_build(format!(
                    "message '{}' has two fields numbered {}",
                    desc.full_name(),
                    window[0].number
                )));
            }
        }
        for field in &fields {
            if let Presence::Oneof(index) = field.presence {
                oneofs[index as usize].fields.push(field.number);
            }
        }

        Ok(MessageLayout {
            full_name: desc.full_name().to_string(),
            syntax,
            fields,
            oneofs,
            hasbits,
            map_entry: desc.is_map_entry(),
        })
    }

    fn field(
        &mut self,
        field: &FieldDescriptor,
        syntax: ProtoSyntax,
        oneof: Option<u32>,
        hasbits: &mut u32,
    ) -> Result<FieldLayout> {
        let proto = field.field_descriptor_proto();
        let kind = self.kind(field.kind(), proto)?;
        let label = label_of(proto);

        let map = match field.kind() {
            Kind::Message(entry) if entry.is_map_entry() && label == Label::Repeated => {
                Some(self.map_layout(&entry)?)
            }
            _ => None,
        };

        let presence = if label == Label::Repeated {
            Presence::None
        } else if let Some(index) = oneof {
            Presence::Oneof(index)
        } else if kind.message_index().is_some()
            || syntax != ProtoSyntax::Proto3
            || proto.proto3_optional.unwrap_or(false)
        {
            *hasbits += 1;
            Presence::Hasbit(*hasbits - 1)
        } else {
            Presence::Implicit
        };

        let default = if label == Label::Repeated {
            DefaultValue::None
        } else {
            parse_default(&kind, field.kind(), proto.default_value.as_deref(), field.full_name())?
        };

        Ok(FieldLayout {
            name: field.name().to_string(),
            full_name: field.full_name().to_string(),
            number: field.number(),
            packed: label == Label::Repeated && is_packed(&kind, proto, syntax),
            kind,
            label,
            presence,
            map,
            extension: false,
            default,
        })
    }

    fn extension(&mut self, ext: &ExtensionDescriptor, hasbits: &mut u32) -> Result<FieldLayout> {
        let proto = ext.field_descriptor_proto();
        let syntax = ProtoSyntax::try_from(ext.parent_file().file_descriptor_proto().syntax())?;
        let kind = self.kind(ext.kind(), proto)?;
        let label = label_of(proto);

        let presence = if label == Label::Repeated {
            Presence::None
        } else {
            *hasbits += 1;
            Presence::Hasbit(*hasbits - 1)
        };
        let default = if label == Label::Repeated {
            DefaultValue::None
        } else {
            parse_default(&kind, ext.kind(), proto.default_value.as_deref(), ext.full_name())?
        };

        Ok(FieldLayout {
            name: ext.name().to_string(),
            full_name: ext.full_name().to_string(),
            number: ext.number(),
            packed: label == Label::Repeated && is_packed(&kind, proto, syntax),
            kind,
            label,
            presence,
            map: None,
            extension: true,
            default,
        })
    }

    fn map_layout(&mut self, entry: &MessageDescriptor) -> Result<MapLayout> {
        let key = entry.get_field(1);
        let value = entry.get_field(2);
        match (key, value) {
            (Some(key), Some(value)) => Ok(MapLayout {
                key: self.kind(key.kind(), key.field_descriptor_proto())?,
                value: self.kind(value.kind(), value.field_descriptor_proto())?,
            }),
            _ => Err(Error::descriptor_build(format!(
                "map entry '{}' lacks a key or value field",
                entry.full_name()
            ))),
        }
    }

    fn kind(&mut self, kind: Kind, proto: &FieldDescriptorProto) -> Result<FieldKind> {
        Ok(match kind {
            Kind::Double => FieldKind::Double,
            Kind::Float => FieldKind::Float,
            Kind::Int32 => FieldKind::Int32,
            Kind::Int64 => FieldKind::Int64,
            Kind::Uint32 => FieldKind::UInt32,
            Kind::Uint64 => FieldKind::UInt64,
            Kind::Sint32 => FieldKind::SInt32,
            Kind::Sint64 => FieldKind::SInt64,
            Kind::Fixed32 => FieldKind::Fixed32,
            Kind::Fixed64 => FieldKind::Fixed64,
            Kind::Sfixed32 => FieldKind::SFixed32,
            Kind::Sfixed64 => FieldKind::SFixed64,
            Kind::Bool => FieldKind::Bool,
            Kind::String => FieldKind::String,
            Kind::Bytes => FieldKind::Bytes,
            Kind::Enum(desc) => {
                let layout = self
                    .enums
                    .entry(desc.full_name().to_string())
                    .or_insert_with(|| Arc::new(EnumLayout::from_descriptor(&desc)));
                FieldKind::Enum(Arc::clone(layout))
            }
            Kind::Message(desc) => {
                let index = self.by_name.get(desc.full_name()).copied().ok_or_else(|| {
                    Error::descriptor_build(format!("unknown message type '{}'", desc.full_name()))
                })?;
                if proto.r#type() == ProtoType::Group {
                    FieldKind::Group(index)
                } else {
                    FieldKind::Message(index)
                }
            }
        })
    }
}

fn label_of(proto: &FieldDescriptorProto) -> Label {
    match proto.label() {
        ProtoLabel::Repeated => Label::Repeated,
        ProtoLabel::Required => Label::Required,
        ProtoLabel::Optional => Label::Optional,
    }
}

/// proto2 packs only on request; proto3 and editions pack unless told not to
fn is_packed(kind: &FieldKind, proto: &FieldDescriptorProto, syntax: ProtoSyntax) -> bool {
    if !kind.is_packable() {
        return false;
    }
    let explicit = proto.options.as_ref().and_then(|o| o.packed);
    match syntax {
        ProtoSyntax::Proto2 => explicit.unwrap_or(false),
        ProtoSyntax::Proto3 | ProtoSyntax::Editions => explicit.unwrap_or(true),
    }
}

fn parse_default(
    kind: &FieldKind,
    reflect_kind: Kind,
    text: Option<&str>,
    field: &str,
) -> Result<DefaultValue> {
    let invalid = || {
        Error::descriptor_build(format!(
            "invalid default value {:?} for field '{}'",
            text.unwrap_or_default(),
            field
        ))
    };

    let Some(text) = text else {
        return Ok(match kind {
            FieldKind::String | FieldKind::Bytes => DefaultValue::Bytes(Box::default()),
            other => other.zero().map_or(DefaultValue::None, DefaultValue::Scalar),
        });
    };

    let scalar = match kind {
        FieldKind::Double => Scalar::F64(text.parse().map_err(|_| invalid())?),
        FieldKind::Float => Scalar::F32(text.parse().map_err(|_| invalid())?),
        FieldKind::Int32 | FieldKind::SInt32 | FieldKind::SFixed32 => {
            Scalar::I32(text.parse().map_err(|_| invalid())?)
        }
        FieldKind::Int64 | FieldKind::SInt64 | FieldKind::SFixed64 => {
            Scalar::I64(text.parse().map_err(|_| invalid())?)
        }
        FieldKind::UInt32 | FieldKind::Fixed32 => Scalar::U32(text.parse().map_err(|_| invalid())?),
        FieldKind::UInt64 | FieldKind::Fixed64 => Scalar::U64(text.parse().map_err(|_| invalid())?),
        FieldKind::Bool => Scalar::Bool(text.parse().map_err(|_| invalid())?),
        FieldKind::Enum(_) => {
            let Kind::Enum(desc) = reflect_kind else {
                return Err(invalid());
            };
            let value = desc.get_value_by_name(text).ok_or_else(invalid)?;
            Scalar::I32(value.number())
        }
        FieldKind::String => return Ok(DefaultValue::Bytes(text.as_bytes().into())),
        FieldKind::Bytes => {
            let bytes = unescape_bytes(text).ok_or_else(invalid)?;
            return Ok(DefaultValue::Bytes(bytes.into()));
        }
        FieldKind::Message(_) | FieldKind::Group(_) => return Err(invalid()),
    };
    Ok(DefaultValue::Scalar(scalar))
}

/// Undo the C-style escaping descriptors use for `bytes` defaults
fn unescape_bytes(text: &str) -> Option<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let escape = *bytes.get(i + 1)?;
        i += 2;
        match escape {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0C),
            b'v' => out.push(0x0B),
            b'\\' | b'\'' | b'"' | b'?' => out.push(escape),
            b'0'..=b'7' => {
                let mut value = (escape - b'0') as u32;
                for _ in 0..2 {
                    match bytes.get(i) {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + (d - b'0') as u32;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                out.push(u8::try_from(value).ok()?);
            }
            b'x' | b'X' => {
                let mut value = 0u32;
                let mut digits = 0;
                while digits < 2 {
                    match bytes.get(i).and_then(|d| (*d as char).to_digit(16)) {
                        Some(d) => {
                            value = value * 16 + d;
                            i += 1;
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    return None;
                }
                out.push(value as u8);
            }
            _ => return None,
        }
    }
    Some(out)
}
