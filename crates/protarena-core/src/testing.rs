//! Descriptor fixtures shared by unit and integration tests.
//!
//! The set is built by hand so the tests need no `protoc`. It mirrors:
//!
//! ```text
//! // google/protobuf/any.proto
//! syntax = "proto3";
//! package google.protobuf;
//! message Any { string type_url = 1; bytes value = 2; }
//!
//! // test3.proto
//! syntax = "proto3";
//! package test3;
//! import "google/protobuf/any.proto";
//! enum Kind { KIND_UNSPECIFIED = 0; KIND_A = 1; KIND_B = 2; }
//! message Nested { int32 a = 1; Nested child = 2; }
//! message AllTypes {
//!   int32 optional_int32 = 1;  ...  bytes optional_bytes = 15;
//!   Nested nested = 18;
//!   google.protobuf.Any any = 19;
//!   Kind kind = 21;
//!   repeated int32 repeated_int32 = 31;
//!   repeated string repeated_string = 44;
//!   repeated Nested repeated_nested = 48;
//!   map<string, int32> map_string_int32 = 56;
//!   map<int32, Nested> map_int32_nested = 57;
//!   optional int32 proto3_optional_int32 = 60;
//!   oneof choice { uint32 oneof_uint32 = 111; Nested oneof_nested = 112; string oneof_string = 113; }
//! }
//!
//! // test2.proto
//! syntax = "proto2";
//! package test2;
//! enum Color { RED = 1; GREEN = 2; BLUE = 3; }
//! message Legacy {
//!   optional int32 count = 1 [default = 42];
//!   optional string label = 2 [default = "hi"];
//!   optional Color color = 3 [default = GREEN];
//!   required int64 id = 4;
//!   repeated int32 packed_vals = 5 [packed = true];
//!   repeated int32 unpacked_vals = 6;
//!   optional group Item = 7 { optional int32 value = 1; }
//!   extensions 100 to 199;
//! }
//! extend Legacy { optional int32 ext_int = 100; }
//! ```

use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    descriptor_proto::ExtensionRange, DescriptorProto, EnumDescriptorProto,
    EnumValueDescriptorProto, FieldDescriptorProto, FieldOptions, FileDescriptorProto,
    FileDescriptorSet, MessageOptions, OneofDescriptorProto,
};

fn scalar(name: &str, number: i32, label: Label, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(ty as i32),
        ..Default::default()
    }
}

fn named(name: &str, number: i32, label: Label, ty: Type, type_name: &str) -> FieldDescriptorProto {
    FieldDescriptorProto {
        type_name: Some(type_name.to_string()),
        ..scalar(name, number, label, ty)
    }
}

fn in_oneof(mut field: FieldDescriptorProto, index: i32) -> FieldDescriptorProto {
    field.oneof_index = Some(index);
    field
}

fn map_entry(name: &str, key: Type, value: FieldDescriptorProto) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: vec![scalar("key", 1, Label::Optional, key), value],
        options: Some(MessageOptions {
            map_entry: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn enumeration(name: &str, values: &[(&str, i32)]) -> EnumDescriptorProto {
    EnumDescriptorProto {
        name: Some(name.to_string()),
        value: values
            .iter()
            .map(|(name, number)| EnumValueDescriptorProto {
                name: Some(name.to_string()),
                number: Some(*number),
                options: None,
            })
            .collect(),
        ..Default::default()
    }
}

fn any_file() -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some("google/protobuf/any.proto".to_string()),
        package: Some("google.protobuf".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![DescriptorProto {
            name: Some("Any".to_string()),
            field: vec![
                scalar("type_url", 1, Label::Optional, Type::String),
                scalar("value", 2, Label::Optional, Type::Bytes),
            ],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn test3_file() -> FileDescriptorProto {
    use Label::{Optional, Repeated};

    let scalars = [
        ("optional_int32", Type::Int32),
        ("optional_int64", Type::Int64),
        ("optional_uint32", Type::Uint32),
        ("optional_uint64", Type::Uint64),
        ("optional_sint32", Type::Sint32),
        ("optional_sint64", Type::Sint64),
        ("optional_fixed32", Type::Fixed32),
        ("optional_fixed64", Type::Fixed64),
        ("optional_sfixed32", Type::Sfixed32),
        ("optional_sfixed64", Type::Sfixed64),
        ("optional_float", Type::Float),
        ("optional_double", Type::Double),
        ("optional_bool", Type::Bool),
        ("optional_string", Type::String),
        ("optional_bytes", Type::Bytes),
    ];
    let mut fields: Vec<FieldDescriptorProto> = scalars
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| scalar(name, i as i32 + 1, Optional, *ty))
        .collect();

    fields.extend([
        named("nested", 18, Optional, Type::Message, ".test3.Nested"),
        named("any", 19, Optional, Type::Message, ".google.protobuf.Any"),
        named("kind", 21, Optional, Type::Enum, ".test3.Kind"),
        scalar("repeated_int32", 31, Repeated, Type::Int32),
        scalar("repeated_string", 44, Repeated, Type::String),
        named("repeated_nested", 48, Repeated, Type::Message, ".test3.Nested"),
        named(
            "map_string_int32",
            56,
            Repeated,
            Type::Message,
            ".test3.AllTypes.MapStringInt32Entry",
        ),
        named(
            "map_int32_nested",
            57,
            Repeated,
            Type::Message,
            ".test3.AllTypes.MapInt32NestedEntry",
        ),
        FieldDescriptorProto {
            proto3_optional: Some(true),
            ..in_oneof(scalar("proto3_optional_int32", 60, Optional, Type::Int32), 1)
        },
        in_oneof(scalar("oneof_uint32", 111, Optional, Type::Uint32), 0),
        in_oneof(
            named("oneof_nested", 112, Optional, Type::Message, ".test3.Nested"),
            0,
        ),
        in_oneof(scalar("oneof_string", 113, Optional, Type::String), 0),
    ]);

    let all_types = DescriptorProto {
        name: Some("AllTypes".to_string()),
        field: fields,
        nested_type: vec![
            map_entry(
                "MapStringInt32Entry",
                Type::String,
                scalar("value", 2, Optional, Type::Int32),
            ),
            map_entry(
                "MapInt32NestedEntry",
                Type::Int32,
                named("value", 2, Optional, Type::Message, ".test3.Nested"),
            ),
        ],
        oneof_decl: vec![
            OneofDescriptorProto {
                name: Some("choice".to_string()),
                options: None,
            },
            OneofDescriptorProto {
                name: Some("_proto3_optional_int32".to_string()),
                options: None,
            },
        ],
        ..Default::default()
    };

    let nested = DescriptorProto {
        name: Some("Nested".to_string()),
        field: vec![
            scalar("a", 1, Optional, Type::Int32),
            named("child", 2, Optional, Type::Message, ".test3.Nested"),
        ],
        ..Default::default()
    };

    FileDescriptorProto {
        name: Some("test3.proto".to_string()),
        package: Some("test3".to_string()),
        dependency: vec!["google/protobuf/any.proto".to_string()],
        syntax: Some("proto3".to_string()),
        message_type: vec![nested, all_types],
        enum_type: vec![enumeration(
            "Kind",
            &[("KIND_UNSPECIFIED", 0), ("KIND_A", 1), ("KIND_B", 2)],
        )],
        ..Default::default()
    }
}

fn test2_file() -> FileDescriptorProto {
    use Label::{Optional, Repeated, Required};

    let legacy = DescriptorProto {
        name: Some("Legacy".to_string()),
        field: vec![
            FieldDescriptorProto {
                default_value: Some("42".to_string()),
                ..scalar("count", 1, Optional, Type::Int32)
            },
            FieldDescriptorProto {
                default_value: Some("hi".to_string()),
                ..scalar("label", 2, Optional, Type::String)
            },
            FieldDescriptorProto {
                default_value: Some("GREEN".to_string()),
                ..named("color", 3, Optional, Type::Enum, ".test2.Color")
            },
            scalar("id", 4, Required, Type::Int64),
            FieldDescriptorProto {
                options: Some(FieldOptions {
                    packed: Some(true),
                    ..Default::default()
                }),
                ..scalar("packed_vals", 5, Repeated, Type::Int32)
            },
            scalar("unpacked_vals", 6, Repeated, Type::Int32),
            named("item", 7, Optional, Type::Group, ".test2.Legacy.Item"),
        ],
        nested_type: vec![DescriptorProto {
            name: Some("Item".to_string()),
            field: vec![scalar("value", 1, Optional, Type::Int32)],
            ..Default::default()
        }],
        extension_range: vec![ExtensionRange {
            start: Some(100),
            end: Some(200),
            options: None,
        }],
        ..Default::default()
    };

    FileDescriptorProto {
        name: Some("test2.proto".to_string()),
        package: Some("test2".to_string()),
        syntax: Some("proto2".to_string()),
        message_type: vec![legacy],
        enum_type: vec![enumeration("Color", &[("RED", 1), ("GREEN", 2), ("BLUE", 3)])],
        extension: vec![FieldDescriptorProto {
            extendee: Some(".test2.Legacy".to_string()),
            ..scalar("ext_int", 100, Optional, Type::Int32)
        }],
        ..Default::default()
    }
}

/// Descriptor set with `google.protobuf.Any`, `test3.*` and `test2.*`
pub(crate) fn fixture_set() -> FileDescriptorSet {
    FileDescriptorSet {
        file: vec![any_file(), test3_file(), test2_file()],
    }
}
