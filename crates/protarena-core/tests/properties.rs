//! End-to-end behavior of the message engine: round trips, merge rules,
//! deterministic map output, numeric boundaries, unknown-field survival and
//! arena lifetimes.

#[path = "../src/testing.rs"]
mod testing;

use pretty_assertions::assert_eq;
use protarena_core::{
    deep_copy, merge_into, merge_within, wire, Arena, Error, MapKey, MessageId, Registry, Value,
    WireErrorKind,
};

fn registry() -> Registry {
    Registry::from_file_descriptor_set(testing::fixture_set()).unwrap()
}

/// A message with every kind of field populated
fn populated(arena: &mut Arena, registry: &Registry) -> MessageId {
    let ty = registry.message("test3.AllTypes").unwrap();
    let msg = arena.new_message(&ty).unwrap();
    let mut view = arena.view_mut(msg).unwrap();
    view.set(1, Value::I32(-5)).unwrap();
    view.set(2, Value::I64(i64::MAX)).unwrap();
    view.set(3, Value::U32(u32::MAX)).unwrap();
    view.set(5, Value::I32(i32::MIN)).unwrap();
    view.set(9, Value::I32(-9)).unwrap();
    view.set(11, Value::F32(-0.0)).unwrap();
    view.set(12, Value::F64(2.5)).unwrap();
    view.set(13, Value::Bool(true)).unwrap();
    view.set(14, Value::String("héllo")).unwrap();
    view.set(15, Value::Bytes(&[0, 159, 146, 150])).unwrap();
    view.set(21, Value::Enum(2)).unwrap();
    view.set(60, Value::I32(0)).unwrap();
    view.set(113, Value::String("picked")).unwrap();
    for v in [3, -1, 7] {
        view.push(31, Value::I32(v)).unwrap();
    }
    view.push(44, Value::String("x")).unwrap();
    view.push(44, Value::String("")).unwrap();
    view.map_insert(56, "one", Value::I32(1)).unwrap();
    view.map_insert(56, "two", Value::I32(2)).unwrap();
    let nested = view.mutable_message(18).unwrap();
    let keyed = view.map_message(57, -3i32).unwrap();
    let element = view.push_message(48).unwrap();

    arena.view_mut(nested).unwrap().set(1, Value::I32(10)).unwrap();
    arena.view_mut(keyed).unwrap().set(1, Value::I32(20)).unwrap();
    let grandchild = arena.view_mut(element).unwrap().mutable_message(2).unwrap();
    arena.view_mut(grandchild).unwrap().set(1, Value::I32(30)).unwrap();
    msg
}

#[test]
fn test_round_trip_is_field_wise_equal() {
    let registry = registry();
    let ty = registry.message("test3.AllTypes").unwrap();
    let mut arena = Arena::new();
    let msg = populated(&mut arena, &registry);

    let bytes = wire::encode(&arena, msg).unwrap();
    let copy = wire::decode(&mut arena, &ty, &bytes).unwrap();

    let (a, b) = (arena.view(msg).unwrap(), arena.view(copy).unwrap());
    for number in [1, 2, 3, 5, 9, 12, 13, 14, 15, 21, 60, 113] {
        assert_eq!(a.get(number).unwrap(), b.get(number).unwrap(), "field {}", number);
    }
    match b.get(11).unwrap() {
        Value::F32(v) => assert!(v == 0.0 && v.is_sign_negative()),
        other => panic!("unexpected value {:?}", other),
    }
    assert!(b.has(60).unwrap());
    assert_eq!(b.which_oneof("choice").unwrap(), Some(113));
    assert_eq!(a.list(31).unwrap(), b.list(31).unwrap());
    assert_eq!(a.list(44).unwrap(), b.list(44).unwrap());
    assert_eq!(b.map_len(56).unwrap(), 2);
    assert_eq!(b.map_get(56, &MapKey::from("two")).unwrap(), Some(Value::I32(2)));

    let keyed = b.map_get(57, &MapKey::I32(-3)).unwrap().unwrap();
    let keyed = arena.view(keyed.as_message().unwrap()).unwrap();
    assert_eq!(keyed.get(1).unwrap(), Value::I32(20));

    let element = arena.view(b.get_at(48, 0).unwrap().as_message().unwrap()).unwrap();
    let grandchild = element.message(2).unwrap().unwrap();
    assert_eq!(grandchild.get(1).unwrap(), Value::I32(30));

    // Re-encoding the decoded copy is byte-identical
    assert_eq!(wire::encode(&arena, copy).unwrap(), bytes);
}

#[test]
fn test_merge_idempotence() {
    let registry = registry();
    let ty = registry.message("test3.AllTypes").unwrap();
    let mut src_arena = Arena::new();
    let src = src_arena.new_message(&ty).unwrap();
    let mut view = src_arena.view_mut(src).unwrap();
    view.set(1, Value::I32(4)).unwrap();
    view.set(14, Value::String("s")).unwrap();
    view.push(31, Value::I32(9)).unwrap();

    let mut dst_arena = Arena::new();
    let dst = dst_arena.new_message(&ty).unwrap();
    merge_into(&src_arena, src, &mut dst_arena, dst).unwrap();
    merge_into(&src_arena, src, &mut dst_arena, dst).unwrap();

    let view = dst_arena.view(dst).unwrap();
    // Singular fields are idempotent under repeated merges
    assert_eq!(view.get(1).unwrap(), Value::I32(4));
    assert_eq!(view.get(14).unwrap(), Value::String("s"));
    // Repeated fields are not: each merge appends
    assert_eq!(view.list(31).unwrap(), vec![Value::I32(9), Value::I32(9)]);
}

#[test]
fn test_map_output_is_sorted() {
    let registry = registry();
    let ty = registry.message("test3.AllTypes").unwrap();

    let encode_in_order = |keys: &[&str]| {
        let mut arena = Arena::new();
        let msg = arena.new_message(&ty).unwrap();
        let mut view = arena.view_mut(msg).unwrap();
        for key in keys {
            view.map_insert(56, *key, Value::I32(1)).unwrap();
        }
        let bytes = wire::encode(&arena, msg).unwrap();
        let order: Vec<String> = arena
            .view(msg)
            .unwrap()
            .map_entries(56)
            .unwrap()
            .into_iter()
            .map(|(key, _)| match key {
                MapKey::String(s) => s.clone(),
                other => panic!("unexpected key {:?}", other),
            })
            .collect();
        (bytes, order)
    };

    let (bytes, order) = encode_in_order(&["c", "a", "b"]);
    assert_eq!(order, vec!["a", "b", "c"]);

    // Entries appear on the wire in key order
    let a = bytes.iter().position(|&b| b == b'a').unwrap();
    let b = bytes.iter().position(|&b| b == b'b').unwrap();
    let c = bytes.iter().position(|&b| b == b'c').unwrap();
    assert!(a < b && b < c);

    // Same content inserted in another order encodes identically
    let (again, _) = encode_in_order(&["b", "c", "a"]);
    assert_eq!(bytes, again);
}

#[test]
fn test_duplicate_map_keys_last_write_wins() {
    let registry = registry();
    let ty = registry.message("test3.AllTypes").unwrap();
    let mut arena = Arena::new();
    let input = [
        0xC2, 0x03, 0x05, 0x0A, 0x01, b'k', 0x10, 0x01, // "k" => 1
        0xC2, 0x03, 0x05, 0x0A, 0x01, b'k', 0x10, 0x07, // "k" => 7
    ];
    let msg = wire::decode(&mut arena, &ty, &input).unwrap();
    let view = arena.view(msg).unwrap();
    assert_eq!(view.map_len(56).unwrap(), 1);
    assert_eq!(view.map_get(56, &MapKey::from("k")).unwrap(), Some(Value::I32(7)));
}

#[test]
fn test_int32_boundaries() {
    let registry = registry();
    let ty = registry.message("test3.AllTypes").unwrap();
    let mut arena = Arena::new();

    let err = wire::decode(&mut arena, &ty, &[0x08, 0x80, 0x80, 0x80, 0x80, 0x08]).unwrap_err();
    assert!(matches!(
        err,
        Error::MalformedWire {
            kind: WireErrorKind::ValueOutOfRange { field: 1, .. },
            ..
        }
    ));

    for value in [i32::MAX, i32::MIN] {
        let msg = arena.new_message(&ty).unwrap();
        arena.view_mut(msg).unwrap().set(1, Value::I32(value)).unwrap();
        let bytes = wire::encode(&arena, msg).unwrap();
        let copy = wire::decode(&mut arena, &ty, &bytes).unwrap();
        assert_eq!(arena.view(copy).unwrap().get(1).unwrap(), Value::I32(value));
    }
}

#[test]
fn test_unknown_fields_survive_byte_for_byte() {
    let registry = registry();
    let full = registry.message("test3.AllTypes").unwrap();
    // Declares only field 1, with the same type as AllTypes.optional_int32
    let narrow = registry.message("test2.Legacy.Item").unwrap();
    let mut arena = Arena::new();

    let msg = populated(&mut arena, &registry);
    let bytes = wire::encode(&arena, msg).unwrap();
    let parsed = wire::decode(&mut arena, &narrow, &bytes).unwrap();
    assert_eq!(arena.view(parsed).unwrap().get(1).unwrap(), Value::I32(-5));

    // Field 1 (one tag byte and a ten byte varint) is known; the rest is not
    let unknown = arena.view(parsed).unwrap().unknown_fields().unwrap();
    assert_eq!(unknown, bytes[11..].to_vec());
    let reencoded = wire::encode(&arena, parsed).unwrap();
    assert_eq!(reencoded, bytes);

    let restored = wire::decode(&mut arena, &full, &reencoded).unwrap();
    assert_eq!(wire::encode(&arena, restored).unwrap(), bytes);
}

#[test]
fn test_utf8_only_enforced_for_strings() {
    let registry = registry();
    let ty = registry.message("test3.AllTypes").unwrap();
    let mut arena = Arena::new();

    let err = wire::decode(&mut arena, &ty, &[0x72, 0x01, 0xC0]).unwrap_err();
    assert!(matches!(
        err,
        Error::MalformedWire {
            offset: 2,
            kind: WireErrorKind::InvalidUtf8 { field: 14 }
        }
    ));

    let msg = wire::decode(&mut arena, &ty, &[0x7A, 0x01, 0xC0]).unwrap();
    assert_eq!(arena.view(msg).unwrap().get(15).unwrap(), Value::Bytes(&[0xC0]));
}

#[test]
fn test_copies_outlive_their_source_arena() {
    let registry = registry();
    let mut dst_arena = Arena::new();

    let copy = {
        let mut src_arena = Arena::new();
        let msg = populated(&mut src_arena, &registry);
        let copy = deep_copy(&src_arena, msg, &mut dst_arena).unwrap();
        let stats = src_arena.teardown();
        assert!(stats.messages > 0);
        copy
    };

    let view = dst_arena.view(copy).unwrap();
    assert_eq!(view.get(14).unwrap(), Value::String("héllo"));
    let nested = view.message(18).unwrap().unwrap();
    assert_eq!(nested.get(1).unwrap(), Value::I32(10));
}

#[test]
fn test_fused_arenas_share_lifetime() {
    let registry = registry();
    let ty = registry.message("test3.Nested").unwrap();
    let mut left = Arena::new();
    let mut right = Arena::new();

    let a = left.new_message(&ty).unwrap();
    let b = right.new_message(&ty).unwrap();
    right.view_mut(b).unwrap().set(1, Value::I32(8)).unwrap();
    assert!(matches!(left.view(b), Err(Error::ForeignHandle { .. })));

    left.fuse(right).unwrap();
    // Handles from either side resolve through the survivor
    assert_eq!(left.view(b).unwrap().get(1).unwrap(), Value::I32(8));
    merge_within(&mut left, b, a).unwrap();
    assert_eq!(left.view(a).unwrap().get(1).unwrap(), Value::I32(8));
}
