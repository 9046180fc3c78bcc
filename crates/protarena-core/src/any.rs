//! `google.protobuf.Any` support.
//!
//! An `Any` is an ordinary message with a `type_url` string (field 1) and
//! the encoded payload as `value` bytes (field 2). Packing encodes a message
//! into it; unpacking decodes the payload once its type is known. When the
//! URL names a type the registry does not have, the payload stays opaque
//! and fully serializable.

use crate::arena::{Arena, MessageId};
use crate::descriptor::{MessageType, Registry};
use crate::error::{Error, Result};
use crate::value::Value;
use crate::wire;
use tracing::debug;

/// Full name of the `Any` message type
pub const ANY_TYPE_NAME: &str = "google.protobuf.Any";

/// Prefix of the type URLs written by [`pack_any`]
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

const TYPE_URL_FIELD: u32 = 1;
const VALUE_FIELD: u32 = 2;

/// Outcome of [`resolve_any`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyPayload {
    /// The type was found and the payload decoded into this message
    Resolved(MessageId),
    /// The type is unknown; the raw contents are preserved
    Opaque {
        /// Type URL as stored in the `Any`
        type_url: String,
        /// Encoded payload
        value: Vec<u8>,
    },
}

fn require_any(arena: &Arena, any: MessageId) -> Result<()> {
    let ty = arena.message_type(any)?;
    if ty.full_name() != ANY_TYPE_NAME {
        return Err(Error::type_mismatch(ANY_TYPE_NAME, ty.full_name()));
    }
    Ok(())
}

/// Type URL and payload of an `Any`, copied out of the arena
fn contents(arena: &Arena, any: MessageId) -> Result<(String, Vec<u8>)> {
    require_any(arena, any)?;
    let view = arena.view(any)?;
    let type_url = view.get(TYPE_URL_FIELD)?.as_str().unwrap_or_default().to_string();
    let value = view.get(VALUE_FIELD)?.as_bytes().unwrap_or_default().to_vec();
    Ok((type_url, value))
}

fn type_name(type_url: &str) -> &str {
    match type_url.rfind('/') {
        Some(pos) => &type_url[pos + 1..],
        None => type_url,
    }
}

/// Store `payload` in the `Any` message `any`
///
/// Both messages must live in `arena`.
pub fn pack_any(arena: &mut Arena, any: MessageId, payload: MessageId) -> Result<()> {
    require_any(arena, any)?;
    let payload_ty = arena.message_type(payload)?;
    let encoded = wire::encode(arena, payload)?;
    let type_url = format!("{}{}", TYPE_URL_PREFIX, payload_ty.full_name());

    let mut view = arena.view_mut(any)?;
    view.set(TYPE_URL_FIELD, Value::String(&type_url))?;
    view.set(VALUE_FIELD, Value::Bytes(&encoded))
}

/// Decode the payload of `any` as a new message of type `ty`
///
/// Fails with [`Error::TypeMismatch`] before decoding when the stored type
/// URL names a different type.
pub fn unpack_any(arena: &mut Arena, any: MessageId, ty: &MessageType) -> Result<MessageId> {
    let (type_url, value) = contents(arena, any)?;
    if type_name(&type_url) != ty.full_name() {
        return Err(Error::type_mismatch(ty.full_name(), type_url));
    }
    wire::decode(arena, ty, &value)
}

/// Decode the payload of `any` using the type named by its URL
///
/// A URL the registry cannot resolve is not an error: the contents come
/// back as [`AnyPayload::Opaque`].
pub fn resolve_any(arena: &mut Arena, registry: &Registry, any: MessageId) -> Result<AnyPayload> {
    let (type_url, value) = contents(arena, any)?;
    match registry.resolve_type_url(&type_url) {
        Some(ty) => Ok(AnyPayload::Resolved(wire::decode(arena, &ty, &value)?)),
        None => {
            debug!(type_url = %type_url, "Any payload left opaque");
            Ok(AnyPayload::Opaque { type_url, value })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixture_set;
    use pretty_assertions::assert_eq;

    fn registry() -> Registry {
        Registry::from_file_descriptor_set(fixture_set()).unwrap()
    }

    #[test]
    fn test_pack_and_unpack() {
        let registry = registry();
        let all = registry.message("test3.AllTypes").unwrap();
        let nested = registry.message("test3.Nested").unwrap();
        let mut arena = Arena::new();

        let msg = arena.new_message(&all).unwrap();
        let any = arena.view_mut(msg).unwrap().mutable_message(19).unwrap();
        let payload = arena.new_message(&nested).unwrap();
        arena.view_mut(payload).unwrap().set(1, Value::I32(12)).unwrap();
        pack_any(&mut arena, any, payload).unwrap();

        let view = arena.view(any).unwrap();
        assert_eq!(
            view.get(1).unwrap(),
            Value::String("type.googleapis.com/test3.Nested")
        );
        assert_eq!(view.get(2).unwrap(), Value::Bytes(&[0x08, 0x0C]));

        let unpacked = unpack_any(&mut arena, any, &nested).unwrap();
        assert_eq!(arena.view(unpacked).unwrap().get(1).unwrap(), Value::I32(12));

        assert!(matches!(
            unpack_any(&mut arena, any, &all),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            pack_any(&mut arena, payload, any),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_resolve_unknown_type_is_opaque() {
        let registry = registry();
        let any_ty = registry.message(ANY_TYPE_NAME).unwrap();
        let mut arena = Arena::new();
        let any = arena.new_message(&any_ty).unwrap();
        let mut view = arena.view_mut(any).unwrap();
        view.set(1, Value::String("type.googleapis.com/other.Missing")).unwrap();
        view.set(2, Value::Bytes(&[0x08, 0x01])).unwrap();

        assert_eq!(
            resolve_any(&mut arena, &registry, any).unwrap(),
            AnyPayload::Opaque {
                type_url: "type.googleapis.com/other.Missing".to_string(),
                value: vec![0x08, 0x01],
            }
        );
        // The opaque Any still serializes unchanged
        let bytes = wire::encode(&arena, any).unwrap();
        let copy = wire::decode(&mut arena, &any_ty, &bytes).unwrap();
        assert_eq!(
            arena.view(copy).unwrap().get(2).unwrap(),
            Value::Bytes(&[0x08, 0x01])
        );

        arena
            .view_mut(any)
            .unwrap()
            .set(1, Value::String("example.com/x/test3.Nested"))
            .unwrap();
        let AnyPayload::Resolved(id) = resolve_any(&mut arena, &registry, any).unwrap() else {
            panic!("type should resolve");
        };
        assert_eq!(arena.view(id).unwrap().get(1).unwrap(), Value::I32(1));
    }
}
