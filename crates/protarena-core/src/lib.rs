//! # protarena-core
//!
//! An arena-backed dynamic Protocol Buffers runtime: messages are described
//! at runtime by descriptors, stored in bump-allocated arenas, and
//! serialized with the standard binary wire format.
//!
//! This crate provides the core functionality for:
//! - Allocating message graphs in arenas with whole-arena teardown
//! - Reading and mutating fields, repeated fields and maps by field number
//! - Merging and deep-copying messages, including across arenas
//! - Encoding and decoding the binary wire format with unknown-field retention
//!
//! ## Architecture
//!
//! - [`arena`]: bump allocator, object slabs, finalizers, fusing
//! - [`descriptor`]: registry of message layouts computed from a descriptor pool
//! - [`value`]: values, map keys and the storage shapes of arrays and maps
//! - [`message`]: message construction, views and field access
//! - [`merge`]: merge and deep copy
//! - [`wire`]: binary encoder and decoder
//! - [`any`]: `google.protobuf.Any` packing and resolution
//! - [`error`]: error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use protarena_core::{wire, Arena, Registry, Value};
//!
//! let registry = Registry::from_file("descriptors.pb")?;
//! let ty = registry.message("example.Person").expect("type is registered");
//!
//! let mut arena = Arena::new();
//! let person = arena.new_message(&ty)?;
//! arena.view_mut(person)?.set(1, Value::String("Ada"))?;
//!
//! let bytes = wire::encode(&arena, person)?;
//! let copy = wire::decode(&mut arena, &ty, &bytes)?;
//! assert_eq!(arena.view(copy)?.get(1)?, Value::String("Ada"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod any;
pub mod arena;
pub mod descriptor;
pub mod error;
pub mod merge;
pub mod message;
pub mod value;
pub mod wire;

#[cfg(test)]
mod testing;

// Re-export primary types for convenience
pub use any::{pack_any, resolve_any, unpack_any, AnyPayload};
pub use arena::{Arena, ArenaConfig, ArenaId, ArenaStats, FuseError, MessageId, Span};
pub use descriptor::{
    FieldKind, FieldLayout, Label, MessageLayout, MessageType, Presence, ProtoSyntax, Registry,
};
pub use error::{Error, Result, WireErrorKind};
pub use merge::{deep_copy, merge_into, merge_within};
pub use message::{MessageMut, MessageView};
pub use value::{MapKey, Optional, Value};
pub use wire::{DecodeOptions, WireType};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum valid protobuf field number (2^29 - 1)
pub const MAX_FIELD_NUMBER: u32 = 536_870_911;

/// Default bound on message nesting for decode, merge and encode
pub const MAX_DEPTH: u32 = 100;
