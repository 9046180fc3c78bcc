//! Descriptor registry and message type handles.
//!
//! Descriptors arrive as a `FileDescriptorSet` (or its encoding) and are
//! resolved with [`prost_reflect::DescriptorPool`]. A [`Registry`] computes
//! one [`MessageLayout`] per message in the pool when it is built and never
//! changes afterwards, so it can be cloned and shared freely between threads.

mod layout;

pub use layout::{EnumLayout, FieldKind, FieldLayout, Label, MessageLayout, Presence};
pub(crate) use layout::DefaultValue;

use crate::error::{Error, Result};
use layout::LayoutBuilder;
use prost::Message;
use prost_reflect::{DescriptorPool, MessageDescriptor};
use prost_types::FileDescriptorSet;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Syntax of a `.proto` file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoSyntax {
    /// Proto2 syntax
    Proto2,
    /// Proto3 syntax
    Proto3,
    /// Editions syntax
    Editions,
}

impl ProtoSyntax {
    /// Returns the syntax declaration string
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtoSyntax::Proto2 => "proto2",
            ProtoSyntax::Proto3 => "proto3",
            ProtoSyntax::Editions => "editions",
        }
    }
}

impl TryFrom<&str> for ProtoSyntax {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "" | "proto2" => Ok(ProtoSyntax::Proto2),
            "proto3" => Ok(ProtoSyntax::Proto3),
            "editions" => Ok(ProtoSyntax::Editions),
            _ => Err(Error::descriptor_build(format!(
                "unsupported syntax '{}'",
                value
            ))),
        }
    }
}

pub(crate) struct RegistryInner {
    pool: DescriptorPool,
    layouts: Vec<MessageLayout>,
    by_name: HashMap<String, u32>,
}

/// Immutable set of message layouts built from a descriptor pool
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("messages", &self.inner.layouts.len())
            .finish()
    }
}

impl Registry {
    /// Build layouts for every message in `pool`
    pub fn from_pool(pool: DescriptorPool) -> Result<Self> {
        let by_name: HashMap<String, u32> = pool
            .all_messages()
            .enumerate()
            .map(|(index, desc)| (desc.full_name().to_string(), index as u32))
            .collect();

        let mut builder = LayoutBuilder::new(&by_name);
        let layouts = pool
            .all_messages()
            .map(|desc| builder.build(&desc))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "built registry with {} message layouts from {} files",
            layouts.len(),
            pool.files().len()
        );

        Ok(Self {
            inner: Arc::new(RegistryInner {
                pool,
                layouts,
                by_name,
            }),
        })
    }

    /// Build a registry from a decoded descriptor set
    pub fn from_file_descriptor_set(set: FileDescriptorSet) -> Result<Self> {
        let pool = DescriptorPool::from_file_descriptor_set(set).map_err(|e| {
            Error::descriptor_build(format!("failed to build descriptor pool: {}", e))
        })?;
        Self::from_pool(pool)
    }

    /// Build a registry from an encoded `FileDescriptorSet`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let set = FileDescriptorSet::decode(bytes)?;
        Self::from_file_descriptor_set(set)
    }

    /// Build a registry from a file holding an encoded `FileDescriptorSet`
    /// (as written by `protoc --descriptor_set_out`)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| Error::file_read(path, e))?;
        Self::decode(&bytes)
    }

    /// The underlying descriptor pool
    pub fn pool(&self) -> &DescriptorPool {
        &self.inner.pool
    }

    /// Look up a message type by fully qualified name (a leading `.` is accepted)
    pub fn message(&self, full_name: &str) -> Option<MessageType> {
        let name = full_name.strip_prefix('.').unwrap_or(full_name);
        self.inner.by_name.get(name).map(|&index| MessageType {
            registry: Arc::clone(&self.inner),
            index,
        })
    }

    /// Look up the message type named by an `Any` type URL
    ///
    /// Everything up to and including the last `/` is ignored.
    pub fn resolve_type_url(&self, type_url: &str) -> Option<MessageType> {
        let name = match type_url.rfind('/') {
            Some(pos) => &type_url[pos + 1..],
            None => type_url,
        };
        if name.is_empty() {
            return None;
        }
        self.message(name)
    }

    /// Like [`Registry::resolve_type_url`], failing with
    /// [`Error::UnresolvedType`]
    pub fn require_type_url(&self, type_url: &str) -> Result<MessageType> {
        self.resolve_type_url(type_url)
            .ok_or_else(|| Error::unresolved(type_url))
    }

    /// Every message type in the registry
    pub fn messages(&self) -> impl Iterator<Item = MessageType> + '_ {
        (0..self.inner.layouts.len() as u32).map(|index| MessageType {
            registry: Arc::clone(&self.inner),
            index,
        })
    }

    /// Number of message types
    pub fn len(&self) -> usize {
        self.inner.layouts.len()
    }

    /// Returns true if the registry holds no message types
    pub fn is_empty(&self) -> bool {
        self.inner.layouts.is_empty()
    }
}

static GLOBAL_REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Install the process-wide registry.
///
/// Only the first installation succeeds.
pub fn install_global(registry: Registry) -> Result<()> {
    GLOBAL_REGISTRY
        .set(registry)
        .map_err(|_| Error::GlobalRegistryInstalled)
}

/// The process-wide registry, if one was installed
pub fn global() -> Option<&'static Registry> {
    GLOBAL_REGISTRY.get()
}

/// Handle to one message type of a [`Registry`]
///
/// Two handles are equal iff they designate the same layout of the same
/// registry.
#[derive(Clone)]
pub struct MessageType {
    registry: Arc<RegistryInner>,
    index: u32,
}

impl MessageType {
    /// Fully qualified message name
    pub fn full_name(&self) -> &str {
        self.layout().full_name()
    }

    /// Layout of this message type
    pub fn layout(&self) -> &MessageLayout {
        &self.registry.layouts[self.index as usize]
    }

    /// The registry this type belongs to
    pub fn registry(&self) -> Registry {
        Registry {
            inner: Arc::clone(&self.registry),
        }
    }

    /// Reflection descriptor for this type
    pub fn descriptor(&self) -> Option<MessageDescriptor> {
        self.registry.pool.get_message_by_name(self.full_name())
    }

    /// Field with the given number
    pub fn field(&self, number: u32) -> Result<&FieldLayout> {
        self.layout()
            .field(number)
            .ok_or_else(|| Error::FieldNotFound {
                message: self.full_name().to_string(),
                number,
            })
    }

    /// Slot of the field with the given number, and its layout
    pub(crate) fn slot(&self, number: u32) -> Result<(usize, &FieldLayout)> {
        let layout = self.layout();
        let slot = layout.slot(number).ok_or_else(|| Error::FieldNotFound {
            message: self.full_name().to_string(),
            number,
        })?;
        Ok((slot, &layout.fields()[slot]))
    }

    /// Type of the message at registry index `index`
    pub(crate) fn sibling(&self, index: u32) -> MessageType {
        MessageType {
            registry: Arc::clone(&self.registry),
            index,
        }
    }

    /// Message type of a message, group or message-valued map field
    pub fn field_message_type(&self, number: u32) -> Result<MessageType> {
        let field = self.field(number)?;
        let kind = match &field.map {
            Some(map) => &map.value,
            None => &field.kind,
        };
        kind.message_index()
            .map(|index| self.sibling(index))
            .ok_or_else(|| Error::invalid_op(field.full_name(), "not a message field"))
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.registry, &other.registry) && self.index == other.index
    }
}

impl Eq for MessageType {}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageType").field(&self.full_name()).finish()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.full_name())
    }
}
