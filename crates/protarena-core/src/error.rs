//! Error types for the protarena-core library.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants
//! separate malformed input ([`Error::MalformedWire`]), resource exhaustion
//! ([`Error::AllocationExhausted`]), API contract violations such as
//! [`Error::TypeMismatch`], and the one recoverable resolution failure,
//! [`Error::UnresolvedType`].

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::wire::WireType;

/// Result type alias for protarena operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all protarena operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The upstream allocator refused a block, or the arena budget is spent
    #[error("arena allocation of {requested} bytes failed{}", limit_suffix(.limit))]
    AllocationExhausted {
        /// Bytes requested by the failing allocation
        requested: usize,
        /// Configured arena budget, if any
        limit: Option<usize>,
    },

    /// Invalid or truncated wire-format input
    #[error("malformed wire data at offset {offset}: {kind}")]
    MalformedWire {
        /// Byte offset where the error occurred
        offset: usize,
        /// What was wrong with the input
        kind: WireErrorKind,
    },

    /// Two message types (or a value and a field) that must agree do not
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// The type the operation required
        expected: String,
        /// The type that was supplied
        found: String,
    },

    /// A type URL or extension could not be resolved in the registry
    #[error("unresolved type '{type_url}'")]
    UnresolvedType {
        /// The URL that failed to resolve
        type_url: String,
    },

    /// Message nesting exceeded the configured bound
    #[error("message nesting exceeds the limit of {limit}")]
    DepthExceeded {
        /// The configured depth limit
        limit: u32,
    },

    /// No field with this number exists on the message type
    #[error("message '{message}' has no field number {number}")]
    FieldNotFound {
        /// Full name of the message type
        message: String,
        /// The requested field number
        number: u32,
    },

    /// The operation does not apply to this kind of field
    #[error("field '{field}': {reason}")]
    InvalidFieldOp {
        /// Full name of the field
        field: String,
        /// Why the operation was rejected
        reason: &'static str,
    },

    /// A closed enum was given a number it does not declare
    #[error("enum '{enum_name}' has no value {value}")]
    InvalidEnumValue {
        /// Full name of the enum
        enum_name: String,
        /// The rejected number
        value: i32,
    },

    /// Repeated field index past the end
    #[error("index {index} out of bounds for repeated field of length {len}")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,
        /// Current length
        len: usize,
    },

    /// A handle was used with an arena that did not issue it
    #[error("handle belongs to arena {handle_arena}, not to this arena or any arena fused into it")]
    ForeignHandle {
        /// Id of the arena that issued the handle
        handle_arena: u32,
    },

    /// Two arenas with incompatible upstream budgets cannot be fused
    #[error("cannot fuse arenas with different memory limits ({left:?} vs {right:?})")]
    FuseIncompatible {
        /// Budget of the surviving arena
        left: Option<usize>,
        /// Budget of the arena that was offered
        right: Option<usize>,
    },

    /// A caller-supplied argument is out of its valid domain
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failed to read a descriptor set file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a FileDescriptorSet
    #[error("failed to parse descriptor set: {0}")]
    DescriptorParse(#[from] prost::DecodeError),

    /// Failed to build a descriptor pool or layout
    #[error("failed to build descriptors: {0}")]
    DescriptorBuild(String),

    /// The process-wide registry was already installed
    #[error("the global registry has already been installed")]
    GlobalRegistryInstalled,
}

fn limit_suffix(limit: &Option<usize>) -> String {
    match limit {
        Some(limit) => format!(" (arena limit {} bytes)", limit),
        None => String::new(),
    }
}

/// Cause of a [`Error::MalformedWire`] failure
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WireErrorKind {
    /// Input ended inside a varint
    TruncatedVarint,
    /// Varint longer than 10 bytes
    VarintOverflow,
    /// Fewer bytes remain than the field requires
    Truncated {
        /// Bytes needed
        needed: usize,
        /// Bytes available
        available: usize,
    },
    /// Wire type 6 or 7
    InvalidWireType(u8),
    /// Field number 0 or above the protobuf maximum
    InvalidFieldNumber(u64),
    /// A known field arrived with the wrong wire type
    WireTypeMismatch {
        /// Field number
        field: u32,
        /// Wire type the field requires
        expected: WireType,
        /// Wire type found in the input
        found: WireType,
    },
    /// A value does not fit the declared width of the field
    ValueOutOfRange {
        /// Field number
        field: u32,
        /// Raw decoded varint
        value: u64,
    },
    /// A string field holds bytes that are not UTF-8
    InvalidUtf8 {
        /// Field number
        field: u32,
    },
    /// Nesting deeper than the decoder allows
    DepthExceeded(u32),
    /// End-group tag number does not match the open group
    GroupMismatch {
        /// Number of the open group
        start: u32,
        /// Number found on the end tag
        end: u32,
    },
    /// End-group tag outside any group
    UnexpectedEndGroup(u32),
    /// Input ended inside a group
    UnterminatedGroup(u32),
    /// A length-delimited payload ended in the middle of a packed element
    PackedLength {
        /// Field number
        field: u32,
    },
}

impl fmt::Display for WireErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedVarint => write!(f, "truncated varint"),
            Self::VarintOverflow => write!(f, "varint exceeds 10 bytes"),
            Self::Truncated { needed, available } => {
                write!(f, "need {} bytes, have {}", needed, available)
            }
            Self::InvalidWireType(wt) => write!(f, "invalid wire type {}", wt),
            Self::InvalidFieldNumber(n) => write!(f, "invalid field number {}", n),
            Self::WireTypeMismatch {
                field,
                expected,
                found,
            } => write!(
                f,
                "field {} expects wire type {:?}, found {:?}",
                field, expected, found
            ),
            Self::ValueOutOfRange { field, value } => {
                write!(f, "value {} out of range for field {}", value, field)
            }
            Self::InvalidUtf8 { field } => write!(f, "invalid UTF-8 in string field {}", field),
            Self::DepthExceeded(limit) => write!(f, "nesting exceeds {} levels", limit),
            Self::GroupMismatch { start, end } => {
                write!(f, "group {} closed by end-group {}", start, end)
            }
            Self::UnexpectedEndGroup(n) => write!(f, "end-group {} outside any group", n),
            Self::UnterminatedGroup(n) => write!(f, "group {} is never closed", n),
            Self::PackedLength { field } => {
                write!(f, "packed payload of field {} ends mid-element", field)
            }
        }
    }
}

impl Error {
    /// Creates a new malformed-wire error
    pub fn malformed(offset: usize, kind: WireErrorKind) -> Self {
        Self::MalformedWire { offset, kind }
    }

    /// Creates a new type mismatch error
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Creates a new unresolved type error
    pub fn unresolved(type_url: impl Into<String>) -> Self {
        Self::UnresolvedType {
            type_url: type_url.into(),
        }
    }

    /// Creates a new invalid field operation error
    pub fn invalid_op(field: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidFieldOp {
            field: field.into(),
            reason,
        }
    }

    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new descriptor build error
    pub fn descriptor_build(msg: impl Into<String>) -> Self {
        Self::DescriptorBuild(msg.into())
    }

    /// Returns true for failures that callers are expected to degrade around
    /// (keep the raw bytes) rather than abort on
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UnresolvedType { .. })
    }

    /// Returns true if the input bytes, not the caller, caused the failure
    pub fn is_malformed_input(&self) -> bool {
        matches!(self, Self::MalformedWire { .. })
    }

    /// Byte offset of a decode failure
    pub fn offset(&self) -> Option<usize> {
        match self {
            Self::MalformedWire { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::malformed(7, WireErrorKind::InvalidUtf8 { field: 14 });
        assert!(err.to_string().contains("offset 7"));
        assert!(err.to_string().contains("UTF-8"));
        assert_eq!(err.offset(), Some(7));
    }

    #[test]
    fn test_allocation_display() {
        let err = Error::AllocationExhausted {
            requested: 64,
            limit: Some(32),
        };
        assert_eq!(
            err.to_string(),
            "arena allocation of 64 bytes failed (arena limit 32 bytes)"
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::unresolved("type.googleapis.com/x.Y").is_recoverable());
        assert!(!Error::type_mismatch("a.A", "b.B").is_recoverable());
        assert!(Error::malformed(0, WireErrorKind::TruncatedVarint).is_malformed_input());
    }
}
