//! Codec error types.

use thiserror::Error;

use crate::codec::Opcode;

/// Errors raised while building request frames or parsing reply frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// A reply was shorter than the fields it must carry.
    #[error("corrupt {op} reply: needed {needed} bytes, got {got}")]
    CorruptReply {
        op: Opcode,
        needed: usize,
        got: usize,
    },

    /// A variable-length field in a reply had no null terminator.
    #[error("corrupt {op} reply: unterminated string at offset {offset}")]
    Unterminated { op: Opcode, offset: usize },

    /// A string argument contains a null byte and cannot be framed.
    #[error("{op} argument {field:?} contains a null byte")]
    InteriorNul { op: Opcode, field: &'static str },

    /// Unknown open mode token (e.g. `"rw"`).
    #[error("invalid open flags: {0:?}")]
    InvalidFlags(String),

    /// Public key text is not the fixed 53-byte base-32 form.
    #[error("public key must be {expected} bytes of base-32 text, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    /// Byte 0 of a frame is not a known opcode.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
}

impl ProtoError {
    pub(crate) fn short(op: Opcode, needed: usize, got: usize) -> Self {
        Self::CorruptReply { op, needed, got }
    }
}

/// Codec result type.
pub type ProtoResult<T> = Result<T, ProtoError>;
