//! Client error types.

use std::fmt;

use thiserror::Error;
use zrfs_proto::{Errno, Opcode, ProtoError};

use crate::transport::TransportError;

/// A server-reported failure of one operation.
///
/// Carries everything needed to explain the failure without the call site:
/// the errno, the operation name and the arguments it was called with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    pub errno: Errno,
    pub op: Opcode,
    pub args: Vec<String>,
}

impl OpError {
    pub fn new(errno: Errno, op: Opcode, args: Vec<String>) -> Self {
        Self { errno, op, args }
    }

    /// Symbolic errno name, `"?"` when unknown.
    pub fn code(&self) -> &'static str {
        self.errno.name()
    }

    pub fn description(&self) -> String {
        self.errno.description().into_owned()
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}, {} {}",
            self.errno.name(),
            self.errno.description(),
            self.op,
            self.args.join(", ")
        )
    }
}

impl std::error::Error for OpError {}

/// Errors from client operations.
#[derive(Debug, Error)]
pub enum ZrfsError {
    /// The channel failed; the operation's fate on the server is unknown.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed frame, or an argument that cannot be framed.
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// The server rejected the operation.
    #[error("{0}")]
    Operation(#[from] OpError),

    /// Not implemented by this protocol version.
    #[error("{0} is not supported by the remote filesystem protocol")]
    Unsupported(&'static str),

    #[error("file handle {0} is closed")]
    HandleClosed(u64),

    #[error("stream is closed")]
    StreamClosed,

    /// A write made no progress on the first attempt nor on any retry.
    #[error("write failed: no progress after {retries} retries")]
    RetriesExhausted { retries: u32 },

    #[error("file contents are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// A background I/O task panicked or was cancelled.
    #[error("I/O task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ZrfsError {
    /// The server errno, for operation errors.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            ZrfsError::Operation(e) => Some(e.errno),
            _ => None,
        }
    }

    /// Returns true if the server reported `errno`.
    pub fn is(&self, errno: Errno) -> bool {
        self.errno() == Some(errno)
    }

    pub fn is_not_found(&self) -> bool {
        self.is(Errno::NoEnt)
    }

    pub fn is_already_exists(&self) -> bool {
        self.is(Errno::Exist)
    }

    /// Transient "try again" condition.
    pub fn is_again(&self) -> bool {
        self.errno().is_some_and(|e| e.is_again())
    }
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ZrfsError>;
