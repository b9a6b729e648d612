//! ZRFS remote filesystem client
//!
//! Talks the ZRFS binary protocol to a server over the `zrfs` SSH
//! subsystem (or any other [`Channel`]) and exposes the remote tree with a
//! familiar filesystem shape:
//!
//! ```text
//!   Session ──▶ Dispatcher ──▶ Channel ──▶ server
//!     │            (encode, exchange, decode, map errno)
//!     ├─ FileHandle ── ReadStream / WriteStream
//!     └─ Dir
//! ```

pub mod constants;
pub mod dir;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod session;
pub mod ssh;
pub mod stream;
pub mod transport;

use std::sync::Arc;

pub use dir::Dir;
pub use dispatch::Dispatcher;
pub use error::{OpError, Result, ZrfsError};
pub use handle::{FileHandle, UNSUPPORTED_OPS, WriteOptions};
pub use session::{FileRef, RmOptions, Session};
pub use ssh::{KeySource, SshChannel, SshClient, SshConfig, SshError};
pub use stream::{ReadStream, ReadStreamOptions, WriteStream, WriteStreamOptions};
pub use transport::{Channel, FramedChannel, TransportError};

pub use zrfs_proto::{
    DirEntry, Errno, FileType, OpenFlags, OpenMode, PermissionEntry, Stat, StatFs, Target,
};

/// Connect to a server via SSH and return a session
///
/// This is the main entry point for connecting to a ZRFS server.
pub async fn connect(config: SshConfig) -> std::result::Result<Session, ConnectError> {
    let channel = SshClient::new(config).connect().await?;
    Ok(Session::with_channel(Arc::new(channel)))
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("SSH error: {0}")]
    Ssh(#[from] SshError),
}
