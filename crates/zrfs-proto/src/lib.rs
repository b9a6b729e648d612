//! ZRFS wire protocol.
//!
//! Pure, I/O-free building blocks shared by the client and by test servers:
//!
//! - [`codec`]: opcode table plus bounds-checked frame writer/reader
//! - [`ops`]: one [`Operation`] per request kind (18 in total)
//! - [`errno`]: the server's errno table
//! - [`types`]: [`Stat`], [`StatFs`], [`DirEntry`], [`PermissionEntry`]
//! - [`flags`]: `fopen`-style mode tokens and raw `O_*` bits
//!
//! All numeric fields are 8-byte little-endian. Strings are null-terminated
//! and always follow the fixed fields of a frame.

pub mod codec;
pub mod errno;
mod error;
pub mod flags;
pub mod ops;
pub mod types;

pub use codec::{FrameBuilder, FrameReader, Opcode};
pub use errno::Errno;
pub use error::{ProtoError, ProtoResult};
pub use flags::{OpenFlags, OpenMode};
pub use ops::{Operation, Reply, Target};
pub use types::{DirEntry, FileType, PermissionEntry, Stat, StatFs};
