//! Request builders and reply parsers, one type per operation.
//!
//! Each operation implements [`Operation`]: `encode` produces the request
//! frame, `decode` consumes the reply. Decoding reads the status word first
//! and stops there on failure, so an error reply never needs a payload.

use bytes::Bytes;

use crate::codec::{FrameBuilder, FrameReader, Opcode};
use crate::error::{ProtoError, ProtoResult};
use crate::types::{DirEntry, PUBLIC_KEY_LEN, PermissionEntry, Stat, StatFs};

/// Minimum size of a `readdir` record: 49-byte header plus the name's
/// terminator.
pub const DIRENT_MIN_LEN: usize = 50;

/// Size of a `getperm` record: key text plus the permission byte.
pub const PERM_RECORD_LEN: usize = PUBLIC_KEY_LEN + 1;

/// Outcome of a reply after the status word has been read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    Success(T),
    /// Raw (positive) errno reported by the server.
    Failure(i64),
}

/// One protocol operation.
pub trait Operation {
    /// Value produced by a successful reply.
    type Output;

    const OPCODE: Opcode;

    /// Build the request frame.
    fn encode(&self) -> ProtoResult<Bytes>;

    /// Parse a reply frame.
    fn decode(reply: &Bytes) -> ProtoResult<Reply<Self::Output>>;

    /// Call arguments rendered for error reports.
    fn args(&self) -> Vec<String>;
}

/// A file addressed either by path or by an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Path(&'a str),
    Handle(u64),
}

impl Target<'_> {
    /// Handle field and path field as framed: a path target sends handle 0,
    /// a handle target sends an empty path.
    fn fields(&self) -> (u64, &str) {
        match self {
            Target::Path(path) => (0, *path),
            Target::Handle(fh) => (*fh, ""),
        }
    }

    fn describe(&self) -> String {
        match self {
            Target::Path(path) => path.to_string(),
            Target::Handle(fh) => format!("fh={fh}"),
        }
    }
}

impl<'a> From<&'a str> for Target<'a> {
    fn from(path: &'a str) -> Self {
        Target::Path(path)
    }
}

impl From<u64> for Target<'_> {
    fn from(fh: u64) -> Self {
        Target::Handle(fh)
    }
}

/// Read the status word; `Some(errno)` on failure.
fn status(r: &mut FrameReader<'_>) -> ProtoResult<Option<i64>> {
    let code = r.i64()?;
    Ok((code != 0).then_some(code))
}

/// Status-only replies.
fn decode_unit(op: Opcode, reply: &Bytes) -> ProtoResult<Reply<()>> {
    let mut r = FrameReader::new(op, reply);
    Ok(match status(&mut r)? {
        Some(errno) => Reply::Failure(errno),
        None => Reply::Success(()),
    })
}

/// Stat fields in wire order: dev, ino, size, blksize, blocks, mode.
fn read_stat(r: &mut FrameReader<'_>) -> ProtoResult<Stat> {
    Ok(Stat {
        dev: r.u64()?,
        ino: r.u64()?,
        size: r.u64()?,
        blksize: r.u64()?,
        blocks: r.u64()?,
        mode: r.u64()?,
    })
}

macro_rules! path_op {
    ($(#[$meta:meta])* $name:ident, $opcode:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name<'a> {
            pub path: &'a str,
        }

        impl Operation for $name<'_> {
            type Output = ();
            const OPCODE: Opcode = $opcode;

            fn encode(&self) -> ProtoResult<Bytes> {
                let mut f = FrameBuilder::new(Self::OPCODE, 0, &[self.path], 0);
                f.put_str("path", self.path)?;
                Ok(f.finish())
            }

            fn decode(reply: &Bytes) -> ProtoResult<Reply<()>> {
                decode_unit(Self::OPCODE, reply)
            }

            fn args(&self) -> Vec<String> {
                vec![self.path.to_string()]
            }
        }
    };
}

macro_rules! two_path_op {
    ($(#[$meta:meta])* $name:ident, $opcode:expr, $first:ident, $second:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name<'a> {
            pub $first: &'a str,
            pub $second: &'a str,
        }

        impl Operation for $name<'_> {
            type Output = ();
            const OPCODE: Opcode = $opcode;

            fn encode(&self) -> ProtoResult<Bytes> {
                let mut f = FrameBuilder::new(Self::OPCODE, 0, &[self.$first, self.$second], 0);
                f.put_str(stringify!($first), self.$first)?;
                f.put_str(stringify!($second), self.$second)?;
                Ok(f.finish())
            }

            fn decode(reply: &Bytes) -> ProtoResult<Reply<()>> {
                decode_unit(Self::OPCODE, reply)
            }

            fn args(&self) -> Vec<String> {
                vec![self.$first.to_string(), self.$second.to_string()]
            }
        }
    };
}

path_op!(
    /// Check the caller's access to a path.
    Access,
    Opcode::Access
);
path_op!(Mkdir, Opcode::Mkdir);
path_op!(Unlink, Opcode::Unlink);
path_op!(Rmdir, Opcode::Rmdir);

two_path_op!(
    /// Create `path` as a symbolic link to `target`.
    Symlink,
    Opcode::Symlink,
    target,
    path
);
two_path_op!(Rename, Opcode::Rename, from, to);
two_path_op!(
    /// Create `new` as a hard link to `existing`.
    Link,
    Opcode::Link,
    existing,
    new
);

/// Attributes by path or handle.
#[derive(Debug, Clone, Copy)]
pub struct Getattr<'a> {
    pub target: Target<'a>,
}

impl Operation for Getattr<'_> {
    type Output = Stat;
    const OPCODE: Opcode = Opcode::Getattr;

    fn encode(&self) -> ProtoResult<Bytes> {
        let (fh, path) = self.target.fields();
        let mut f = FrameBuilder::new(Self::OPCODE, 1, &[path], 0);
        f.put_u64(fh);
        f.put_str("path", path)?;
        Ok(f.finish())
    }

    fn decode(reply: &Bytes) -> ProtoResult<Reply<Stat>> {
        let mut r = FrameReader::new(Self::OPCODE, reply);
        if let Some(errno) = status(&mut r)? {
            return Ok(Reply::Failure(errno));
        }
        read_stat(&mut r).map(Reply::Success)
    }

    fn args(&self) -> Vec<String> {
        vec![self.target.describe()]
    }
}

/// List a directory.
#[derive(Debug, Clone, Copy)]
pub struct Readdir<'a> {
    pub path: &'a str,
}

impl Operation for Readdir<'_> {
    type Output = Vec<DirEntry>;
    const OPCODE: Opcode = Opcode::Readdir;

    fn encode(&self) -> ProtoResult<Bytes> {
        let mut f = FrameBuilder::new(Self::OPCODE, 0, &[self.path], 0);
        f.put_str("path", self.path)?;
        Ok(f.finish())
    }

    /// Records are packed with no count prefix. Keep reading while a
    /// minimal record still fits; shorter trailing bytes are padding.
    fn decode(reply: &Bytes) -> ProtoResult<Reply<Vec<DirEntry>>> {
        let mut r = FrameReader::new(Self::OPCODE, reply);
        if let Some(errno) = status(&mut r)? {
            return Ok(Reply::Failure(errno));
        }

        let mut entries = Vec::new();
        while r.remaining() >= DIRENT_MIN_LEN {
            let d_type = r.u8()?;
            let stat = read_stat(&mut r)?;
            let name = String::from_utf8_lossy(r.cstr()?).into_owned();
            entries.push(DirEntry { name, d_type, stat });
        }
        Ok(Reply::Success(entries))
    }

    fn args(&self) -> Vec<String> {
        vec![self.path.to_string()]
    }
}

macro_rules! open_op {
    ($(#[$meta:meta])* $name:ident, $opcode:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name<'a> {
            pub path: &'a str,
            pub flags: i64,
        }

        impl Operation for $name<'_> {
            /// The new file handle.
            type Output = u64;
            const OPCODE: Opcode = $opcode;

            fn encode(&self) -> ProtoResult<Bytes> {
                let mut f = FrameBuilder::new(Self::OPCODE, 1, &[self.path], 0);
                f.put_i64(self.flags);
                f.put_str("path", self.path)?;
                Ok(f.finish())
            }

            fn decode(reply: &Bytes) -> ProtoResult<Reply<u64>> {
                let mut r = FrameReader::new(Self::OPCODE, reply);
                if let Some(errno) = status(&mut r)? {
                    return Ok(Reply::Failure(errno));
                }
                r.u64().map(Reply::Success)
            }

            fn args(&self) -> Vec<String> {
                vec![self.path.to_string(), format!("{:#o}", self.flags)]
            }
        }
    };
}

open_op!(
    /// Create and open a file.
    Create,
    Opcode::Create
);
open_op!(
    /// Open an existing file (or create it, depending on flags).
    Open,
    Opcode::Open
);

/// Positioned read of up to `size` bytes.
#[derive(Debug, Clone, Copy)]
pub struct Read {
    pub fh: u64,
    pub size: u64,
    pub offset: u64,
}

impl Operation for Read {
    type Output = Bytes;
    const OPCODE: Opcode = Opcode::Read;

    fn encode(&self) -> ProtoResult<Bytes> {
        let mut f = FrameBuilder::new(Self::OPCODE, 3, &[], 0);
        f.put_u64(self.fh);
        f.put_u64(self.size);
        f.put_u64(self.offset);
        Ok(f.finish())
    }

    fn decode(reply: &Bytes) -> ProtoResult<Reply<Bytes>> {
        let mut r = FrameReader::new(Self::OPCODE, reply);
        if let Some(errno) = status(&mut r)? {
            return Ok(Reply::Failure(errno));
        }
        Ok(Reply::Success(reply.slice(r.position()..)))
    }

    fn args(&self) -> Vec<String> {
        vec![
            format!("fh={}", self.fh),
            self.size.to_string(),
            self.offset.to_string(),
        ]
    }
}

/// Positioned write. The data trails the fixed fields unterminated.
#[derive(Clone, Copy)]
pub struct Write<'a> {
    pub fh: u64,
    pub offset: u64,
    pub data: &'a [u8],
}

impl std::fmt::Debug for Write<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Write")
            .field("fh", &self.fh)
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Operation for Write<'_> {
    /// Bytes written.
    type Output = u64;
    const OPCODE: Opcode = Opcode::Write;

    fn encode(&self) -> ProtoResult<Bytes> {
        let mut f = FrameBuilder::new(Self::OPCODE, 3, &[], self.data.len());
        f.put_u64(self.fh);
        f.put_u64(self.data.len() as u64);
        f.put_u64(self.offset);
        f.put_raw(self.data);
        Ok(f.finish())
    }

    /// The status word doubles as the result: negative is `-errno`,
    /// non-negative is the byte count.
    fn decode(reply: &Bytes) -> ProtoResult<Reply<u64>> {
        let mut r = FrameReader::new(Self::OPCODE, reply);
        let value = r.i64()?;
        Ok(if value < 0 {
            Reply::Failure(value.wrapping_neg())
        } else {
            Reply::Success(value as u64)
        })
    }

    fn args(&self) -> Vec<String> {
        vec![
            format!("fh={}", self.fh),
            self.offset.to_string(),
            format!("<{} bytes>", self.data.len()),
        ]
    }
}

/// Filesystem statistics for the filesystem holding `path`.
#[derive(Debug, Clone, Copy)]
pub struct Statfs<'a> {
    pub path: &'a str,
}

impl Operation for Statfs<'_> {
    type Output = StatFs;
    const OPCODE: Opcode = Opcode::Statfs;

    fn encode(&self) -> ProtoResult<Bytes> {
        let mut f = FrameBuilder::new(Self::OPCODE, 0, &[self.path], 0);
        f.put_str("path", self.path)?;
        Ok(f.finish())
    }

    fn decode(reply: &Bytes) -> ProtoResult<Reply<StatFs>> {
        let mut r = FrameReader::new(Self::OPCODE, reply);
        if let Some(errno) = status(&mut r)? {
            return Ok(Reply::Failure(errno));
        }
        Ok(Reply::Success(StatFs {
            bsize: r.u64()?,
            frsize: r.u64()?,
            blocks: r.u64()?,
            bfree: r.u64()?,
            bavail: r.u64()?,
            files: r.u64()?,
            ffree: r.u64()?,
            favail: r.u64()?,
            fsid: r.u64()?,
            flag: r.u64()?,
            namemax: r.u64()?,
        }))
    }

    fn args(&self) -> Vec<String> {
        vec![self.path.to_string()]
    }
}

/// Close a file handle on the server.
#[derive(Debug, Clone, Copy)]
pub struct Release {
    pub fh: u64,
}

impl Operation for Release {
    type Output = ();
    const OPCODE: Opcode = Opcode::Release;

    fn encode(&self) -> ProtoResult<Bytes> {
        let mut f = FrameBuilder::new(Self::OPCODE, 1, &[], 0);
        f.put_u64(self.fh);
        Ok(f.finish())
    }

    fn decode(reply: &Bytes) -> ProtoResult<Reply<()>> {
        decode_unit(Self::OPCODE, reply)
    }

    fn args(&self) -> Vec<String> {
        vec![format!("fh={}", self.fh)]
    }
}

/// Access-control list of a path.
#[derive(Debug, Clone, Copy)]
pub struct Getperm<'a> {
    pub path: &'a str,
}

impl Operation for Getperm<'_> {
    type Output = Vec<PermissionEntry>;
    const OPCODE: Opcode = Opcode::Getperm;

    fn encode(&self) -> ProtoResult<Bytes> {
        let mut f = FrameBuilder::new(Self::OPCODE, 0, &[self.path], 0);
        f.put_str("path", self.path)?;
        Ok(f.finish())
    }

    fn decode(reply: &Bytes) -> ProtoResult<Reply<Vec<PermissionEntry>>> {
        let mut r = FrameReader::new(Self::OPCODE, reply);
        if let Some(errno) = status(&mut r)? {
            return Ok(Reply::Failure(errno));
        }

        let mut acl = Vec::new();
        while r.remaining() >= PERM_RECORD_LEN {
            let key = String::from_utf8_lossy(r.bytes(PUBLIC_KEY_LEN)?).into_owned();
            let perm = r.u8()?;
            acl.push(PermissionEntry { key, perm });
        }
        Ok(Reply::Success(acl))
    }

    fn args(&self) -> Vec<String> {
        vec![self.path.to_string()]
    }
}

/// Grant `perm` on `path` to the peer identified by `key`.
///
/// Layout: `perm u64 | key[53] | path\0`.
#[derive(Debug, Clone, Copy)]
pub struct Setperm<'a> {
    pub path: &'a str,
    pub key: &'a str,
    pub perm: u8,
}

impl Operation for Setperm<'_> {
    type Output = ();
    const OPCODE: Opcode = Opcode::Setperm;

    fn encode(&self) -> ProtoResult<Bytes> {
        if self.key.len() != PUBLIC_KEY_LEN {
            return Err(ProtoError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN,
                got: self.key.len(),
            });
        }
        let mut f = FrameBuilder::new(Self::OPCODE, 1, &[self.path], PUBLIC_KEY_LEN);
        f.put_u64(u64::from(self.perm));
        f.put_raw(self.key.as_bytes());
        f.put_str("path", self.path)?;
        Ok(f.finish())
    }

    fn decode(reply: &Bytes) -> ProtoResult<Reply<()>> {
        decode_unit(Self::OPCODE, reply)
    }

    fn args(&self) -> Vec<String> {
        vec![
            self.path.to_string(),
            self.key.to_string(),
            self.perm.to_string(),
        ]
    }
}

/// Resize a file by path or handle.
#[derive(Debug, Clone, Copy)]
pub struct Truncate<'a> {
    pub target: Target<'a>,
    pub length: u64,
}

impl Operation for Truncate<'_> {
    type Output = ();
    const OPCODE: Opcode = Opcode::Truncate;

    fn encode(&self) -> ProtoResult<Bytes> {
        let (fh, path) = self.target.fields();
        let mut f = FrameBuilder::new(Self::OPCODE, 2, &[path], 0);
        f.put_u64(fh);
        f.put_u64(self.length);
        f.put_str("path", path)?;
        Ok(f.finish())
    }

    fn decode(reply: &Bytes) -> ProtoResult<Reply<()>> {
        decode_unit(Self::OPCODE, reply)
    }

    fn args(&self) -> Vec<String> {
        vec![self.target.describe(), self.length.to_string()]
    }
}
