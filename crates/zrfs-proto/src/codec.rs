//! Frame layout primitives.
//!
//! ```text
//! request:  | opcode u8 | fixed fields (8-byte LE)... | str\0 ... | raw payload |
//! reply:    | status i64 LE | operation-specific payload ...                     |
//! ```
//!
//! Strings always trail the fixed fields. The only raw payload is the data of
//! a `write` request, which is not terminated.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, ProtoResult};

/// Width of every fixed numeric field.
pub const FIELD_LEN: usize = 8;

/// Request discriminant, always byte 0 of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Getattr = 11,
    Access = 12,
    Readdir = 13,
    Mkdir = 14,
    Unlink = 15,
    Rmdir = 16,
    Symlink = 17,
    Rename = 18,
    Link = 19,
    Create = 20,
    Open = 21,
    Read = 22,
    Write = 23,
    Statfs = 24,
    Release = 25,
    Getperm = 26,
    Setperm = 27,
    Truncate = 28,
}

impl Opcode {
    pub const ALL: [Opcode; 18] = [
        Opcode::Getattr,
        Opcode::Access,
        Opcode::Readdir,
        Opcode::Mkdir,
        Opcode::Unlink,
        Opcode::Rmdir,
        Opcode::Symlink,
        Opcode::Rename,
        Opcode::Link,
        Opcode::Create,
        Opcode::Open,
        Opcode::Read,
        Opcode::Write,
        Opcode::Statfs,
        Opcode::Release,
        Opcode::Getperm,
        Opcode::Setperm,
        Opcode::Truncate,
    ];

    /// Operation name used in error reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Getattr => "getattr",
            Opcode::Access => "access",
            Opcode::Readdir => "readdir",
            Opcode::Mkdir => "mkdir",
            Opcode::Unlink => "unlink",
            Opcode::Rmdir => "rmdir",
            Opcode::Symlink => "symlink",
            Opcode::Rename => "rename",
            Opcode::Link => "link",
            Opcode::Create => "create",
            Opcode::Open => "open",
            Opcode::Read => "read",
            Opcode::Write => "write",
            Opcode::Statfs => "statfs",
            Opcode::Release => "release",
            Opcode::Getperm => "getperm",
            Opcode::Setperm => "setperm",
            Opcode::Truncate => "truncate",
        }
    }

    /// Opcode of an encoded request frame.
    pub fn of(frame: &[u8]) -> ProtoResult<Self> {
        match frame.first() {
            Some(&b) => Self::try_from(b),
            None => Err(ProtoError::UnknownOpcode(0)),
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtoError;

    fn try_from(b: u8) -> ProtoResult<Self> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| *op as u8 == b)
            .ok_or(ProtoError::UnknownOpcode(b))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental request frame writer.
///
/// Capacity is computed up front as
/// `1 + fixed * 8 + sum(len + 1 for each string) + raw`.
pub struct FrameBuilder {
    op: Opcode,
    buf: BytesMut,
}

impl FrameBuilder {
    pub fn new(op: Opcode, fixed: usize, strings: &[&str], raw: usize) -> Self {
        let len = 1
            + fixed * FIELD_LEN
            + strings.iter().map(|s| s.len() + 1).sum::<usize>()
            + raw;
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(op as u8);
        Self { op, buf }
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    /// Append a null-terminated string. Rejects interior nulls, which would
    /// shift every following field.
    pub fn put_str(&mut self, field: &'static str, s: &str) -> ProtoResult<()> {
        if s.as_bytes().contains(&0) {
            return Err(ProtoError::InteriorNul { op: self.op, field });
        }
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked little-endian cursor over a frame.
///
/// Every short read is reported as [`ProtoError::CorruptReply`] instead of
/// panicking or silently truncating.
pub struct FrameReader<'a> {
    op: Opcode,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(op: Opcode, buf: &'a [u8]) -> Self {
        Self { op, buf, pos: 0 }
    }

    /// Reader positioned after the opcode byte of a request frame.
    pub fn request(frame: &'a [u8]) -> ProtoResult<Self> {
        let op = Opcode::of(frame)?;
        Ok(Self { op, buf: frame, pos: 1 })
    }

    pub fn opcode(&self) -> Opcode {
        self.op
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> ProtoResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtoError::short(self.op, self.pos + n, self.buf.len()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> ProtoResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u64(&mut self) -> ProtoResult<u64> {
        let raw = self.bytes(FIELD_LEN)?;
        let mut word = [0u8; FIELD_LEN];
        word.copy_from_slice(raw);
        Ok(u64::from_le_bytes(word))
    }

    pub fn i64(&mut self) -> ProtoResult<i64> {
        Ok(self.u64()? as i64)
    }

    /// Scan to the next null byte and return the bytes before it. The
    /// terminator is consumed.
    pub fn cstr(&mut self) -> ProtoResult<&'a [u8]> {
        let start = self.pos;
        let end = self.buf[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|i| start + i)
            .ok_or(ProtoError::Unterminated {
                op: self.op,
                offset: start,
            })?;
        self.pos = end + 1;
        Ok(&self.buf[start..end])
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}
