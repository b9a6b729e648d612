//! Open flags.
//!
//! Callers may pass either a mode token in the familiar `fopen` style
//! (`"r"`, `"w+"`, `"ax"`, ...) or raw POSIX `O_*` bits. Both resolve to the
//! 64-bit flag word carried by `open` and `create` frames.

use std::str::FromStr;

use strum::EnumString;

use crate::error::{ProtoError, ProtoResult};

/// A symbolic open mode.
///
/// `s` adds `O_SYNC`, `x` adds `O_EXCL`; both may appear before or after the
/// base letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString)]
pub enum OpenMode {
    /// `r`: read only.
    #[default]
    #[strum(serialize = "r")]
    Read,
    #[strum(serialize = "rs", serialize = "sr")]
    ReadSync,
    /// `r+`: read and write.
    #[strum(serialize = "r+")]
    ReadWrite,
    #[strum(serialize = "rs+", serialize = "sr+")]
    ReadWriteSync,
    /// `w`: truncate or create, write only.
    #[strum(serialize = "w")]
    Write,
    #[strum(serialize = "wx", serialize = "xw")]
    WriteExclusive,
    /// `w+`: truncate or create, read and write.
    #[strum(serialize = "w+")]
    WriteRead,
    #[strum(serialize = "wx+", serialize = "xw+")]
    WriteReadExclusive,
    /// `a`: append, create if missing, write only.
    #[strum(serialize = "a")]
    Append,
    #[strum(serialize = "ax", serialize = "xa")]
    AppendExclusive,
    #[strum(serialize = "as", serialize = "sa")]
    AppendSync,
    /// `a+`: append, create if missing, read and write.
    #[strum(serialize = "a+")]
    AppendRead,
    #[strum(serialize = "ax+", serialize = "xa+")]
    AppendReadExclusive,
    #[strum(serialize = "as+", serialize = "sa+")]
    AppendReadSync,
}

impl OpenMode {
    /// Parse a mode token.
    pub fn parse(token: &str) -> ProtoResult<Self> {
        <Self as FromStr>::from_str(token).map_err(|_| ProtoError::InvalidFlags(token.to_string()))
    }

    /// The POSIX flag combination for this mode.
    pub fn bits(&self) -> i64 {
        use libc::{O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_SYNC, O_TRUNC, O_WRONLY};

        let bits = match self {
            OpenMode::Read => O_RDONLY,
            OpenMode::ReadSync => O_RDONLY | O_SYNC,
            OpenMode::ReadWrite => O_RDWR,
            OpenMode::ReadWriteSync => O_RDWR | O_SYNC,
            OpenMode::Write => O_TRUNC | O_CREAT | O_WRONLY,
            OpenMode::WriteExclusive => O_TRUNC | O_CREAT | O_WRONLY | O_EXCL,
            OpenMode::WriteRead => O_TRUNC | O_CREAT | O_RDWR,
            OpenMode::WriteReadExclusive => O_TRUNC | O_CREAT | O_RDWR | O_EXCL,
            OpenMode::Append => O_APPEND | O_CREAT | O_WRONLY,
            OpenMode::AppendExclusive => O_APPEND | O_CREAT | O_WRONLY | O_EXCL,
            OpenMode::AppendSync => O_APPEND | O_CREAT | O_WRONLY | O_SYNC,
            OpenMode::AppendRead => O_APPEND | O_CREAT | O_RDWR,
            OpenMode::AppendReadExclusive => O_APPEND | O_CREAT | O_RDWR | O_EXCL,
            OpenMode::AppendReadSync => O_APPEND | O_CREAT | O_RDWR | O_SYNC,
        };
        i64::from(bits)
    }
}

/// Flags accepted by `open`: a mode token, a parsed mode, or raw bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags<'a> {
    Token(&'a str),
    Mode(OpenMode),
    Bits(i64),
}

impl OpenFlags<'_> {
    /// Resolve to the flag word sent on the wire. Raw bits pass through.
    pub fn resolve(&self) -> ProtoResult<i64> {
        match self {
            OpenFlags::Token(token) => OpenMode::parse(token).map(|m| m.bits()),
            OpenFlags::Mode(mode) => Ok(mode.bits()),
            OpenFlags::Bits(bits) => Ok(*bits),
        }
    }
}

impl Default for OpenFlags<'_> {
    fn default() -> Self {
        OpenFlags::Mode(OpenMode::Read)
    }
}

impl<'a> From<&'a str> for OpenFlags<'a> {
    fn from(token: &'a str) -> Self {
        OpenFlags::Token(token)
    }
}

impl From<OpenMode> for OpenFlags<'_> {
    fn from(mode: OpenMode) -> Self {
        OpenFlags::Mode(mode)
    }
}

impl From<i64> for OpenFlags<'_> {
    fn from(bits: i64) -> Self {
        OpenFlags::Bits(bits)
    }
}

impl From<i32> for OpenFlags<'_> {
    fn from(bits: i32) -> Self {
        OpenFlags::Bits(i64::from(bits))
    }
}
