//! Server errno table.
//!
//! Replies carry a raw errno in their first eight bytes. The server speaks a
//! BSD-flavoured subset of POSIX (note `ELOOP` = 62, `ECANCELED` = 89), so the
//! values here do not necessarily match the client host's `libc` constants.
//! Codes outside the table are kept as [`Errno::Unknown`] rather than folded
//! into a default.

use std::borrow::Cow;
use std::fmt;

macro_rules! errno_table {
    ($( $variant:ident = $code:literal, $name:literal, $desc:literal; )*) => {
        /// Protocol errno.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Errno {
            $(
                #[doc = $desc]
                $variant,
            )*
            /// A code the table does not know.
            Unknown(i64),
        }

        impl Errno {
            /// Map a raw reply code to an errno. Never fails.
            pub fn from_code(code: i64) -> Self {
                match code {
                    $( $code => Errno::$variant, )*
                    other => Errno::Unknown(other),
                }
            }

            /// Raw numeric value.
            pub fn code(&self) -> i64 {
                match self {
                    $( Errno::$variant => $code, )*
                    Errno::Unknown(code) => *code,
                }
            }

            /// Symbolic name (`"ENOENT"`), or `"?"` for unknown codes.
            pub fn name(&self) -> &'static str {
                match self {
                    $( Errno::$variant => $name, )*
                    Errno::Unknown(_) => "?",
                }
            }

            /// Human-readable description.
            pub fn description(&self) -> Cow<'static, str> {
                match self {
                    $( Errno::$variant => Cow::Borrowed($desc), )*
                    Errno::Unknown(code) => Cow::Owned(format!("Unknown error: {code}")),
                }
            }
        }
    };
}

errno_table! {
    Perm = 1, "EPERM", "Operation not permitted";
    NoEnt = 2, "ENOENT", "No such file or directory";
    Srch = 3, "ESRCH", "No such process";
    Intr = 4, "EINTR", "Interrupted system call";
    Io = 5, "EIO", "Input/output error";
    NxIo = 6, "ENXIO", "Device not configured";
    TooBig = 7, "E2BIG", "Argument list too long";
    NoExec = 8, "ENOEXEC", "Exec format error";
    BadF = 9, "EBADF", "Bad file descriptor";
    Child = 10, "ECHILD", "No child processes";
    DeadLk = 11, "EDEADLK", "Resource deadlock avoided";
    NoMem = 12, "ENOMEM", "Cannot allocate memory";
    Acces = 13, "EACCES", "Permission denied";
    Fault = 14, "EFAULT", "Bad address";
    Busy = 16, "EBUSY", "Device / Resource busy";
    Exist = 17, "EEXIST", "File exists";
    XDev = 18, "EXDEV", "Cross-device link";
    NoDev = 19, "ENODEV", "Operation not supported by device";
    NotDir = 20, "ENOTDIR", "Not a directory";
    IsDir = 21, "EISDIR", "Is a directory";
    Inval = 22, "EINVAL", "Invalid argument";
    NFile = 23, "ENFILE", "Too many open files in system";
    MFile = 24, "EMFILE", "Too many open files";
    NoTty = 25, "ENOTTY", "Inappropriate ioctl for device";
    TxtBsy = 26, "ETXTBSY", "Text file busy";
    FBig = 27, "EFBIG", "File too large";
    NoSpc = 28, "ENOSPC", "No space left on device";
    SPipe = 29, "ESPIPE", "Illegal seek";
    RoFs = 30, "EROFS", "Read-only file system";
    MLink = 31, "EMLINK", "Too many links";
    Pipe = 32, "EPIPE", "Broken pipe";
    Again = 35, "EAGAIN", "Resource temporarily unavailable";
    Loop = 62, "ELOOP", "Too many levels of symbolic links";
    NameTooLong = 63, "ENAMETOOLONG", "File name too long";
    Canceled = 89, "ECANCELED", "Operation canceled";
}

impl Errno {
    /// Returns true for the transient "try again" condition.
    pub fn is_again(&self) -> bool {
        matches!(self, Errno::Again)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.description())
    }
}
