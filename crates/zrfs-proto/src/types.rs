//! Metadata types carried by replies.
//!
//! The protocol does not transmit link counts, ownership or timestamps, so
//! [`Stat`] is deliberately narrower than `struct stat`.

/// Bit mask for the file type bit fields.
pub const S_IFMT: u64 = 0o170000;
/// Socket.
pub const S_IFSOCK: u64 = 0o140000;
/// Symbolic link.
pub const S_IFLNK: u64 = 0o120000;
/// Regular file.
pub const S_IFREG: u64 = 0o100000;
/// Block device.
pub const S_IFBLK: u64 = 0o060000;
/// Directory.
pub const S_IFDIR: u64 = 0o040000;
/// Character device.
pub const S_IFCHR: u64 = 0o020000;
/// FIFO.
pub const S_IFIFO: u64 = 0o010000;

/// Length of the base-32 public key text in permission records.
pub const PUBLIC_KEY_LEN: usize = 53;

/// File type enumeration, decoded from the `S_IFMT` bits of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Socket,
    Symlink,
    File,
    BlockDevice,
    Directory,
    CharDevice,
    Fifo,
}

impl FileType {
    /// Decode the type bits of `mode`. Returns `None` for unrecognised bits.
    pub fn from_mode(mode: u64) -> Option<Self> {
        match mode & S_IFMT {
            S_IFSOCK => Some(FileType::Socket),
            S_IFLNK => Some(FileType::Symlink),
            S_IFREG => Some(FileType::File),
            S_IFBLK => Some(FileType::BlockDevice),
            S_IFDIR => Some(FileType::Directory),
            S_IFCHR => Some(FileType::CharDevice),
            S_IFIFO => Some(FileType::Fifo),
            _ => None,
        }
    }

    /// The `S_IF*` value for this type.
    pub fn mode_bits(&self) -> u64 {
        match self {
            FileType::Socket => S_IFSOCK,
            FileType::Symlink => S_IFLNK,
            FileType::File => S_IFREG,
            FileType::BlockDevice => S_IFBLK,
            FileType::Directory => S_IFDIR,
            FileType::CharDevice => S_IFCHR,
            FileType::Fifo => S_IFIFO,
        }
    }
}

/// File attributes as reported by `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Identifier of the device containing the file.
    pub dev: u64,
    /// Filesystem-specific inode number.
    pub ino: u64,
    /// File type bits plus the caller's permission / ACL tag.
    pub mode: u64,
    /// Size in bytes. Zero when the server cannot size the file.
    pub size: u64,
    /// Preferred I/O block size.
    pub blksize: u64,
    /// Number of blocks allocated.
    pub blocks: u64,
}

impl Stat {
    /// The decoded file type, if the mode carries a known one.
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    /// Mode bits below the file type mask.
    pub fn permissions(&self) -> u64 {
        self.mode & !S_IFMT
    }

    fn is(&self, bits: u64) -> bool {
        (self.mode & S_IFMT) == bits
    }

    pub fn is_file(&self) -> bool {
        self.is(S_IFREG)
    }

    pub fn is_directory(&self) -> bool {
        self.is(S_IFDIR)
    }

    pub fn is_symbolic_link(&self) -> bool {
        self.is(S_IFLNK)
    }

    pub fn is_block_device(&self) -> bool {
        self.is(S_IFBLK)
    }

    pub fn is_character_device(&self) -> bool {
        self.is(S_IFCHR)
    }

    pub fn is_fifo(&self) -> bool {
        self.is(S_IFIFO)
    }

    pub fn is_socket(&self) -> bool {
        self.is(S_IFSOCK)
    }
}

/// Filesystem statistics, see statvfs(3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatFs {
    /// Filesystem block size.
    pub bsize: u64,
    /// Fragment size.
    pub frsize: u64,
    /// Size of the filesystem in `frsize` units.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Free blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Free inodes available to unprivileged users.
    pub favail: u64,
    /// Filesystem ID.
    pub fsid: u64,
    /// Mount flags.
    pub flag: u64,
    /// Maximum filename length.
    pub namemax: u64,
}

/// A raw `readdir` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (not a full path).
    pub name: String,
    /// The record's leading type byte, as sent by the server.
    pub d_type: u8,
    /// Attributes of the entry.
    pub stat: Stat,
}

impl DirEntry {
    /// Type decoded from the entry's mode.
    pub fn kind(&self) -> Option<FileType> {
        self.stat.file_type()
    }

    /// Returns true for the `.` and `..` pseudo-entries.
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// One access-control record from `getperm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionEntry {
    /// Base-32 text form of the peer's public key.
    pub key: String,
    /// Permission byte granted to that key.
    pub perm: u8,
}
