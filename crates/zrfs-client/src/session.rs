//! Filesystem-style operations over one connection.
//!
//! [`Session`] exposes the remote filesystem with the shape of a local one:
//! path operations, open handles, whole-file helpers and the composite
//! `mkdir -p` and `rm -r` built from primitives.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use tracing::debug;
use zrfs_proto::ops::{
    Access, Create, Getattr, Getperm, Link, Mkdir, Open, Read, Readdir, Release, Rename, Rmdir,
    Setperm, Statfs, Symlink, Truncate, Unlink, Write,
};
use zrfs_proto::{DirEntry, OpenFlags, OpenMode, PermissionEntry, Stat, StatFs, Target};

use crate::constants::{MAX_WRITE_LEN, READ_FILE_CHUNK, WRITE_RETRY_LIMIT};
use crate::dir::Dir;
use crate::dispatch::Dispatcher;
use crate::error::{Result, ZrfsError};
use crate::handle::FileHandle;
use crate::transport::Channel;

/// A file given by path or by an already open handle.
///
/// Whole-file helpers open and close path targets themselves; handle
/// targets are used as they are and left open.
#[derive(Debug, Clone, Copy)]
pub enum FileRef<'a> {
    Path(&'a str),
    Handle(&'a FileHandle),
}

impl<'a> From<&'a str> for FileRef<'a> {
    fn from(path: &'a str) -> Self {
        FileRef::Path(path)
    }
}

impl<'a> From<&'a String> for FileRef<'a> {
    fn from(path: &'a String) -> Self {
        FileRef::Path(path)
    }
}

impl<'a> From<&'a FileHandle> for FileRef<'a> {
    fn from(handle: &'a FileHandle) -> Self {
        FileRef::Handle(handle)
    }
}

/// Options for [`Session::rm`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RmOptions {
    /// Remove directories and their contents.
    pub recursive: bool,
    /// Ignore paths that do not exist.
    pub force: bool,
}

impl RmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// A connected remote filesystem. Cloning shares the connection.
#[derive(Debug, Clone)]
pub struct Session {
    rpc: Dispatcher,
}

impl Session {
    pub fn new(rpc: Dispatcher) -> Self {
        Self { rpc }
    }

    /// A session over an already established channel.
    pub fn with_channel(channel: Arc<dyn Channel>) -> Self {
        Self::new(Dispatcher::new(channel))
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Succeeds if the caller may access `path`.
    pub async fn access(&self, path: &str) -> Result<()> {
        self.rpc.call(Access { path }).await
    }

    pub async fn stat(&self, path: &str) -> Result<Stat> {
        self.rpc.call(Getattr { target: Target::Path(path) }).await
    }

    /// Same request as [`stat`](Self::stat); whether links are followed is
    /// up to the server.
    pub async fn lstat(&self, path: &str) -> Result<Stat> {
        self.stat(path).await
    }

    /// Attributes of an open handle.
    pub async fn fstat(&self, fh: u64) -> Result<Stat> {
        self.rpc.call(Getattr { target: Target::Handle(fh) }).await
    }

    pub async fn statfs(&self, path: &str) -> Result<StatFs> {
        self.rpc.call(Statfs { path }).await
    }

    /// Resize a file given by path or raw handle.
    pub async fn truncate<'a>(&self, target: impl Into<Target<'a>>, length: u64) -> Result<()> {
        self.rpc
            .call(Truncate {
                target: target.into(),
                length,
            })
            .await
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.rpc.call(Mkdir { path }).await
    }

    /// Create `path` and any missing parents.
    ///
    /// Each prefix is created in turn; prefixes that already exist are
    /// skipped. Returns the first directory actually created, or `None`
    /// when the whole path already existed.
    pub async fn mkdir_all(&self, path: &str) -> Result<Option<String>> {
        let normalized = path.replace('\\', "/");
        let mut first_created = None;
        let mut current = String::new();

        for (i, part) in normalized.split('/').enumerate() {
            // Keep the root prefix; skip doubled and trailing separators.
            if part.is_empty() && i > 0 {
                continue;
            }
            current.push_str(part);
            current.push('/');

            match self.mkdir(&current).await {
                Ok(()) => {
                    if first_created.is_none() {
                        first_created = Some(current.clone());
                    }
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }

        debug!(path, created = ?first_created, "mkdir_all");
        Ok(first_created)
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        self.rpc.call(Rmdir { path }).await
    }

    pub async fn unlink(&self, path: &str) -> Result<()> {
        self.rpc.call(Unlink { path }).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.rpc.call(Rename { from, to }).await
    }

    /// Create `new` as a hard link to `existing`.
    pub async fn link(&self, existing: &str, new: &str) -> Result<()> {
        self.rpc.call(Link { existing, new }).await
    }

    /// Create `path` as a symbolic link pointing at `target`.
    pub async fn symlink(&self, target: &str, path: &str) -> Result<()> {
        self.rpc.call(Symlink { target, path }).await
    }

    /// Remove a file, or a directory tree with `recursive`.
    ///
    /// With `force`, a missing path is not an error. Children of a
    /// recursive removal are always removed with `force`, so entries that
    /// vanish concurrently do not abort the walk.
    pub async fn rm(&self, path: &str, options: RmOptions) -> Result<()> {
        self.rm_at(path.to_string(), options).await
    }

    fn rm_at(&self, path: String, options: RmOptions) -> BoxFuture<'_, Result<()>> {
        async move {
            let stat = match self.lstat(&path).await {
                Ok(stat) => stat,
                Err(e) if options.force && e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };

            if !stat.is_directory() {
                return self.unlink(&path).await;
            }

            if options.recursive {
                let children = RmOptions {
                    recursive: true,
                    force: true,
                };
                for name in self.readdir(&path).await? {
                    self.rm_at(join(&path, &name), children).await?;
                }
            }
            self.rmdir(&path).await
        }
        .boxed()
    }

    // ========================================================================
    // Directories
    // ========================================================================

    /// Entry names of `path`, without `.` and `..`.
    pub async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .read_dir_entries(path)
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    /// Entries of `path` with their attributes, without `.` and `..`.
    pub async fn read_dir_entries(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut entries = self.rpc.call(Readdir { path }).await?;
        entries.retain(|entry| !entry.is_dot());
        Ok(entries)
    }

    /// Read a whole directory into a [`Dir`].
    pub async fn opendir(&self, path: &str) -> Result<Dir> {
        let entries = self.read_dir_entries(path).await?;
        Ok(Dir::new(path, entries))
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Open `path`. Flags are a mode token (`"r"`, `"w+"`, ...), an
    /// [`OpenMode`], or raw `O_*` bits. A bad token fails before any I/O.
    pub async fn open<'a>(&self, path: &str, flags: impl Into<OpenFlags<'a>>) -> Result<FileHandle> {
        let flags = flags.into().resolve()?;
        let fh = self.rpc.call(Open { path, flags }).await?;
        debug!(path, fh, "opened");
        Ok(FileHandle::new(self.clone(), fh))
    }

    /// Create and open `path`.
    pub async fn create<'a>(
        &self,
        path: &str,
        flags: impl Into<OpenFlags<'a>>,
    ) -> Result<FileHandle> {
        let flags = flags.into().resolve()?;
        let fh = self.rpc.call(Create { path, flags }).await?;
        debug!(path, fh, "created");
        Ok(FileHandle::new(self.clone(), fh))
    }

    /// Positioned read on a raw handle. An empty result means end of file.
    pub async fn read(&self, fh: u64, size: u64, offset: u64) -> Result<Bytes> {
        self.rpc.call(Read { fh, size, offset }).await
    }

    /// Positioned write on a raw handle. Returns the bytes accepted, which
    /// may be fewer than offered: at most [`MAX_WRITE_LEN`] go in one request.
    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u64> {
        let data = &data[..data.len().min(MAX_WRITE_LEN)];
        self.rpc.call(Write { fh, offset, data }).await
    }

    /// Close a raw handle on the server.
    pub async fn release(&self, fh: u64) -> Result<()> {
        self.rpc.call(Release { fh }).await
    }

    // ========================================================================
    // Whole files
    // ========================================================================

    /// Read an entire file.
    ///
    /// Regular files are read with one request sized from `fstat`. Other
    /// files (virtual files report size 0) are read in chunks at offset 0
    /// until the server returns nothing. A handle is read through its own
    /// session.
    pub async fn read_file<'a>(&self, file: impl Into<FileRef<'a>>) -> Result<Bytes> {
        match file.into() {
            FileRef::Handle(handle) => handle.session().read_all(handle.fd()?).await,
            FileRef::Path(path) => {
                let handle = self.open(path, OpenMode::Read).await?;
                let data = self.read_all(handle.fd()?).await;
                let closed = handle.close().await;
                let data = data?;
                closed?;
                Ok(data)
            }
        }
    }

    /// [`read_file`](Self::read_file), decoded as UTF-8.
    pub async fn read_to_string<'a>(&self, file: impl Into<FileRef<'a>>) -> Result<String> {
        let data = self.read_file(file).await?;
        Ok(String::from_utf8(data.to_vec())?)
    }

    async fn read_all(&self, fh: u64) -> Result<Bytes> {
        let stat = self.fstat(fh).await?;
        if stat.is_file() {
            return self.read(fh, stat.size, 0).await;
        }

        let mut buf = BytesMut::new();
        loop {
            let chunk = self.read(fh, READ_FILE_CHUNK, 0).await?;
            if chunk.is_empty() {
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Replace the contents of a file, creating it if needed.
    pub async fn write_file<'a>(
        &self,
        file: impl Into<FileRef<'a>>,
        data: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.write_file_with(file, data, OpenMode::Write).await
    }

    /// Append to a file, creating it if needed. See
    /// [`FileHandle::append_file`] for handle targets.
    pub async fn append_file<'a>(
        &self,
        file: impl Into<FileRef<'a>>,
        data: impl AsRef<[u8]>,
    ) -> Result<()> {
        match file.into() {
            FileRef::Handle(handle) => handle.append_file(data).await,
            FileRef::Path(path) => self.write_file_with(path, data, OpenMode::Append).await,
        }
    }

    /// Write all of `data` from offset 0. `flags` applies when `file` is a
    /// path; a handle is written through its own session.
    ///
    /// Empty data opens (and so creates or truncates) the file but issues
    /// no write.
    pub async fn write_file_with<'a, 'f>(
        &self,
        file: impl Into<FileRef<'a>>,
        data: impl AsRef<[u8]>,
        flags: impl Into<OpenFlags<'f>>,
    ) -> Result<()> {
        let data = data.as_ref();
        match file.into() {
            FileRef::Handle(handle) => handle.session().write_all(handle.fd()?, 0, data).await,
            FileRef::Path(path) => {
                let handle = self.open(path, flags).await?;
                let written = self.write_all(handle.fd()?, 0, data).await;
                let closed = handle.close().await;
                written?;
                closed
            }
        }
    }

    /// Write `data` at `start` onward, resuming after short writes.
    pub(crate) async fn write_all(&self, fh: u64, start: u64, data: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        let mut retries = 0u32;

        while offset < data.len() {
            let n = self.write(fh, start + offset as u64, &data[offset..]).await?;
            if n == 0 {
                retries += 1;
                if retries > WRITE_RETRY_LIMIT {
                    return Err(ZrfsError::RetriesExhausted {
                        retries: WRITE_RETRY_LIMIT,
                    });
                }
                continue;
            }
            retries = 0;
            offset += usize::try_from(n).unwrap_or(usize::MAX).min(data.len() - offset);
        }
        Ok(())
    }

    // ========================================================================
    // Permissions
    // ========================================================================

    /// Access-control list of `path`.
    pub async fn get_permissions(&self, path: &str) -> Result<Vec<PermissionEntry>> {
        self.rpc.call(Getperm { path }).await
    }

    /// Grant `perm` on `path` to the peer with base-32 public key `key`
    /// (53 characters).
    pub async fn set_permission(&self, path: &str, key: &str, perm: u8) -> Result<()> {
        self.rpc.call(Setperm { path, key, perm }).await
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Close the underlying channel. Requests still in flight fail.
    pub async fn disconnect(&self) -> Result<()> {
        self.rpc.disconnect().await
    }
}

/// Join a directory path and an entry name.
fn join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}
