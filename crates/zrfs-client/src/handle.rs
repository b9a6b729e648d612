//! Open file handles.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, watch};
use tracing::debug;
use zrfs_proto::{Stat, Target};

use crate::error::{Result, ZrfsError};
use crate::session::Session;
use crate::stream::{ReadStream, ReadStreamOptions, WriteStream, WriteStreamOptions};

/// Handle operations this protocol version cannot express. They are not
/// methods of [`FileHandle`]; see [`FileHandle::unsupported`].
pub const UNSUPPORTED_OPS: &[&str] = &[
    "datasync",
    "sync",
    "readv",
    "writev",
    "read_file",
    "write_file",
    "read_lines",
];

/// Source slice and file position for [`FileHandle::write`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Start of the slice of `data` to write.
    pub offset: usize,
    /// Bytes to write from `offset`; the rest of `data` when `None`.
    pub length: Option<usize>,
    /// File position to write at.
    pub position: u64,
}

impl WriteOptions {
    pub fn at(position: u64) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// The selected slice, clamped to `data`.
    fn slice<'d>(&self, data: &'d [u8]) -> &'d [u8] {
        let start = self.offset.min(data.len());
        let available = data.len() - start;
        let len = self.length.map_or(available, |l| l.min(available));
        &data[start..start + len]
    }
}

struct Inner {
    session: Session,
    fd: u64,
    /// Serializes `close` so concurrent callers share one release.
    closing: Mutex<()>,
    /// Flips to `true` once, after the server released the handle.
    closed: watch::Sender<bool>,
}

/// One open remote file descriptor.
///
/// Clones refer to the same descriptor. The handle is released by
/// [`close`](Self::close), explicitly or through a stream that owns it;
/// after that every I/O call fails with [`ZrfsError::HandleClosed`].
#[derive(Clone)]
pub struct FileHandle {
    inner: Arc<Inner>,
}

impl FileHandle {
    pub(crate) fn new(session: Session, fd: u64) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                session,
                fd,
                closing: Mutex::new(()),
                closed,
            }),
        }
    }

    /// The server's descriptor number, while open.
    pub fn fd(&self) -> Result<u64> {
        if self.is_closed() {
            return Err(ZrfsError::HandleClosed(self.inner.fd));
        }
        Ok(self.inner.fd)
    }

    /// The descriptor number, open or not.
    pub fn raw_fd(&self) -> u64 {
        self.inner.fd
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the handle has been closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Release the descriptor on the server.
    ///
    /// Idempotent: once closed, further calls do nothing. Concurrent calls
    /// issue a single release and all observe its outcome. If the release
    /// fails the handle stays open.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.inner.closing.lock().await;
        if self.is_closed() {
            return Ok(());
        }
        self.inner.session.release(self.inner.fd).await?;
        self.inner.closed.send_replace(true);
        debug!(fd = self.inner.fd, "handle closed");
        Ok(())
    }

    /// Read up to `length` bytes at `position`. Empty at end of file.
    pub async fn read(&self, length: u64, position: u64) -> Result<Bytes> {
        self.inner.session.read(self.fd()?, length, position).await
    }

    /// Write a slice of `data`; returns the bytes the server accepted, which
    /// may be fewer than offered.
    pub async fn write(&self, data: &[u8], options: WriteOptions) -> Result<u64> {
        let fd = self.fd()?;
        self.inner
            .session
            .write(fd, options.position, options.slice(data))
            .await
    }

    /// Write all of `data` at `position`; returns the bytes accepted.
    pub async fn write_at(&self, data: &[u8], position: u64) -> Result<u64> {
        self.write(data, WriteOptions::at(position)).await
    }

    pub async fn stat(&self) -> Result<Stat> {
        self.inner.session.fstat(self.fd()?).await
    }

    pub async fn truncate(&self, length: u64) -> Result<()> {
        let fd = self.fd()?;
        self.inner.session.truncate(Target::Handle(fd), length).await
    }

    /// Write all of `data` at the current end of the file.
    ///
    /// The end is taken from `fstat` before the first write, so concurrent
    /// writers may interleave. Handles opened with `O_APPEND` append
    /// server-side regardless of the position sent.
    pub async fn append_file(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let fd = self.fd()?;
        let end = self.inner.session.fstat(fd).await?.size;
        self.inner.session.write_all(fd, end, data.as_ref()).await
    }

    /// A lazy sequence of chunks read from this handle.
    pub fn create_read_stream(&self, options: ReadStreamOptions) -> ReadStream {
        ReadStream::new(self.clone(), options)
    }

    /// A sink writing consecutive chunks to this handle.
    pub fn create_write_stream(&self, options: WriteStreamOptions) -> WriteStream {
        WriteStream::new(self.clone(), options)
    }

    /// The typed error for a handle operation this protocol version cannot
    /// perform, or `None` if `op` is not one of [`UNSUPPORTED_OPS`].
    pub fn unsupported(op: &str) -> Option<ZrfsError> {
        UNSUPPORTED_OPS
            .iter()
            .copied()
            .find(|name| *name == op)
            .map(ZrfsError::Unsupported)
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("fd", &self.inner.fd)
            .field("closed", &self.is_closed())
            .finish()
    }
}
