//! Byte streams over positioned reads and writes.
//!
//! Both adapters keep at most one request in flight. The request runs as a
//! spawned task, so dropping a stream (or a future polling it) never abandons
//! an I/O call halfway: teardown waits for the outstanding task to settle
//! before the handle is closed.
//!
//! ```text
//!   active ──end / error / close()──▶ closing ──pending I/O settled,──▶ closed
//!                                              handle released
//! ```

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::constants::{STREAM_CHUNK_SIZE, WRITE_RETRY_LIMIT};
use crate::error::{Result, ZrfsError};
use crate::handle::FileHandle;

/// Options for [`ReadStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStreamOptions {
    /// First byte to read.
    pub start: u64,
    /// Last byte to read, inclusive. Unbounded when `None`.
    pub end: Option<u64>,
    /// Largest read issued per chunk.
    pub chunk_size: u64,
    /// Close the handle when the stream ends or is dropped.
    pub auto_close: bool,
}

impl Default for ReadStreamOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            chunk_size: STREAM_CHUNK_SIZE,
            auto_close: true,
        }
    }
}

impl ReadStreamOptions {
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
            ..Self::default()
        }
    }
}

/// Options for [`WriteStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStreamOptions {
    /// File position of the first chunk.
    pub start: u64,
    /// Close the handle when the stream is closed or dropped.
    pub auto_close: bool,
}

impl Default for WriteStreamOptions {
    fn default() -> Self {
        Self {
            start: 0,
            auto_close: true,
        }
    }
}

enum State {
    Active,
    Closing(BoxFuture<'static, Result<()>>),
    Closed,
}

/// Wait for the outstanding request, then release the handle if asked to.
async fn settle_then_close<T: Send + 'static>(
    pending: Option<JoinHandle<Result<T>>>,
    handle: FileHandle,
    auto_close: bool,
) -> Result<()> {
    if let Some(task) = pending {
        // Its outcome has no reader any more; only its completion matters.
        let _ = task.await;
    }
    if auto_close {
        handle.close().await?;
    }
    Ok(())
}

/// Hand an unfinished teardown to the runtime.
fn detach_teardown(state: &mut State, teardown: impl FnOnce() -> BoxFuture<'static, Result<()>>) {
    let fut = match std::mem::replace(state, State::Closed) {
        State::Closed => return,
        State::Closing(fut) => fut,
        State::Active => teardown(),
    };
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move {
                if let Err(e) = fut.await {
                    warn!(error = %e, "stream teardown failed");
                }
            });
        }
        Err(_) => warn!("stream dropped outside a runtime; handle left open"),
    }
}

// ============================================================================
// ReadStream
// ============================================================================

/// A finite, non-restartable sequence of chunks read from a handle.
///
/// Yields `Result<Bytes>` items through [`Stream`], or through
/// [`next_chunk`](Self::next_chunk). The sequence ends when the requested
/// range is exhausted, the server returns an empty read, or the handle is
/// closed elsewhere.
pub struct ReadStream {
    handle: FileHandle,
    pos: u64,
    end: Option<u64>,
    chunk_size: u64,
    auto_close: bool,
    in_flight: Option<JoinHandle<Result<Bytes>>>,
    state: State,
}

impl ReadStream {
    pub(crate) fn new(handle: FileHandle, options: ReadStreamOptions) -> Self {
        Self {
            handle,
            pos: options.start,
            end: options.end,
            chunk_size: options.chunk_size.max(1),
            auto_close: options.auto_close,
            in_flight: None,
            state: State::Active,
        }
    }

    /// Position of the next byte to read.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// The next chunk, or `None` at the end of the sequence.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.next().await.transpose()
    }

    /// Stop reading. Waits for an outstanding read, then closes the handle
    /// when `auto_close` is set.
    pub async fn close(mut self) -> Result<()> {
        if let State::Active = self.state {
            self.begin_close();
        }
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Closing(fut) => fut.await,
            _ => Ok(()),
        }
    }

    /// Bytes to request next; zero once the range is exhausted.
    fn window(&self) -> u64 {
        match self.end {
            Some(end) if self.pos > end => 0,
            Some(end) => (end - self.pos).saturating_add(1).min(self.chunk_size),
            None => self.chunk_size,
        }
    }

    fn begin_close(&mut self) {
        self.state = State::Closing(
            settle_then_close(self.in_flight.take(), self.handle.clone(), self.auto_close).boxed(),
        );
    }
}

impl Stream for ReadStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Closed => return Poll::Ready(None),
                State::Closing(fut) => {
                    let result = ready!(fut.poll_unpin(cx));
                    this.state = State::Closed;
                    return Poll::Ready(result.err().map(Err));
                }
                State::Active => {}
            }

            if this.in_flight.is_none() {
                if this.handle.is_closed() {
                    debug!(fd = this.handle.raw_fd(), "handle closed under read stream");
                    this.state = State::Closed;
                    continue;
                }
                let len = this.window();
                if len == 0 {
                    this.begin_close();
                    continue;
                }
                let handle = this.handle.clone();
                let pos = this.pos;
                this.in_flight = Some(tokio::spawn(async move { handle.read(len, pos).await }));
            }

            let Some(task) = this.in_flight.as_mut() else {
                continue;
            };
            let joined = ready!(task.poll_unpin(cx));
            this.in_flight = None;

            match joined.map_err(ZrfsError::from).and_then(|r| r) {
                Ok(chunk) if chunk.is_empty() => {
                    this.begin_close();
                }
                Ok(chunk) => {
                    this.pos += chunk.len() as u64;
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Err(e) => {
                    this.begin_close();
                    return Poll::Ready(Some(Err(e)));
                }
            }
        }
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        if matches!(self.state, State::Active) && self.in_flight.is_none() && !self.auto_close {
            return;
        }
        let pending = self.in_flight.take();
        let handle = self.handle.clone();
        let auto_close = self.auto_close;
        detach_teardown(&mut self.state, || {
            settle_then_close(pending, handle, auto_close).boxed()
        });
    }
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("handle", &self.handle)
            .field("pos", &self.pos)
            .field("end", &self.end)
            .field("in_flight", &self.in_flight.is_some())
            .finish()
    }
}

// ============================================================================
// WriteStream
// ============================================================================

/// Write one chunk completely, starting at `position`.
///
/// A "try again" reply counts as zero progress. Progress resets the retry
/// budget; more than [`WRITE_RETRY_LIMIT`] consecutive retries without
/// progress fail the chunk. Returns the bytes written.
async fn write_chunk(handle: FileHandle, data: Bytes, position: u64) -> Result<u64> {
    let mut written = 0usize;
    let mut retries = 0u32;

    while written < data.len() {
        let n = match handle.write_at(&data[written..], position + written as u64).await {
            Ok(n) => usize::try_from(n).unwrap_or(usize::MAX).min(data.len() - written),
            Err(e) if e.is_again() => 0,
            Err(e) => return Err(e),
        };

        if n == 0 {
            retries += 1;
            if retries > WRITE_RETRY_LIMIT {
                return Err(ZrfsError::RetriesExhausted {
                    retries: WRITE_RETRY_LIMIT,
                });
            }
            debug!(fd = handle.raw_fd(), retries, "write made no progress, retrying");
            continue;
        }
        retries = 0;
        written += n;
    }
    Ok(written as u64)
}

/// A sink of chunks written consecutively to a handle.
///
/// Implements [`Sink<Bytes>`]: the sink is ready for the next chunk only
/// once the previous one is fully written. [`write`](Self::write) and
/// [`close`](Self::close) are the same operations as inherent methods.
pub struct WriteStream {
    handle: FileHandle,
    pos: u64,
    auto_close: bool,
    in_flight: Option<JoinHandle<Result<u64>>>,
    state: State,
}

impl WriteStream {
    pub(crate) fn new(handle: FileHandle, options: WriteStreamOptions) -> Self {
        Self {
            handle,
            pos: options.start,
            auto_close: options.auto_close,
            in_flight: None,
            state: State::Active,
        }
    }

    /// File position the next chunk will be written at.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Write one chunk completely.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        self.send(chunk.into()).await
    }

    /// Finish writing. Waits for an outstanding chunk, then closes the
    /// handle when `auto_close` is set.
    pub async fn close(mut self) -> Result<()> {
        SinkExt::close(&mut self).await
    }

    fn begin_close(&mut self) {
        self.state = State::Closing(
            settle_then_close(self.in_flight.take(), self.handle.clone(), self.auto_close).boxed(),
        );
    }

    /// Drive the outstanding chunk to completion.
    fn poll_settle(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let Some(task) = self.in_flight.as_mut() {
            let joined = ready!(task.poll_unpin(cx));
            self.in_flight = None;
            match joined.map_err(ZrfsError::from).and_then(|r| r) {
                Ok(n) => self.pos += n,
                Err(e) => {
                    self.begin_close();
                    return Poll::Ready(Err(e));
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Sink<Bytes> for WriteStream {
    type Error = ZrfsError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if !matches!(this.state, State::Active) {
            return Poll::Ready(Err(ZrfsError::StreamClosed));
        }
        this.poll_settle(cx)
    }

    fn start_send(self: Pin<&mut Self>, chunk: Bytes) -> Result<()> {
        let this = self.get_mut();
        if !matches!(this.state, State::Active) {
            return Err(ZrfsError::StreamClosed);
        }
        let fd = this.handle.fd()?;
        if chunk.is_empty() {
            return Ok(());
        }
        debug!(fd, pos = this.pos, len = chunk.len(), "write stream chunk");
        let handle = this.handle.clone();
        let pos = this.pos;
        this.in_flight = Some(tokio::spawn(write_chunk(handle, chunk, pos)));
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if !matches!(this.state, State::Active) {
            return Poll::Ready(Ok(()));
        }
        this.poll_settle(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Closed => return Poll::Ready(Ok(())),
                State::Closing(fut) => {
                    let result = ready!(fut.poll_unpin(cx));
                    this.state = State::Closed;
                    return Poll::Ready(result);
                }
                State::Active => {
                    // A failed chunk starts the teardown itself and is reported here.
                    ready!(this.poll_settle(cx))?;
                    if matches!(this.state, State::Active) {
                        this.begin_close();
                    }
                }
            }
        }
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        if matches!(self.state, State::Active) && self.in_flight.is_none() && !self.auto_close {
            return;
        }
        let pending = self.in_flight.take();
        let handle = self.handle.clone();
        let auto_close = self.auto_close;
        detach_teardown(&mut self.state, || {
            settle_then_close(pending, handle, auto_close).boxed()
        });
    }
}

impl std::fmt::Debug for WriteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStream")
            .field("handle", &self.handle)
            .field("pos", &self.pos)
            .field("in_flight", &self.in_flight.is_some())
            .finish()
    }
}
