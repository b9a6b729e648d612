//! Request/reply transport.
//!
//! The protocol layer only needs one primitive: send a request frame and get
//! the matching reply frame back. [`Channel`] is that seam. [`FramedChannel`]
//! implements it over any byte stream; the SSH subsystem channel is one such
//! stream, an in-memory duplex is another.
//!
//! Messages on the stream are length-delimited and carry a correlation tag so
//! that concurrent requests may be answered in any order:
//!
//! ```text
//! | len u32 LE | tag u64 LE | frame ... |
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::constants::MAX_FRAME_LEN;

/// Width of the correlation tag prefixed to every message.
const TAG_LEN: usize = 8;

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel closed")]
    Closed,
    #[error("SSH error: {0}")]
    Ssh(String),
}

/// A reliable, ordered request/reply channel to one server.
///
/// Implementations must be safe to share: several requests may be
/// outstanding at once and each caller receives its own reply.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send one request frame and wait for its reply frame.
    async fn request(&self, frame: Bytes) -> Result<Bytes, TransportError>;

    /// Tear the channel down. Outstanding requests fail with
    /// [`TransportError::Closed`].
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Reply slots by tag. `None` once the reader has stopped, so late
/// requests fail instead of waiting forever.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Bytes>>>>>;
type Writer<S> = SplitSink<Framed<S, LengthDelimitedCodec>, Bytes>;

/// Tagged request/reply multiplexer over a byte stream.
pub struct FramedChannel<S> {
    writer: tokio::sync::Mutex<Writer<S>>,
    pending: Pending,
    next_tag: AtomicU64,
    reader: JoinHandle<()>,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap `stream` and spawn the reply router. Must be called from within
    /// a Tokio runtime.
    pub fn new(stream: S) -> Self {
        let framed = Framed::new(stream, codec());
        let (writer, mut replies) = framed.split();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));

        let router = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = replies.next().await {
                let mut msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("zrfs channel read failed: {}", e);
                        break;
                    }
                };
                if msg.len() < TAG_LEN {
                    log::warn!("dropping {}-byte message without a tag", msg.len());
                    continue;
                }
                let tag = msg.get_u64_le();
                let slot = router.lock().as_mut().and_then(|map| map.remove(&tag));
                match slot {
                    Some(tx) => {
                        // The caller may have given up; nothing to do then.
                        let _ = tx.send(msg.freeze());
                    }
                    None => log::warn!("reply for unknown tag {}", tag),
                }
            }
            // Dropping the senders fails every outstanding request.
            router.lock().take();
            log::debug!("zrfs channel reader finished");
        });

        Self {
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_tag: AtomicU64::new(1),
            reader,
        }
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Removes a pending entry if the request future is dropped early.
struct PendingGuard<'a> {
    pending: &'a Pending,
    tag: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(map) = self.pending.lock().as_mut() {
            map.remove(&self.tag);
        }
    }
}

#[async_trait]
impl<S> Channel for FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn request(&self, frame: Bytes) -> Result<Bytes, TransportError> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(map) => map.insert(tag, tx),
            None => return Err(TransportError::Closed),
        };
        let _guard = PendingGuard {
            pending: &self.pending,
            tag,
        };

        let mut msg = BytesMut::with_capacity(TAG_LEN + frame.len());
        msg.put_u64_le(tag);
        msg.put_slice(&frame);
        self.writer.lock().await.send(msg.freeze()).await?;

        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let result = self.writer.lock().await.close().await;
        self.reader.abort();
        self.pending.lock().take();
        result.map_err(TransportError::from)
    }
}

impl<S> Drop for FramedChannel<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
