//! Send an operation, await its reply, turn failures into errors.

use std::sync::Arc;

use zrfs_proto::{Errno, Operation, Reply};

use crate::error::{OpError, Result};
use crate::transport::Channel;

/// Shared handle on the channel. Cloning is cheap.
#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn Channel>,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// Encode `op`, exchange it, decode the reply.
    ///
    /// A non-zero status becomes an [`OpError`] naming the operation and its
    /// arguments. A reply too short for its operation is a protocol error,
    /// never a partial value.
    pub async fn call<O>(&self, op: O) -> Result<O::Output>
    where
        O: Operation + Send,
    {
        let frame = op.encode()?;
        tracing::trace!(op = %O::OPCODE, len = frame.len(), "zrfs request");

        let reply = self.channel.request(frame).await?;
        match O::decode(&reply)? {
            Reply::Success(value) => Ok(value),
            Reply::Failure(code) => {
                let err = OpError::new(Errno::from_code(code), O::OPCODE, op.args());
                tracing::debug!(error = %err, "zrfs operation failed");
                Err(err.into())
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        Ok(self.channel.disconnect().await?)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
