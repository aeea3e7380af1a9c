use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::MediaError;

/// A capability that emits binary chunks on a timeslice until stopped.
///
/// `stop` guarantees the trailing unflushed bytes are handed back before it
/// completes, so a recorder never loses the tail of a capture cycle.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Begin emitting chunks every `timeslice`.
    async fn start(&self, timeslice: Duration) -> Result<(), MediaError>;

    /// Stop emitting. Returns the final trailing chunk, if any bytes were
    /// captured since the last emission.
    async fn stop(&self) -> Result<Option<Bytes>, MediaError>;

    /// Receive the next chunk. Returns `None` once stopped and drained.
    async fn recv(&self) -> Option<Bytes>;
}
