use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::MediaError;

/// Opaque handle to the stored bytes of one segment.
///
/// Owned by the segment collection; must be released through the sink that
/// issued it when the segment is superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocator {
    pub id: u64,
    pub uri: String,
}

/// Persistence collaborator: turns a finished recording payload into a
/// durable locator.
#[async_trait]
pub trait SegmentSink: Send + Sync {
    async fn store(&self, payload: Bytes) -> Result<SegmentLocator, MediaError>;

    /// Revoke a locator whose segment has been superseded.
    async fn release(&self, locator: &SegmentLocator);
}

/// In-memory sink used when no durable persistence collaborator is wired in.
pub struct MemorySink {
    next_id: AtomicU64,
    blobs: Arc<RwLock<HashMap<u64, Bytes>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            blobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of live (unreleased) payloads.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    pub async fn get(&self, locator: &SegmentLocator) -> Option<Bytes> {
        self.blobs.read().await.get(&locator.id).cloned()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SegmentSink for MemorySink {
    async fn store(&self, payload: Bytes) -> Result<SegmentLocator, MediaError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let uri = format!("mem://{}_{}", id, chrono::Utc::now().timestamp_millis());
        self.blobs.write().await.insert(id, payload);
        log::debug!("Stored segment payload as {}", uri);
        Ok(SegmentLocator { id, uri })
    }

    async fn release(&self, locator: &SegmentLocator) {
        if self.blobs.write().await.remove(&locator.id).is_none() {
            log::warn!("Released unknown locator {}", locator.uri);
        } else {
            log::debug!("Released locator {}", locator.uri);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_release_drops_payload() {
        let sink = MemorySink::new();
        let loc = sink.store(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(sink.len().await, 1);
        assert_eq!(sink.get(&loc).await.unwrap(), Bytes::from_static(b"abc"));

        sink.release(&loc).await;
        assert!(sink.is_empty().await);
        assert!(sink.get(&loc).await.is_none());
    }

    #[tokio::test]
    async fn locators_are_never_reused() {
        let sink = MemorySink::new();
        let a = sink.store(Bytes::from_static(b"a")).await.unwrap();
        sink.release(&a).await;
        let b = sink.store(Bytes::from_static(b"b")).await.unwrap();
        assert_ne!(a.id, b.id);
    }
}
