use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::sink::SegmentLocator;
use crate::MediaError;

/// Payload currently loaded into the presentable source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePayload {
    /// A finished segment, addressed by its locator.
    Clip(SegmentLocator),
    /// The live camera feed.
    Live,
    /// Nothing attached.
    Empty,
}

impl SourcePayload {
    pub fn is_empty(&self) -> bool {
        matches!(self, SourcePayload::Empty)
    }
}

/// Classification of a playback fault reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// The source could not decode the loaded payload.
    Decode,
    /// Anything else; not auto-recoverable.
    Other,
}

/// Notifications emitted by a presentable source.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// Native position moved (seconds into the current payload).
    PositionChanged(f64),
    /// Metadata resolved; the payload's true duration is now known.
    DurationResolved(f64),
    /// The payload played through to its natural end.
    Ended,
    /// The source hit a playback fault.
    Fault { kind: FaultKind, message: String },
}

/// The single shared video-output resource.
///
/// Exactly one owner (live feed or playback engine) may hold it at a time;
/// the orchestrator arbitrates that exclusivity. `set_payload` is the one
/// suspending operation; callers must never start a second swap while a
/// prior one is still pending.
#[async_trait]
pub trait PresentableSource: Send + Sync {
    /// Swap the underlying payload. Resolves once the source is ready to
    /// render the new payload.
    async fn set_payload(&self, payload: SourcePayload) -> Result<(), MediaError>;

    async fn payload(&self) -> SourcePayload;

    /// Native position in seconds within the current payload.
    async fn position(&self) -> f64;

    async fn set_position(&self, secs: f64);

    /// `None` until the payload's metadata has resolved.
    async fn duration(&self) -> Option<f64>;

    async fn play(&self) -> Result<(), MediaError>;

    async fn pause(&self) -> Result<(), MediaError>;

    async fn is_playing(&self) -> bool;

    /// Subscribe to source notifications.
    fn subscribe(&self) -> broadcast::Receiver<SourceEvent>;
}
