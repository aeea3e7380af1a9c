pub mod reader;
pub mod sim;
pub mod sink;
pub mod source;

use thiserror::Error;

// Re-export main types
pub use reader::ChunkSource;
pub use sim::{SimReader, SimSource};
pub use sink::{MemorySink, SegmentLocator, SegmentSink};
pub use source::{FaultKind, PresentableSource, SourceEvent, SourcePayload};

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("PayloadError: {0}")]
    PayloadError(String),
    #[error("CaptureError: {0}")]
    CaptureError(String),
    #[error("StorageError: {0}")]
    StorageError(String),
    #[error("NotAttached: {0}")]
    NotAttached(String),
}
