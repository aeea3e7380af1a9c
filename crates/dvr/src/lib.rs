pub mod live_recorder;
pub mod orchestrator;
pub mod playback;
pub mod scrub;
pub mod segment_store;
pub mod stream_recorder;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Re-export main types
pub use live_recorder::LiveStreamRecorder;
pub use orchestrator::DvrOrchestrator;
pub use playback::PlaybackEngine;
pub use scrub::{ScrubController, ScrubMode};
pub use segment_store::{Segment, SegmentStore};
pub use stream_recorder::{Recording, StreamRecorder};

#[derive(Error, Debug)]
pub enum DvrError {
    /// Caller bug: an operation was invoked in a state it does not support.
    #[error("PreconditionViolation: {0}")]
    Precondition(String),
    /// The capture capability failed; recording for this cycle is abandoned.
    #[error("CaptureError: {0}")]
    Capture(String),
    /// The presentable source failed while rendering.
    #[error("PlaybackError: {0}")]
    Playback(String),
    /// Asked to play back or scrub to data that does not and will not exist.
    #[error("NoRecordedData: {0}")]
    NoData(String),
    /// Segment index corruption; the collection's invariants no longer hold.
    #[error("InternalError: {0}")]
    Internal(String),
}

impl From<media_source::MediaError> for DvrError {
    fn from(e: media_source::MediaError) -> Self {
        DvrError::Playback(e.to_string())
    }
}

/// DVR mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DvrMode {
    Live,
    Playback,
}

/// Unified event stream republished to the UI and sibling components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DvrEvent {
    /// Mode switched between live and playback
    ModeChanged { mode: DvrMode },
    /// Playback or live feed resumed
    Played,
    /// Playback or live feed paused
    Paused,
    /// Playback position moved
    PositionUpdate { position: f64, speed: f64 },
    /// Live recording duration grew
    LiveDurationUpdate { duration: f64 },
    /// Segment appended or trailing partial replaced
    SegmentAdded {
        index: usize,
        start_time: f64,
        duration: f64,
        is_partial: bool,
        replaced: bool,
    },
    /// Segment duration corrected against the source's reported value
    SegmentDurationCorrected { index: usize, duration: f64 },
    /// A new segment became the active render target
    SegmentRendered { index: usize },
    /// Playback fault, with whether auto-recovery handled it
    PlaybackError {
        index: Option<usize>,
        error: String,
        handled: bool,
    },
    /// Capture failed to start for a cycle
    RecordingError { error: String },
    /// Scrubbing hit the start of the recorded timeline
    ReachedStart,
    /// Playback hit the end of the recorded timeline
    ReachedEnd,
}

/// Tunable constants. The epsilon and margins are configuration, not
/// load-bearing invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DvrConfig {
    /// Chunk emission period requested from the capture capability (ms)
    pub timeslice_ms: u64,
    /// Minimum/target duration of one non-partial recording chunk
    pub min_chunk_secs: f64,
    /// Strictly-positive separation between adjacent segment boundaries
    pub boundary_epsilon_secs: f64,
    /// How far to skip past a decode fault before resuming
    pub decode_skip_secs: f64,
    /// Default distance behind the live edge when switching to playback
    pub live_edge_margin_secs: f64,
    /// One frame of simulated motion
    pub frame_interval_secs: f64,
    /// Scrub tick period (ms)
    pub scrub_tick_ms: u64,
    /// Smallest scrub speed magnitude
    pub min_scrub_speed: f64,
    /// Largest scrub speed magnitude
    pub max_scrub_speed: f64,
    /// Initial magnitude when entering rewind
    pub rewind_start_speed: f64,
    /// Initial magnitude when entering fast-forward
    pub fast_forward_start_speed: f64,
    /// Initial magnitude when entering slow-forward
    pub slow_forward_start_speed: f64,
    /// Live duration poll period while in playback (ms)
    pub live_poll_ms: u64,
}

impl Default for DvrConfig {
    fn default() -> Self {
        Self {
            timeslice_ms: 200,
            min_chunk_secs: 5.0,
            boundary_epsilon_secs: 0.001,
            decode_skip_secs: 3.0,
            live_edge_margin_secs: 1.0,
            frame_interval_secs: 1.0 / 30.0,
            scrub_tick_ms: 33,
            min_scrub_speed: 0.25,
            max_scrub_speed: 16.0,
            rewind_start_speed: 2.0,
            fast_forward_start_speed: 2.0,
            slow_forward_start_speed: 0.5,
            live_poll_ms: 1000,
        }
    }
}

/// Session timeline clock.
///
/// Positions and segment start times are f64 seconds since the session
/// epoch. Backed by the tokio clock, so it follows virtual time in tests.
#[derive(Debug, Clone)]
pub struct Clock {
    epoch: tokio::time::Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }

    /// Seconds elapsed since the session epoch.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
