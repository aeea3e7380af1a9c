use std::sync::Arc;
use std::time::Duration;

use media_source::{PresentableSource, SegmentSink, SourcePayload};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::segment_store::SegmentStore;
use crate::stream_recorder::{Recording, StreamRecorder};
use crate::{Clock, DvrConfig, DvrError, DvrEvent};

struct LiveShared {
    recording: bool,
    recording_start_time: Option<f64>,
    attached: bool,
}

/// Binds the stream recorder's output into the segment collection, tracks
/// the authoritative start time of the current recording, and presents the
/// live feed while capture continues.
pub struct LiveStreamRecorder {
    recorder: Arc<StreamRecorder>,
    store: Arc<RwLock<SegmentStore>>,
    sink: Arc<dyn SegmentSink>,
    source: Arc<dyn PresentableSource>,
    shared: Arc<RwLock<LiveShared>>,
    event_tx: broadcast::Sender<DvrEvent>,
    clock: Clock,
    config: DvrConfig,
    cancel: CancellationToken,
}

impl LiveStreamRecorder {
    pub fn new(
        recorder: Arc<StreamRecorder>,
        store: Arc<RwLock<SegmentStore>>,
        sink: Arc<dyn SegmentSink>,
        source: Arc<dyn PresentableSource>,
        event_tx: broadcast::Sender<DvrEvent>,
        clock: Clock,
        config: DvrConfig,
    ) -> Self {
        Self {
            recorder,
            store,
            sink,
            source,
            shared: Arc::new(RwLock::new(LiveShared {
                recording: false,
                recording_start_time: None,
                attached: false,
            })),
            event_tx,
            clock,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn is_recording(&self) -> bool {
        self.shared.read().await.recording
    }

    /// Authoritative start of the current recording. Available only while
    /// recording; anything else is a caller bug.
    pub async fn recording_start_time(&self) -> Result<f64, DvrError> {
        self.shared
            .read()
            .await
            .recording_start_time
            .ok_or_else(|| {
                DvrError::Precondition("recording start time while not recording".to_string())
            })
    }

    /// Begin recording and wire the recording pump and live-duration poll.
    pub async fn start(&self) -> Result<(), DvrError> {
        if self.shared.read().await.recording {
            return Ok(());
        }

        self.recorder.start_recording().await?;
        if !self.recorder.is_recording().await {
            // Capture failed to start; the error went out as a signal.
            return Ok(());
        }

        {
            let mut shared = self.shared.write().await;
            shared.recording = true;
            shared.recording_start_time = Some(self.clock.now());
        }

        if let Some(recordings) = self.recorder.take_recordings().await {
            self.spawn_pump(recordings);
        }
        self.spawn_live_poll();
        Ok(())
    }

    /// Stop recording. The recorder's final flush still flows through the
    /// pump into the collection.
    pub async fn stop(&self) -> Result<(), DvrError> {
        if !self.shared.read().await.recording {
            return Ok(());
        }
        self.recorder.stop_recording().await?;
        let mut shared = self.shared.write().await;
        shared.recording = false;
        shared.recording_start_time = None;
        Ok(())
    }

    /// Duration of the live recording so far.
    ///
    /// While the live feed is attached and advancing, the source's own
    /// reported position is the better estimate; a position implying an
    /// earlier true start back-corrects `recording_start_time` (a
    /// drift-correction, only ever applied in the direction that improves
    /// precision). Otherwise falls back to elapsed wall-clock time.
    pub async fn duration(&self) -> Result<f64, DvrError> {
        let now = self.clock.now();
        let mut shared = self.shared.write().await;
        let start = shared.recording_start_time.ok_or_else(|| {
            DvrError::Precondition("live duration while not recording".to_string())
        })?;

        if shared.attached
            && self.source.payload().await == SourcePayload::Live
            && self.source.is_playing().await
        {
            let position = self.source.position().await;
            let implied_start = now - position;
            if implied_start < start {
                log::debug!(
                    "Back-correcting recording start {:.3}s -> {:.3}s",
                    start,
                    implied_start
                );
                shared.recording_start_time = Some(implied_start);
                return Ok(now - implied_start);
            }
        }
        Ok(now - start)
    }

    /// Timeline instant the live recording currently ends at.
    pub async fn live_end_time(&self) -> Result<f64, DvrError> {
        let start = self.recording_start_time().await?;
        Ok(start + self.duration().await?)
    }

    /// Make sure the collection holds a segment covering `time`, forcing an
    /// early render of the in-flight chunk if needed. Asking for a time
    /// past the live edge is a logic error: no segment will ever exist
    /// there.
    pub async fn try_fill_segments(&self, time: f64) -> Result<(), DvrError> {
        if !self.is_recording().await {
            // Nothing in flight to render; the collection either already
            // covers the time or never will.
            let store = self.store.read().await;
            if store.is_empty() {
                return Err(DvrError::NoData("no recorded data available".to_string()));
            }
            if time > store.last_end_time()? {
                return Err(DvrError::NoData(format!(
                    "recording has stopped; nothing will cover {:.3}s",
                    time
                )));
            }
            return Ok(());
        }

        let end = self.live_end_time().await?;
        if time > end {
            return Err(DvrError::NoData(format!(
                "requested {:.3}s but the live recording ends at {:.3}s",
                time, end
            )));
        }

        if let Some(recording) = self.recorder.force_render().await? {
            self.ingest(&recording).await?;
        }

        let store = self.store.read().await;
        if store.is_empty() {
            return Err(DvrError::NoData(
                "no recorded data available yet".to_string(),
            ));
        }
        if time > store.last_end_time()? {
            return Err(DvrError::Internal(format!(
                "segment fill left {:.3}s uncovered",
                time
            )));
        }
        Ok(())
    }

    /// Attach the live feed as the active presentable payload. Idempotent.
    pub async fn attach_live(&self) -> Result<(), DvrError> {
        if self.shared.read().await.attached {
            return Ok(());
        }
        self.source.set_payload(SourcePayload::Live).await?;
        self.shared.write().await.attached = true;
        log::info!("Live feed attached");
        Ok(())
    }

    /// Detach the live feed, leaving the presentable source cleared.
    /// Idempotent.
    pub async fn detach_live(&self) -> Result<(), DvrError> {
        if !self.shared.read().await.attached {
            return Ok(());
        }
        self.source.pause().await?;
        self.source.set_payload(SourcePayload::Empty).await?;
        self.shared.write().await.attached = false;
        log::info!("Live feed detached");
        Ok(())
    }

    pub async fn is_attached(&self) -> bool {
        self.shared.read().await.attached
    }

    pub async fn play(&self) -> Result<(), DvrError> {
        if !self.shared.read().await.attached {
            return Err(DvrError::Precondition(
                "live play while feed not attached".to_string(),
            ));
        }
        self.source.play().await?;
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), DvrError> {
        if !self.shared.read().await.attached {
            return Err(DvrError::Precondition(
                "live pause while feed not attached".to_string(),
            ));
        }
        self.source.pause().await?;
        Ok(())
    }

    /// Stop everything this recorder owns. Safe in any state.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        if let Err(e) = self.stop().await {
            log::warn!("Recorder stop during dispose failed: {}", e);
        }
        if let Err(e) = self.detach_live().await {
            log::warn!("Live detach during dispose failed: {}", e);
        }
    }

    /// Store a recording's payload and fold it into the collection,
    /// releasing the locator of a replaced trailing partial.
    async fn ingest(&self, recording: &Recording) -> Result<(), DvrError> {
        let locator = self
            .sink
            .store(recording.payload.clone())
            .await
            .map_err(|e| DvrError::Capture(e.to_string()))?;
        let outcome = self.store.write().await.add_segment(recording, locator);
        if let Some(old) = outcome.replaced {
            self.sink.release(&old).await;
        }
        Ok(())
    }

    fn spawn_pump(&self, mut recordings: tokio::sync::mpsc::UnboundedReceiver<Recording>) {
        let this = self.handle();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    recording = recordings.recv() => {
                        let Some(recording) = recording else { break };
                        if let Err(e) = this.ingest(&recording).await {
                            log::error!("Failed to ingest recording: {}", e);
                            let _ = this.event_tx.send(DvrEvent::RecordingError {
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
        });
    }

    fn spawn_live_poll(&self) {
        let this = self.handle();
        let cancel = self.cancel.clone();
        let period = Duration::from_millis(self.config.live_poll_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !this.is_recording().await {
                    break;
                }
                if let Ok(duration) = this.duration().await {
                    let _ = this
                        .event_tx
                        .send(DvrEvent::LiveDurationUpdate { duration });
                }
            }
        });
    }

    fn handle(&self) -> LiveStreamRecorder {
        LiveStreamRecorder {
            recorder: self.recorder.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
            source: self.source.clone(),
            shared: self.shared.clone(),
            event_tx: self.event_tx.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl Clone for LiveStreamRecorder {
    fn clone(&self) -> Self {
        self.handle()
    }
}
