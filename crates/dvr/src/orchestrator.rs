use std::sync::Arc;

use media_source::{ChunkSource, PresentableSource, SegmentSink};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::live_recorder::LiveStreamRecorder;
use crate::playback::PlaybackEngine;
use crate::scrub::ScrubController;
use crate::segment_store::SegmentStore;
use crate::stream_recorder::StreamRecorder;
use crate::{Clock, DvrConfig, DvrError, DvrEvent, DvrMode};

/// Capacity of the session event bus.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Top-level DVR session.
///
/// Owns the live recorder, playback engine and scrub controller, arbitrates
/// which of them holds the presentable source, and exposes the combined
/// transport surface. All components publish onto one shared event bus;
/// `subscribe` hands out receivers on that bus.
pub struct DvrOrchestrator {
    live: LiveStreamRecorder,
    engine: PlaybackEngine,
    scrub: ScrubController,
    mode: Arc<RwLock<DvrMode>>,
    event_tx: broadcast::Sender<DvrEvent>,
    cancel: CancellationToken,
    config: DvrConfig,
}

impl DvrOrchestrator {
    /// Wire a session over the given capture, persistence and presentation
    /// capabilities. Starts in live mode with nothing recording.
    pub fn new(
        reader: Arc<dyn ChunkSource>,
        sink: Arc<dyn SegmentSink>,
        source: Arc<dyn PresentableSource>,
        config: DvrConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let clock = Clock::new();
        let store = Arc::new(RwLock::new(SegmentStore::new(
            config.boundary_epsilon_secs,
            event_tx.clone(),
        )));
        let recorder = Arc::new(StreamRecorder::new(
            reader,
            event_tx.clone(),
            clock.clone(),
            config.clone(),
        ));
        let live = LiveStreamRecorder::new(
            recorder,
            store.clone(),
            sink,
            source.clone(),
            event_tx.clone(),
            clock,
            config.clone(),
        );
        let engine = PlaybackEngine::new(store, source, event_tx.clone(), config.clone());
        let scrub = ScrubController::new(engine.clone(), event_tx.clone(), config.clone());

        let orchestrator = Self {
            live,
            engine,
            scrub,
            mode: Arc::new(RwLock::new(DvrMode::Live)),
            event_tx,
            cancel: CancellationToken::new(),
            config,
        };
        orchestrator.spawn_end_watcher();
        orchestrator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DvrEvent> {
        self.event_tx.subscribe()
    }

    pub async fn mode(&self) -> DvrMode {
        *self.mode.read().await
    }

    pub async fn is_recording(&self) -> bool {
        self.live.is_recording().await
    }

    /// Begin capturing the live feed. If currently in live mode the feed is
    /// also attached and playing.
    pub async fn start_recording(&self) -> Result<(), DvrError> {
        self.live.start().await?;
        if *self.mode.read().await == DvrMode::Live && self.live.is_recording().await {
            self.live.attach_live().await?;
            self.live.play().await?;
            let _ = self.event_tx.send(DvrEvent::Played);
        }
        Ok(())
    }

    pub async fn stop_recording(&self) -> Result<(), DvrError> {
        self.live.stop().await
    }

    /// Current timeline position: the live edge in live mode, the engine's
    /// absolute position in playback.
    pub async fn position(&self) -> Result<f64, DvrError> {
        let mode = *self.mode.read().await;
        match mode {
            DvrMode::Live => self.live.live_end_time().await,
            DvrMode::Playback => self.engine.absolute_position().await,
        }
    }

    /// Hand the presentable source back to the live feed. No-op while
    /// already live.
    pub async fn switch_to_live_stream(&self) -> Result<(), DvrError> {
        if *self.mode.read().await == DvrMode::Live {
            return Ok(());
        }
        if !self.live.is_recording().await {
            return Err(DvrError::Precondition(
                "cannot go live while not recording".to_string(),
            ));
        }

        self.scrub.stop().await;
        self.engine.release_as_video_source().await?;
        self.live.attach_live().await?;
        self.live.play().await?;

        *self.mode.write().await = DvrMode::Live;
        log::info!("Switched to live");
        let _ = self.event_tx.send(DvrEvent::ModeChanged {
            mode: DvrMode::Live,
        });
        let _ = self.event_tx.send(DvrEvent::Played);
        Ok(())
    }

    /// Hand the presentable source to the playback engine, rendered at
    /// `time` (default: just behind the live edge). Re-seeks when already
    /// in playback. Leaves playback paused; motion is a separate request.
    pub async fn switch_to_playback(&self, time: Option<f64>) -> Result<(), DvrError> {
        if *self.mode.read().await == DvrMode::Playback {
            let target = match time {
                Some(t) => t,
                None => self.engine.absolute_position().await?,
            };
            self.live.try_fill_segments(target).await?;
            return self.engine.go_to_time(target).await;
        }

        let target = match time {
            Some(t) => t,
            None => self.default_playback_target().await?,
        };
        self.live.try_fill_segments(target).await?;

        if self.live.is_attached().await {
            self.live.pause().await?;
        }
        self.live.detach_live().await?;
        self.engine.set_as_video_source(target).await?;

        *self.mode.write().await = DvrMode::Playback;
        log::info!("Switched to playback at {:.3}s", target);
        let _ = self.event_tx.send(DvrEvent::ModeChanged {
            mode: DvrMode::Playback,
        });
        Ok(())
    }

    /// Resume forward motion. In playback at the very end of the recorded
    /// timeline while capture continues, the only data "after" the end is
    /// the live feed itself, so this goes back to live.
    pub async fn play(&self) -> Result<(), DvrError> {
        // Copy the mode out; matching on the guard itself would hold the
        // lock across the switch calls below.
        let mode = *self.mode.read().await;
        match mode {
            DvrMode::Live => {
                self.live.play().await?;
                let _ = self.event_tx.send(DvrEvent::Played);
                Ok(())
            }
            DvrMode::Playback => {
                if self.engine.is_at_end().await? && self.live.is_recording().await {
                    return self.switch_to_live_stream().await;
                }
                self.scrub.play().await?;
                let _ = self.event_tx.send(DvrEvent::Played);
                Ok(())
            }
        }
    }

    /// Halt motion. Pausing the live feed is a mode switch: the session
    /// drops into playback, paused at the instant the pause was requested.
    pub async fn pause(&self) -> Result<(), DvrError> {
        let mode = *self.mode.read().await;
        match mode {
            DvrMode::Live => {
                let at = self.live.live_end_time().await?;
                self.live.pause().await?;
                self.switch_to_playback(Some(at)).await?;
                let _ = self.event_tx.send(DvrEvent::Paused);
                Ok(())
            }
            DvrMode::Playback => {
                self.scrub.pause().await?;
                let _ = self.event_tx.send(DvrEvent::Paused);
                Ok(())
            }
        }
    }

    /// Rewind; entering from live drops into playback first.
    pub async fn rewind(&self) -> Result<(), DvrError> {
        self.ensure_playback().await?;
        self.scrub.rewind().await
    }

    /// Fast-forward; entering from live drops into playback first.
    pub async fn fast_forward(&self) -> Result<(), DvrError> {
        self.ensure_playback().await?;
        self.scrub.fast_forward().await
    }

    /// Slow-motion forward; entering from live drops into playback first.
    pub async fn slow_forward(&self) -> Result<(), DvrError> {
        self.ensure_playback().await?;
        self.scrub.slow_forward().await
    }

    /// Step one frame forward while paused. Frame stepping has no meaning
    /// on the live feed.
    pub async fn next_frame(&self) -> Result<(), DvrError> {
        if *self.mode.read().await == DvrMode::Live {
            return Err(DvrError::Precondition(
                "frame step while in live mode".to_string(),
            ));
        }
        self.scrub.next_frame().await
    }

    /// Tear the whole session down. Safe in any state and idempotent.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        self.scrub.stop().await;
        if let Err(e) = self.engine.release_as_video_source().await {
            log::warn!("Engine release during dispose failed: {}", e);
        }
        self.live.dispose().await;
        log::info!("DVR session disposed");
    }

    async fn ensure_playback(&self) -> Result<(), DvrError> {
        if *self.mode.read().await == DvrMode::Live {
            self.switch_to_playback(None).await?;
        }
        Ok(())
    }

    /// Default playback entry point: just behind the live edge while
    /// recording, otherwise just behind the end of the recorded timeline.
    async fn default_playback_target(&self) -> Result<f64, DvrError> {
        let end = if self.live.is_recording().await {
            self.live.live_end_time().await?
        } else {
            self.engine
                .timeline_end()
                .await
                .map_err(|_| DvrError::NoData("no recorded data available".to_string()))?
        };
        Ok((end - self.config.live_edge_margin_secs).max(0.0))
    }

    /// Playback running off the end of the recorded timeline while capture
    /// continues folds back into the live feed.
    fn spawn_end_watcher(&self) {
        let this = self.handle();
        let mut events = self.event_tx.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("End watcher lagged {} events", n);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if !matches!(event, DvrEvent::ReachedEnd) {
                    continue;
                }
                if *this.mode.read().await != DvrMode::Playback
                    || !this.live.is_recording().await
                {
                    continue;
                }
                log::info!("Playback reached the live edge; returning to live");
                if let Err(e) = this.switch_to_live_stream().await {
                    log::error!("Auto-return to live failed: {}", e);
                }
            }
        });
    }

    fn handle(&self) -> DvrOrchestrator {
        DvrOrchestrator {
            live: self.live.clone(),
            engine: self.engine.clone(),
            scrub: self.scrub.clone(),
            mode: self.mode.clone(),
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
            config: self.config.clone(),
        }
    }
}

impl Clone for DvrOrchestrator {
    fn clone(&self) -> Self {
        self.handle()
    }
}
