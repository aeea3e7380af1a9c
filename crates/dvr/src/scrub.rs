use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::playback::PlaybackEngine;
use crate::{DvrConfig, DvrError, DvrEvent};

/// Transport mode of the scrub controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrubMode {
    /// Native playback (or paused); the ticker is idle.
    Normal,
    Rewind,
    SlowForward,
    FastForward,
}

struct ScrubShared {
    mode: ScrubMode,
    /// Signed speed multiplier; negative while rewinding.
    multiplier: f64,
}

/// Drives variable-speed and reverse motion over the playback engine.
///
/// Native sources only play forward at 1x, so every other speed is
/// synthesized here: a ticker repeatedly seeks the engine by one frame
/// interval scaled by the current multiplier. Repeated presses of the same
/// transport control compound the multiplier geometrically.
pub struct ScrubController {
    engine: PlaybackEngine,
    shared: Arc<RwLock<ScrubShared>>,
    tick_cancel: Arc<Mutex<Option<CancellationToken>>>,
    event_tx: broadcast::Sender<DvrEvent>,
    config: DvrConfig,
}

impl ScrubController {
    pub fn new(
        engine: PlaybackEngine,
        event_tx: broadcast::Sender<DvrEvent>,
        config: DvrConfig,
    ) -> Self {
        Self {
            engine,
            shared: Arc::new(RwLock::new(ScrubShared {
                mode: ScrubMode::Normal,
                multiplier: 1.0,
            })),
            tick_cancel: Arc::new(Mutex::new(None)),
            event_tx,
            config,
        }
    }

    pub async fn mode(&self) -> ScrubMode {
        self.shared.read().await.mode
    }

    /// Current signed speed multiplier.
    pub async fn speed(&self) -> f64 {
        self.shared.read().await.multiplier
    }

    /// Start rewinding, or double the rewind speed if already rewinding.
    pub async fn rewind(&self) -> Result<(), DvrError> {
        let magnitude = self
            .compound(ScrubMode::Rewind, self.config.rewind_start_speed, 2.0)
            .await?;
        self.set_multiplier(-magnitude).await;
        Ok(())
    }

    /// Start fast-forwarding, or double the speed if already doing so.
    pub async fn fast_forward(&self) -> Result<(), DvrError> {
        let magnitude = self
            .compound(
                ScrubMode::FastForward,
                self.config.fast_forward_start_speed,
                2.0,
            )
            .await?;
        self.set_multiplier(magnitude).await;
        Ok(())
    }

    /// Start slow-motion forward, or halve the speed if already doing so.
    pub async fn slow_forward(&self) -> Result<(), DvrError> {
        let magnitude = self
            .compound(
                ScrubMode::SlowForward,
                self.config.slow_forward_start_speed,
                0.5,
            )
            .await?;
        self.set_multiplier(magnitude).await;
        Ok(())
    }

    /// Resume native 1x playback, leaving any scrub mode.
    pub async fn play(&self) -> Result<(), DvrError> {
        self.stop_ticker().await;
        {
            let mut shared = self.shared.write().await;
            shared.mode = ScrubMode::Normal;
            shared.multiplier = 1.0;
        }
        self.engine.set_speed_hint(1.0).await;
        self.engine.play().await
    }

    /// Halt all motion, leaving any scrub mode.
    pub async fn pause(&self) -> Result<(), DvrError> {
        self.stop_ticker().await;
        {
            let mut shared = self.shared.write().await;
            shared.mode = ScrubMode::Normal;
            shared.multiplier = 0.0;
        }
        self.engine.set_speed_hint(0.0).await;
        self.engine.pause().await
    }

    /// Step forward by exactly one frame interval and stay paused.
    pub async fn next_frame(&self) -> Result<(), DvrError> {
        self.pause().await?;
        let position = self.engine.absolute_position().await?;
        let end = self.timeline_end().await?;
        let target = (position + self.config.frame_interval_secs).min(end);
        self.engine.go_to_time(target).await
    }

    /// Cancel the ticker and drop back to normal mode. Idempotent; never
    /// touches the engine, so it is safe while detaching.
    pub async fn stop(&self) {
        self.stop_ticker().await;
        let mut shared = self.shared.write().await;
        shared.mode = ScrubMode::Normal;
        shared.multiplier = 1.0;
    }

    /// Enter `mode` (pausing native playback and starting the ticker), or
    /// compound the existing magnitude by `factor` when already in it.
    /// Returns the new unsigned magnitude.
    async fn compound(
        &self,
        mode: ScrubMode,
        start: f64,
        factor: f64,
    ) -> Result<f64, DvrError> {
        let entering = self.shared.read().await.mode != mode;
        if entering {
            self.stop_ticker().await;
            self.engine.pause().await?;
            self.shared.write().await.mode = mode;
            self.spawn_ticker().await;
            log::info!("Scrub mode {:?} at {}x", mode, start);
            return Ok(start);
        }

        let magnitude = (self.shared.read().await.multiplier.abs() * factor)
            .clamp(self.config.min_scrub_speed, self.config.max_scrub_speed);
        log::info!("Scrub mode {:?} now {}x", mode, magnitude);
        Ok(magnitude)
    }

    async fn set_multiplier(&self, multiplier: f64) {
        self.shared.write().await.multiplier = multiplier;
        self.engine.set_speed_hint(multiplier).await;
    }

    async fn stop_ticker(&self) {
        if let Some(cancel) = self.tick_cancel.lock().await.take() {
            cancel.cancel();
        }
    }

    async fn spawn_ticker(&self) {
        let cancel = CancellationToken::new();
        *self.tick_cancel.lock().await = Some(cancel.clone());

        let this = self.handle();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(this.config.scrub_tick_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match this.tick().await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        log::error!("Scrub tick failed: {}", e);
                        break;
                    }
                }
            }
        });
    }

    /// One synthesized motion step. Returns false when the ticker should
    /// stop (an edge was hit or motion stalled).
    async fn tick(&self) -> Result<bool, DvrError> {
        // A render is still in flight; skip rather than queue stale motion.
        if self.engine.is_rendering().await {
            return Ok(true);
        }

        let multiplier = self.shared.read().await.multiplier;
        if multiplier == 0.0 {
            log::warn!("Scrub ticker running with zero speed; halting");
            self.engine.pause().await?;
            self.leave_scrub().await;
            let _ = self.event_tx.send(DvrEvent::Paused);
            return Ok(false);
        }

        let position = self.engine.absolute_position().await?;
        let start = self.timeline_start().await?;
        let end = self.timeline_end().await?;
        let next = position + multiplier * self.config.frame_interval_secs;

        if next <= start {
            self.engine.go_to_time(start).await?;
            self.leave_scrub().await;
            let _ = self.event_tx.send(DvrEvent::ReachedStart);
            return Ok(false);
        }
        if next >= end {
            self.engine.go_to_time(end).await?;
            self.leave_scrub().await;
            let _ = self.event_tx.send(DvrEvent::ReachedEnd);
            return Ok(false);
        }

        self.engine.go_to_time(next).await?;
        Ok(true)
    }

    async fn leave_scrub(&self) {
        let mut shared = self.shared.write().await;
        shared.mode = ScrubMode::Normal;
        shared.multiplier = 0.0;
        self.engine.set_speed_hint(0.0).await;
    }

    async fn timeline_start(&self) -> Result<f64, DvrError> {
        self.engine.timeline_start().await
    }

    async fn timeline_end(&self) -> Result<f64, DvrError> {
        self.engine.timeline_end().await
    }

    fn handle(&self) -> ScrubController {
        ScrubController {
            engine: self.engine.clone(),
            shared: self.shared.clone(),
            tick_cancel: self.tick_cancel.clone(),
            event_tx: self.event_tx.clone(),
            config: self.config.clone(),
        }
    }
}

impl Clone for ScrubController {
    fn clone(&self) -> Self {
        self.handle()
    }
}
