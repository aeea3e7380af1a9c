use std::sync::Arc;

use media_source::{FaultKind, PresentableSource, SourceEvent, SourcePayload};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::segment_store::{SegmentHit, SegmentStore};
use crate::{DvrConfig, DvrError, DvrEvent};

const BOUNDARY_TOLERANCE: f64 = 1e-6;

struct EngineShared {
    current: Option<usize>,
    attached: bool,
    rendering: bool,
    auto_advance: bool,
    speed_hint: f64,
}

/// Renders the segment covering an arbitrary timeline instant as the
/// active presentable payload, advances across segment boundaries during
/// normal play, and recovers from decode faults.
pub struct PlaybackEngine {
    store: Arc<RwLock<SegmentStore>>,
    source: Arc<dyn PresentableSource>,
    shared: Arc<RwLock<EngineShared>>,
    // Serializes payload swaps and renders; only one may be in flight.
    render_gate: Arc<Mutex<()>>,
    event_tx: broadcast::Sender<DvrEvent>,
    watch_cancel: Arc<Mutex<Option<CancellationToken>>>,
    config: DvrConfig,
}

impl PlaybackEngine {
    pub fn new(
        store: Arc<RwLock<SegmentStore>>,
        source: Arc<dyn PresentableSource>,
        event_tx: broadcast::Sender<DvrEvent>,
        config: DvrConfig,
    ) -> Self {
        Self {
            store,
            source,
            shared: Arc::new(RwLock::new(EngineShared {
                current: None,
                attached: false,
                rendering: false,
                auto_advance: false,
                speed_hint: 1.0,
            })),
            render_gate: Arc::new(Mutex::new(())),
            event_tx,
            watch_cancel: Arc::new(Mutex::new(None)),
            config,
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.shared.read().await.attached
    }

    /// A render (payload swap) is in flight. A ticking scrub controller
    /// checks this and drops the tick rather than queueing stale motion.
    pub async fn is_rendering(&self) -> bool {
        self.shared.read().await.rendering
    }

    /// Speed included in position updates, maintained by the scrub
    /// controller.
    pub async fn set_speed_hint(&self, speed: f64) {
        self.shared.write().await.speed_hint = speed;
    }

    /// Attach this engine's output to the shared presentable source,
    /// render the segment covering `time`, and wire source notifications.
    pub async fn set_as_video_source(&self, time: f64) -> Result<(), DvrError> {
        if !self.shared.read().await.attached {
            self.shared.write().await.attached = true;
            let cancel = CancellationToken::new();
            *self.watch_cancel.lock().await = Some(cancel.clone());
            self.spawn_watcher(cancel);
            log::info!("Playback engine attached at {:.3}s", time);
        }
        self.go_to_time(time).await
    }

    /// Detach and leave the presentable source cleared, even if a render
    /// was in flight when this was called.
    pub async fn release_as_video_source(&self) -> Result<(), DvrError> {
        if let Some(cancel) = self.watch_cancel.lock().await.take() {
            cancel.cancel();
        }
        // Waits out any in-flight render before clearing.
        let _gate = self.render_gate.lock().await;
        {
            let mut shared = self.shared.write().await;
            shared.attached = false;
            shared.current = None;
            shared.rendering = false;
            shared.auto_advance = false;
        }
        self.source.pause().await?;
        self.source.set_payload(SourcePayload::Empty).await?;
        log::info!("Playback engine released");
        Ok(())
    }

    /// Render the segment covering `time` at the right native offset.
    pub async fn go_to_time(&self, time: f64) -> Result<(), DvrError> {
        if !self.shared.read().await.attached {
            return Err(DvrError::Precondition(
                "seek while not the video source".to_string(),
            ));
        }
        let hit = self.store.read().await.segment_at_time(time)?;
        self.render(hit).await
    }

    /// Resume playing and re-arm the natural-end auto-advance hook.
    pub async fn play(&self) -> Result<(), DvrError> {
        if !self.shared.read().await.attached {
            return Err(DvrError::Precondition(
                "play while not the video source".to_string(),
            ));
        }
        self.shared.write().await.auto_advance = true;
        self.source.play().await?;
        Ok(())
    }

    /// Pause; also disables auto-advance so controller-driven motion never
    /// races the natural-end hook.
    pub async fn pause(&self) -> Result<(), DvrError> {
        if !self.shared.read().await.attached {
            return Err(DvrError::Precondition(
                "pause while not the video source".to_string(),
            ));
        }
        self.shared.write().await.auto_advance = false;
        self.source.pause().await?;
        Ok(())
    }

    /// Absolute timeline position: current segment start + native offset.
    pub async fn absolute_position(&self) -> Result<f64, DvrError> {
        let current = {
            let shared = self.shared.read().await;
            if !shared.attached {
                return Err(DvrError::Precondition(
                    "position while not the video source".to_string(),
                ));
            }
            shared.current.ok_or_else(|| {
                DvrError::Precondition("position before anything rendered".to_string())
            })?
        };
        let segment = self
            .store
            .read()
            .await
            .get(current)
            .ok_or_else(|| DvrError::Internal(format!("current segment {} missing", current)))?;
        Ok(segment.start_time + self.source.position().await)
    }

    /// First covered timeline instant.
    pub async fn timeline_start(&self) -> Result<f64, DvrError> {
        self.store.read().await.first_start_time()
    }

    /// End of the last covered segment.
    pub async fn timeline_end(&self) -> Result<f64, DvrError> {
        self.store.read().await.last_end_time()
    }

    pub async fn is_at_beginning(&self) -> Result<bool, DvrError> {
        let first = self.timeline_start().await?;
        let position = self.absolute_position().await?;
        Ok(position <= first + BOUNDARY_TOLERANCE)
    }

    pub async fn is_at_end(&self) -> Result<bool, DvrError> {
        let last = self.timeline_end().await?;
        let position = self.absolute_position().await?;
        Ok(position >= last - BOUNDARY_TOLERANCE)
    }

    async fn render(&self, hit: SegmentHit) -> Result<(), DvrError> {
        let _gate = self.render_gate.lock().await;
        self.shared.write().await.rendering = true;
        let result = self.render_inner(hit).await;
        self.shared.write().await.rendering = false;
        result
    }

    async fn render_inner(&self, hit: SegmentHit) -> Result<(), DvrError> {
        let segment = self
            .store
            .read()
            .await
            .get(hit.index)
            .ok_or_else(|| DvrError::Internal(format!("no segment at index {}", hit.index)))?;

        let changed = self.shared.read().await.current != Some(hit.index);
        if changed {
            self.source
                .set_payload(SourcePayload::Clip(segment.locator.clone()))
                .await?;
            self.shared.write().await.current = Some(hit.index);
            let _ = self
                .event_tx
                .send(DvrEvent::SegmentRendered { index: hit.index });
            log::debug!("Rendered segment {} at offset {:.3}s", hit.index, hit.offset);
        }

        // Segments are created with estimated durations; once the source
        // has the payload loaded its reported duration is authoritative.
        if let Some(true_duration) = self.source.duration().await {
            self.store
                .write()
                .await
                .reset_segment_duration(hit.index, true_duration)?;
        }

        self.source.set_position(hit.offset).await;
        Ok(())
    }

    fn spawn_watcher(&self, cancel: CancellationToken) {
        let this = self.handle();
        let mut events = self.source.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Playback watcher lagged {} events", n);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if let Err(e) = this.handle_source_event(event).await {
                    log::error!("Playback event handling failed: {}", e);
                }
            }
        });
    }

    async fn handle_source_event(&self, event: SourceEvent) -> Result<(), DvrError> {
        match event {
            SourceEvent::PositionChanged(offset) => {
                let (current, speed) = {
                    let shared = self.shared.read().await;
                    if !shared.attached {
                        return Ok(());
                    }
                    (shared.current, shared.speed_hint)
                };
                if let Some(index) = current {
                    if let Some(segment) = self.store.read().await.get(index) {
                        let _ = self.event_tx.send(DvrEvent::PositionUpdate {
                            position: segment.start_time + offset,
                            speed,
                        });
                    }
                }
                Ok(())
            }

            SourceEvent::DurationResolved(duration) => {
                let current = self.shared.read().await.current;
                if let Some(index) = current {
                    self.store
                        .write()
                        .await
                        .reset_segment_duration(index, duration)?;
                }
                Ok(())
            }

            SourceEvent::Ended => self.handle_natural_end().await,

            SourceEvent::Fault { kind, message } => self.handle_fault(kind, message).await,
        }
    }

    /// The payload played to its natural end: advance to the next segment
    /// and keep playing, or pause and signal the timeline end.
    async fn handle_natural_end(&self) -> Result<(), DvrError> {
        let (attached, auto_advance, current) = {
            let shared = self.shared.read().await;
            (shared.attached, shared.auto_advance, shared.current)
        };
        if !attached || !auto_advance {
            return Ok(());
        }
        let Some(index) = current else {
            return Ok(());
        };

        let next = self.store.read().await.next_segment(index);
        match next {
            Some(next) => {
                log::debug!("Auto-advancing to segment {}", next.index);
                self.render(SegmentHit {
                    index: next.index,
                    offset: 0.0,
                })
                .await?;
                self.source.play().await?;
            }
            None => {
                self.shared.write().await.auto_advance = false;
                self.source.pause().await?;
                let _ = self.event_tx.send(DvrEvent::ReachedEnd);
            }
        }
        Ok(())
    }

    /// Decode-class faults are auto-recovered by skipping a configured
    /// margin past the fault and resuming; anything else is surfaced
    /// unhandled with playback left at the faulting segment.
    async fn handle_fault(&self, kind: FaultKind, message: String) -> Result<(), DvrError> {
        let current = self.shared.read().await.current;
        if kind != FaultKind::Decode {
            log::error!("Unhandled playback fault: {}", message);
            let _ = self.event_tx.send(DvrEvent::PlaybackError {
                index: current,
                error: message,
                handled: false,
            });
            return Ok(());
        }

        let Some(index) = current else {
            return Ok(());
        };
        let fault_position = self.absolute_position().await.unwrap_or(0.0);
        let target = {
            let store = self.store.read().await;
            (fault_position + self.config.decode_skip_secs).min(store.last_end_time()?)
        };
        self.store.write().await.mark_decode_error(index);

        log::warn!(
            "Decode fault in segment {} at {:.3}s; skipping to {:.3}s: {}",
            index,
            fault_position,
            target,
            message
        );

        // Drop the current payload so the skip re-attaches it cleanly.
        self.shared.write().await.current = None;
        self.go_to_time(target).await?;
        self.source.play().await?;

        let _ = self.event_tx.send(DvrEvent::PlaybackError {
            index: Some(index),
            error: message,
            handled: true,
        });
        Ok(())
    }

    fn handle(&self) -> PlaybackEngine {
        PlaybackEngine {
            store: self.store.clone(),
            source: self.source.clone(),
            shared: self.shared.clone(),
            render_gate: self.render_gate.clone(),
            event_tx: self.event_tx.clone(),
            watch_cancel: self.watch_cancel.clone(),
            config: self.config.clone(),
        }
    }
}

impl Clone for PlaybackEngine {
    fn clone(&self) -> Self {
        self.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_recorder::Recording;
    use bytes::Bytes;
    use media_source::{SegmentLocator, SimSource};
    use std::time::Duration;

    struct Fixture {
        engine: PlaybackEngine,
        store: Arc<RwLock<SegmentStore>>,
        source: Arc<SimSource>,
        events: broadcast::Receiver<DvrEvent>,
    }

    fn locator(id: u64) -> SegmentLocator {
        SegmentLocator {
            id,
            uri: format!("mem://{}", id),
        }
    }

    /// Two five-second segments with matching registered media durations.
    async fn fixture() -> Fixture {
        let (event_tx, events) = broadcast::channel(1024);
        let config = DvrConfig::default();
        let mut store = SegmentStore::new(config.boundary_epsilon_secs, event_tx.clone());
        for (i, start) in [0.0, 5.0].iter().enumerate() {
            store.add_segment(
                &Recording {
                    start_time: *start,
                    duration: 5.0,
                    payload: Bytes::from_static(b"x"),
                    is_partial: false,
                },
                locator(i as u64 + 1),
            );
        }
        let store = Arc::new(RwLock::new(store));

        let source = SimSource::new();
        source.register_media(1, 5.0).await;
        source.register_media(2, 5.0).await;

        let engine = PlaybackEngine::new(store.clone(), source.clone(), event_tx, config);
        Fixture {
            engine,
            store,
            source,
            events,
        }
    }

    async fn run_for(d: Duration) {
        let step = Duration::from_millis(25);
        let mut left = d;
        while left > Duration::ZERO {
            let s = step.min(left);
            tokio::time::advance(s).await;
            tokio::task::yield_now().await;
            left -= s;
        }
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(events: &mut broadcast::Receiver<DvrEvent>) -> Vec<DvrEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn attach_renders_the_covering_segment_at_its_offset() {
        let mut f = fixture().await;
        f.engine.set_as_video_source(7.0).await.unwrap();

        assert_eq!(
            f.source.payload().await,
            SourcePayload::Clip(locator(2))
        );
        let seg = f.store.read().await.get(1).unwrap();
        let offset = f.source.position().await;
        assert!((seg.start_time + offset - 7.0).abs() < 1e-6);

        let events = drain(&mut f.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, DvrEvent::SegmentRendered { index: 1 })));
        f.source.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn render_resyncs_estimated_duration_from_the_source() {
        let mut f = fixture().await;
        // The source knows the first segment is really 6 seconds long
        f.source.register_media(1, 6.0).await;

        f.engine.set_as_video_source(0.5).await.unwrap();

        let store = f.store.read().await;
        assert!((store.get(0).unwrap().duration - 6.0).abs() < 1e-9);
        // Later starts were re-chained
        assert!(store.get(1).unwrap().start_time > 6.0);

        let events = drain(&mut f.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, DvrEvent::SegmentDurationCorrected { index: 0, .. })));
        f.source.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn auto_advance_crosses_the_boundary_then_ends() {
        let mut f = fixture().await;
        f.engine.set_as_video_source(4.5).await.unwrap();
        f.engine.play().await.unwrap();

        // Play through the end of segment 0 into segment 1
        run_for(Duration::from_secs(2)).await;
        assert_eq!(
            f.source.payload().await,
            SourcePayload::Clip(locator(2))
        );
        assert!(f.source.is_playing().await);

        // Play segment 1 out: engine pauses and signals the timeline end
        run_for(Duration::from_secs(6)).await;
        assert!(!f.source.is_playing().await);
        assert!(f.engine.is_at_end().await.unwrap());

        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(e, DvrEvent::ReachedEnd)));
        f.source.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn decode_fault_skips_ahead_and_resumes() {
        let mut f = fixture().await;
        f.engine.set_as_video_source(1.0).await.unwrap();
        f.engine.play().await.unwrap();
        run_for(Duration::from_millis(100)).await;

        f.source.inject_fault(FaultKind::Decode, "bad bitstream").await;
        run_for(Duration::from_millis(200)).await;

        // Skipped roughly decode_skip_secs past the fault and kept playing
        let pos = f.engine.absolute_position().await.unwrap();
        assert!(pos > 3.5, "position {} did not skip ahead", pos);
        assert!(f.source.is_playing().await);
        assert!(f.store.read().await.get(0).unwrap().had_decode_error);

        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(
            e,
            DvrEvent::PlaybackError { handled: true, .. }
        )));
        f.source.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_faults_are_surfaced_unhandled() {
        let mut f = fixture().await;
        f.engine.set_as_video_source(1.0).await.unwrap();
        f.engine.play().await.unwrap();
        run_for(Duration::from_millis(100)).await;
        let before = f.engine.absolute_position().await.unwrap();

        f.source.inject_fault(FaultKind::Other, "network dropped").await;
        run_for(Duration::from_millis(100)).await;

        let events = drain(&mut f.events);
        assert!(events.iter().any(|e| matches!(
            e,
            DvrEvent::PlaybackError { handled: false, .. }
        )));
        // No skip was applied
        let after = f.engine.absolute_position().await.unwrap();
        assert!(after - before < 1.0);
        f.source.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn release_always_clears_the_source() {
        let f = fixture().await;
        f.engine.set_as_video_source(2.0).await.unwrap();
        f.engine.release_as_video_source().await.unwrap();

        assert_eq!(f.source.payload().await, SourcePayload::Empty);
        assert!(matches!(
            f.engine.absolute_position().await,
            Err(DvrError::Precondition(_))
        ));
        assert!(matches!(
            f.engine.is_at_end().await,
            Err(DvrError::Precondition(_))
        ));

        // Idempotent
        f.engine.release_as_video_source().await.unwrap();
        f.source.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn boundary_queries_reflect_the_timeline_edges() {
        let f = fixture().await;
        f.engine.set_as_video_source(0.0).await.unwrap();
        assert!(f.engine.is_at_beginning().await.unwrap());
        assert!(!f.engine.is_at_end().await.unwrap());

        let end = f.store.read().await.last_end_time().unwrap();
        f.engine.go_to_time(end).await.unwrap();
        assert!(f.engine.is_at_end().await.unwrap());
        f.source.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn seeking_while_detached_is_a_precondition_violation() {
        let f = fixture().await;
        assert!(matches!(
            f.engine.go_to_time(1.0).await,
            Err(DvrError::Precondition(_))
        ));
        f.source.shutdown();
    }
}
