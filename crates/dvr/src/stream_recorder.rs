use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use media_source::ChunkSource;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{Clock, DvrConfig, DvrError, DvrEvent};

/// One discrete recording flushed from the capture accumulator. Consumed
/// immediately to build or replace a segment; not retained afterwards.
#[derive(Debug, Clone)]
pub struct Recording {
    /// Timeline instant the accumulator cycle began (seconds).
    pub start_time: f64,
    /// Seconds of content covered, estimated from elapsed capture time.
    pub duration: f64,
    pub payload: Bytes,
    /// Flushed early via force-render rather than at a cycle boundary.
    pub is_partial: bool,
}

struct RecorderShared {
    recording: bool,
    cycle_start: Option<f64>,
    buf: BytesMut,
}

/// Turns a timesliced chunk capability into discrete recordings aligned to
/// a configured minimum duration, with on-demand early finalization.
pub struct StreamRecorder {
    reader: Arc<dyn ChunkSource>,
    shared: Arc<Mutex<RecorderShared>>,
    rec_tx: mpsc::UnboundedSender<Recording>,
    rec_rx: Mutex<Option<mpsc::UnboundedReceiver<Recording>>>,
    event_tx: broadcast::Sender<DvrEvent>,
    cancel: Mutex<Option<CancellationToken>>,
    clock: Clock,
    config: DvrConfig,
}

impl StreamRecorder {
    pub fn new(
        reader: Arc<dyn ChunkSource>,
        event_tx: broadcast::Sender<DvrEvent>,
        clock: Clock,
        config: DvrConfig,
    ) -> Self {
        let (rec_tx, rec_rx) = mpsc::unbounded_channel();
        Self {
            reader,
            shared: Arc::new(Mutex::new(RecorderShared {
                recording: false,
                cycle_start: None,
                buf: BytesMut::new(),
            })),
            rec_tx,
            rec_rx: Mutex::new(Some(rec_rx)),
            event_tx,
            cancel: Mutex::new(None),
            clock,
            config,
        }
    }

    /// Take the channel non-partial recordings are delivered on. Single
    /// consumer; the live stream recorder takes it once at wiring time.
    pub async fn take_recordings(&self) -> Option<mpsc::UnboundedReceiver<Recording>> {
        self.rec_rx.lock().await.take()
    }

    pub async fn is_recording(&self) -> bool {
        self.shared.lock().await.recording
    }

    /// Begin a capture cycle. No-op while already recording. A capture
    /// capability that fails to start is surfaced as a `RecordingError`
    /// event, not a synchronous error; the recorder stays usable.
    pub async fn start_recording(&self) -> Result<(), DvrError> {
        {
            let mut shared = self.shared.lock().await;
            if shared.recording {
                return Ok(());
            }
            shared.buf.clear();
            shared.cycle_start = Some(self.clock.now());
            shared.recording = true;
        }

        let timeslice = Duration::from_millis(self.config.timeslice_ms);
        if let Err(e) = self.reader.start(timeslice).await {
            log::error!("Capture failed to start: {}", e);
            let _ = self.event_tx.send(DvrEvent::RecordingError {
                error: e.to_string(),
            });
            let mut shared = self.shared.lock().await;
            shared.recording = false;
            shared.cycle_start = None;
            return Ok(());
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());
        self.spawn_capture_loop(cancel);
        log::info!("Recording started");
        Ok(())
    }

    /// Stop capture and flush whatever the accumulator holds as a final
    /// non-partial recording. No-op while not recording; a zero-length
    /// accumulator produces nothing.
    pub async fn stop_recording(&self) -> Result<(), DvrError> {
        let cancel = self.cancel.lock().await.take();
        let Some(cancel) = cancel else {
            return Ok(());
        };
        cancel.cancel();

        let trailing = self
            .reader
            .stop()
            .await
            .map_err(|e| DvrError::Capture(e.to_string()))?;

        let mut shared = self.shared.lock().await;
        if !shared.recording {
            return Ok(());
        }
        if let Some(tail) = trailing {
            shared.buf.extend_from_slice(&tail);
        }
        if let Some(recording) = Self::drain(&mut shared, self.clock.now()) {
            let _ = self.rec_tx.send(recording);
        }
        shared.recording = false;
        shared.cycle_start = None;
        log::info!("Recording stopped");
        Ok(())
    }

    /// Flush the accumulator early as a partial recording, without
    /// resetting the boundary timer or clearing the accumulator, so later
    /// flushes still cover every byte since the last non-partial boundary.
    /// Returns `None` when nothing has been captured yet this cycle.
    pub async fn force_render(&self) -> Result<Option<Recording>, DvrError> {
        let shared = self.shared.lock().await;
        if !shared.recording {
            return Err(DvrError::Precondition(
                "force_render while not recording".to_string(),
            ));
        }
        if shared.buf.is_empty() {
            return Ok(None);
        }
        let start_time = shared.cycle_start.ok_or_else(|| {
            DvrError::Internal("recording cycle has no start time".to_string())
        })?;
        let now = self.clock.now();
        Ok(Some(Recording {
            start_time,
            duration: now - start_time,
            payload: Bytes::copy_from_slice(&shared.buf),
            is_partial: true,
        }))
    }

    fn drain(shared: &mut RecorderShared, now: f64) -> Option<Recording> {
        if shared.buf.is_empty() {
            return None;
        }
        let start_time = shared.cycle_start?;
        let payload = shared.buf.split().freeze();
        Some(Recording {
            start_time,
            duration: now - start_time,
            payload,
            is_partial: false,
        })
    }

    fn spawn_capture_loop(&self, cancel: CancellationToken) {
        let reader = self.reader.clone();
        let shared = self.shared.clone();
        let rec_tx = self.rec_tx.clone();
        let event_tx = self.event_tx.clone();
        let clock = self.clock.clone();
        let min_chunk = Duration::from_secs_f64(self.config.min_chunk_secs);
        let timeslice = Duration::from_millis(self.config.timeslice_ms);

        tokio::spawn(async move {
            let mut boundary = tokio::time::Instant::now() + min_chunk;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    chunk = reader.recv() => {
                        match chunk {
                            Some(bytes) => {
                                shared.lock().await.buf.extend_from_slice(&bytes);
                            }
                            None => {
                                log::info!("Capture stream ended");
                                break;
                            }
                        }
                    }

                    _ = tokio::time::sleep_until(boundary) => {
                        // Boundary: stop, flush non-partial, restart. The
                        // stop/flush/restart is atomic from the caller's
                        // perspective; capture must never have a gap.
                        let mut s = shared.lock().await;
                        match reader.stop().await {
                            Ok(Some(tail)) => s.buf.extend_from_slice(&tail),
                            Ok(None) => {}
                            Err(e) => log::warn!("Capture stop at boundary failed: {}", e),
                        }
                        let now = clock.now();
                        if let Some(recording) = Self::drain(&mut s, now) {
                            log::debug!(
                                "Boundary flush: {:.3}s / {} bytes",
                                recording.duration,
                                recording.payload.len()
                            );
                            let _ = rec_tx.send(recording);
                        }
                        s.cycle_start = Some(now);
                        // A stop may have landed while the flush was
                        // suspended in reader.stop(); restarting now would
                        // leave the capability running with no consumer.
                        if cancel.is_cancelled() {
                            break;
                        }
                        if let Err(e) = reader.start(timeslice).await {
                            log::error!("Capture failed to restart: {}", e);
                            let _ = event_tx.send(DvrEvent::RecordingError {
                                error: e.to_string(),
                            });
                            s.recording = false;
                            s.cycle_start = None;
                            break;
                        }
                        boundary = tokio::time::Instant::now() + min_chunk;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_source::SimReader;

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    /// Advance virtual time in small steps so timers fire close to their
    /// due instants, as they would in real time.
    async fn run_for(d: Duration) {
        let step = Duration::from_millis(50);
        let mut left = d;
        while left > Duration::ZERO {
            let s = step.min(left);
            tokio::time::advance(s).await;
            tokio::task::yield_now().await;
            left -= s;
        }
        settle().await;
    }

    fn recorder(reader: Arc<dyn ChunkSource>) -> (StreamRecorder, broadcast::Receiver<DvrEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let config = DvrConfig {
            min_chunk_secs: 5.0,
            timeslice_ms: 200,
            ..DvrConfig::default()
        };
        (StreamRecorder::new(reader, tx, Clock::new(), config), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn force_render_before_boundary_then_one_boundary_flush() {
        let (rec, _events) = recorder(SimReader::new(1000));
        let mut recordings = rec.take_recordings().await.unwrap();
        rec.start_recording().await.unwrap();

        run_for(Duration::from_millis(500)).await;

        // No non-partial recording before the 5s boundary
        assert!(recordings.try_recv().is_err());

        // But a force render yields a partial one covering the 500ms so far
        let partial = rec.force_render().await.unwrap().unwrap();
        assert!(partial.is_partial);
        assert!((partial.duration - 0.5).abs() < 0.1);
        assert!(!partial.payload.is_empty());

        // Advance to 6s total: exactly one non-partial recording emitted
        run_for(Duration::from_millis(5500)).await;

        let first = recordings.try_recv().unwrap();
        assert!(!first.is_partial);
        assert!((first.duration - 5.0).abs() < 0.3);
        assert!(recordings.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn force_render_with_empty_accumulator_is_none() {
        let (rec, _events) = recorder(SimReader::new(1000));
        rec.start_recording().await.unwrap();
        settle().await;

        // No timeslice has elapsed yet, so no bytes accumulated
        assert!(rec.force_render().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn force_render_keeps_accumulating_from_cycle_start() {
        let (rec, _events) = recorder(SimReader::new(1000));
        rec.start_recording().await.unwrap();

        run_for(Duration::from_millis(600)).await;
        let a = rec.force_render().await.unwrap().unwrap();

        run_for(Duration::from_millis(600)).await;
        let b = rec.force_render().await.unwrap().unwrap();

        // Same cycle start, growing coverage
        assert!((a.start_time - b.start_time).abs() < 1e-9);
        assert!(b.duration > a.duration);
        assert!(b.payload.len() > a.payload.len());
    }

    #[tokio::test(start_paused = true)]
    async fn force_render_while_idle_is_a_precondition_violation() {
        let (rec, _events) = recorder(SimReader::new(1000));
        assert!(matches!(
            rec.force_render().await,
            Err(DvrError::Precondition(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_a_final_recording() {
        let (rec, _events) = recorder(SimReader::new(1000));
        let mut recordings = rec.take_recordings().await.unwrap();
        rec.start_recording().await.unwrap();

        run_for(Duration::from_millis(2000)).await;
        rec.stop_recording().await.unwrap();

        let last = recordings.try_recv().unwrap();
        assert!(!last.is_partial);
        assert!((last.duration - 2.0).abs() < 0.3);
        assert!(!rec.is_recording().await);

        // Idempotent
        rec.stop_recording().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let (rec, _events) = recorder(SimReader::new(1000));
        rec.start_recording().await.unwrap();
        rec.start_recording().await.unwrap();
        assert!(rec.is_recording().await);
        rec.stop_recording().await.unwrap();
    }

    /// Reader whose `stop` takes a while to resolve, never yields chunks,
    /// and counts starts.
    struct SlowStopReader {
        running: Mutex<bool>,
        starts: std::sync::atomic::AtomicUsize,
    }

    impl SlowStopReader {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                running: Mutex::new(false),
                starts: std::sync::atomic::AtomicUsize::new(0),
            })
        }

        fn start_count(&self) -> usize {
            self.starts.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn is_running(&self) -> bool {
            *self.running.lock().await
        }
    }

    #[async_trait::async_trait]
    impl ChunkSource for SlowStopReader {
        async fn start(&self, _timeslice: Duration) -> Result<(), media_source::MediaError> {
            *self.running.lock().await = true;
            self.starts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<Option<Bytes>, media_source::MediaError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            *self.running.lock().await = false;
            Ok(None)
        }

        async fn recv(&self) -> Option<Bytes> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_a_boundary_flush_does_not_restart_capture() {
        let reader = SlowStopReader::new();
        let (rec, _events) = recorder(reader.clone());
        let rec = Arc::new(rec);
        rec.start_recording().await.unwrap();

        // Reach the boundary so its flush parks inside the slow stop
        run_for(Duration::from_secs(5)).await;

        let stopper = rec.clone();
        let handle = tokio::spawn(async move { stopper.stop_recording().await });
        run_for(Duration::from_millis(200)).await;
        handle.await.unwrap().unwrap();

        assert_eq!(reader.start_count(), 1);
        assert!(!reader.is_running().await);
        assert!(!rec.is_recording().await);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_start_failure_is_an_event_not_an_error() {
        let (rec, mut events) = recorder(SimReader::failing());
        rec.start_recording().await.unwrap();
        settle().await;

        assert!(!rec.is_recording().await);
        let ev = events.try_recv().unwrap();
        assert!(matches!(ev, DvrEvent::RecordingError { .. }));
    }
}
