//! Deterministic simulated capabilities.
//!
//! `SimSource` and `SimReader` stand in for a real media element and a real
//! chunked capture device. Both are driven entirely by the tokio clock, so
//! under `#[tokio::test(start_paused = true)]` their behaviour is a pure
//! function of `tokio::time::advance`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::reader::ChunkSource;
use crate::source::{FaultKind, PresentableSource, SourceEvent, SourcePayload};
use crate::MediaError;

/// Position driver period for the simulated source.
const DRIVER_TICK_MS: u64 = 50;
/// Simulated readiness latency for a payload swap.
const SWAP_LATENCY_MS: u64 = 10;

struct SimSourceState {
    payload: SourcePayload,
    position: f64,
    duration: Option<f64>,
    playing: bool,
    /// Known true durations per locator id, keyed as a real media subsystem
    /// would resolve them from container metadata.
    media: HashMap<u64, f64>,
}

/// Simulated presentable source.
///
/// While playing, a driver task advances the native position in real time
/// (virtual time in tests). Clip payloads clamp at their registered duration
/// and emit `Ended`; the live payload grows without bound.
pub struct SimSource {
    state: Arc<RwLock<SimSourceState>>,
    // Serializes payload swaps; the trait contract allows only one in flight.
    swap_gate: Arc<Mutex<()>>,
    event_tx: broadcast::Sender<SourceEvent>,
    cancel: CancellationToken,
}

impl SimSource {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let source = Arc::new(Self {
            state: Arc::new(RwLock::new(SimSourceState {
                payload: SourcePayload::Empty,
                position: 0.0,
                duration: None,
                playing: false,
                media: HashMap::new(),
            })),
            swap_gate: Arc::new(Mutex::new(())),
            event_tx,
            cancel: CancellationToken::new(),
        });
        source.spawn_driver();
        source
    }

    /// Register the true duration the source will resolve for a locator id.
    pub async fn register_media(&self, id: u64, duration: f64) {
        self.state.write().await.media.insert(id, duration);
    }

    /// Inject a playback fault, as a decoder hitting bad data would.
    pub async fn inject_fault(&self, kind: FaultKind, message: &str) {
        let _ = self.event_tx.send(SourceEvent::Fault {
            kind,
            message: message.to_string(),
        });
    }

    /// Stop the driver task. Safe to call more than once.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_driver(self: &Arc<Self>) {
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let step = Duration::from_millis(DRIVER_TICK_MS);
            let mut ticker = tokio::time::interval(step);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let mut s = state.write().await;
                if !s.playing {
                    continue;
                }
                match s.payload {
                    SourcePayload::Empty => continue,
                    SourcePayload::Live => {
                        s.position += step.as_secs_f64();
                        let _ = event_tx.send(SourceEvent::PositionChanged(s.position));
                    }
                    SourcePayload::Clip(_) => {
                        s.position += step.as_secs_f64();
                        if let Some(d) = s.duration {
                            if s.position >= d {
                                s.position = d;
                                s.playing = false;
                                let _ = event_tx.send(SourceEvent::PositionChanged(s.position));
                                let _ = event_tx.send(SourceEvent::Ended);
                                continue;
                            }
                        }
                        let _ = event_tx.send(SourceEvent::PositionChanged(s.position));
                    }
                }
            }
        });
    }
}

#[async_trait]
impl PresentableSource for SimSource {
    async fn set_payload(&self, payload: SourcePayload) -> Result<(), MediaError> {
        let _gate = self.swap_gate.lock().await;
        // Simulated media-subsystem readiness wait.
        tokio::time::sleep(Duration::from_millis(SWAP_LATENCY_MS)).await;

        let mut s = self.state.write().await;
        s.position = 0.0;
        s.duration = match &payload {
            SourcePayload::Clip(loc) => s.media.get(&loc.id).copied(),
            _ => None,
        };
        s.payload = payload;
        if let Some(d) = s.duration {
            let _ = self.event_tx.send(SourceEvent::DurationResolved(d));
        }
        Ok(())
    }

    async fn payload(&self) -> SourcePayload {
        self.state.read().await.payload.clone()
    }

    async fn position(&self) -> f64 {
        self.state.read().await.position
    }

    async fn set_position(&self, secs: f64) {
        let mut s = self.state.write().await;
        let clamped = match s.duration {
            Some(d) => secs.clamp(0.0, d),
            None => secs.max(0.0),
        };
        s.position = clamped;
        let _ = self.event_tx.send(SourceEvent::PositionChanged(clamped));
    }

    async fn duration(&self) -> Option<f64> {
        self.state.read().await.duration
    }

    async fn play(&self) -> Result<(), MediaError> {
        let mut s = self.state.write().await;
        if s.payload.is_empty() {
            return Err(MediaError::NotAttached("play with no payload".to_string()));
        }
        s.playing = true;
        Ok(())
    }

    async fn pause(&self) -> Result<(), MediaError> {
        self.state.write().await.playing = false;
        Ok(())
    }

    async fn is_playing(&self) -> bool {
        self.state.read().await.playing
    }

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.event_tx.subscribe()
    }
}

struct SimReaderState {
    cancel: Option<CancellationToken>,
    last_emit: Option<tokio::time::Instant>,
}

/// Simulated chunked stream reader producing `byte_rate` bytes per second.
pub struct SimReader {
    byte_rate: u64,
    fail_on_start: bool,
    state: Arc<Mutex<SimReaderState>>,
    chunk_tx: mpsc::UnboundedSender<Bytes>,
    chunk_rx: Arc<Mutex<mpsc::UnboundedReceiver<Bytes>>>,
}

impl SimReader {
    pub fn new(byte_rate: u64) -> Arc<Self> {
        Self::with_failure(byte_rate, false)
    }

    /// A reader whose `start` always fails, for capture-fault tests.
    pub fn failing() -> Arc<Self> {
        Self::with_failure(0, true)
    }

    fn with_failure(byte_rate: u64, fail_on_start: bool) -> Arc<Self> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            byte_rate,
            fail_on_start,
            state: Arc::new(Mutex::new(SimReaderState {
                cancel: None,
                last_emit: None,
            })),
            chunk_tx,
            chunk_rx: Arc::new(Mutex::new(chunk_rx)),
        })
    }

    fn chunk_of(&self, elapsed: Duration) -> Bytes {
        let len = (elapsed.as_secs_f64() * self.byte_rate as f64) as usize;
        Bytes::from(vec![0u8; len])
    }
}

#[async_trait]
impl ChunkSource for SimReader {
    async fn start(&self, timeslice: Duration) -> Result<(), MediaError> {
        if self.fail_on_start {
            return Err(MediaError::CaptureError(
                "simulated capture device unavailable".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        if state.cancel.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());
        state.last_emit = Some(tokio::time::Instant::now());

        let tx = self.chunk_tx.clone();
        let shared = self.state.clone();
        let byte_rate = self.byte_rate;
        let started = tokio::time::Instant::now();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timeslice);
            ticker.tick().await; // first tick fires immediately
            // Deadline-based emission mark, so the trailing-chunk length
            // stays exact even when virtual time advances in large steps.
            let mut mark = started;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let len = (timeslice.as_secs_f64() * byte_rate as f64) as usize;
                if tx.send(Bytes::from(vec![0u8; len])).is_err() {
                    break;
                }
                mark += timeslice;
                shared.lock().await.last_emit = Some(mark);
            }
        });
        Ok(())
    }

    async fn stop(&self) -> Result<Option<Bytes>, MediaError> {
        let mut state = self.state.lock().await;
        let Some(cancel) = state.cancel.take() else {
            return Ok(None);
        };
        cancel.cancel();

        let trailing = state
            .last_emit
            .take()
            .map(|t| t.elapsed())
            .filter(|e| !e.is_zero())
            .map(|e| self.chunk_of(e))
            .filter(|b| !b.is_empty());
        Ok(trailing)
    }

    async fn recv(&self) -> Option<Bytes> {
        self.chunk_rx.lock().await.recv().await
    }
}
