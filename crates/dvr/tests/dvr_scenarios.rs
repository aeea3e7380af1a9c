//! End-to-end DVR session scenarios over simulated capabilities.

use std::sync::Arc;
use std::time::Duration;

use dvr::{DvrConfig, DvrError, DvrEvent, DvrMode, DvrOrchestrator};
use media_source::{MemorySink, PresentableSource, SimReader, SimSource, SourcePayload};
use tokio::sync::broadcast;

struct Session {
    dvr: DvrOrchestrator,
    source: Arc<SimSource>,
    events: broadcast::Receiver<DvrEvent>,
}

fn session() -> Session {
    let source = SimSource::new();
    let dvr = DvrOrchestrator::new(
        SimReader::new(1000),
        Arc::new(MemorySink::new()),
        source.clone(),
        DvrConfig::default(),
    );
    let events = dvr.subscribe();
    Session {
        dvr,
        source,
        events,
    }
}

/// Advance virtual time in small steps so interval-driven tasks fire close
/// to their due instants.
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
async fn pausing_live_rewinding_and_fast_forwarding_folds_back_to_live() {
    let mut s = session();
    s.dvr.start_recording().await.unwrap();
    run_for(Duration::from_secs(4)).await;

    // Pause drops into playback at the pause instant
    s.dvr.pause().await.unwrap();
    assert_eq!(s.dvr.mode().await, DvrMode::Playback);
    let paused_at = s.dvr.position().await.unwrap();
    assert!((paused_at - 4.0).abs() < 0.3, "paused at {}", paused_at);

    // Rewind walks the position back through recorded history
    s.dvr.rewind().await.unwrap();
    run_for(Duration::from_secs(1)).await;
    let rewound_to = s.dvr.position().await.unwrap();
    assert!(
        rewound_to < paused_at - 1.0,
        "rewind only moved to {}",
        rewound_to
    );

    // Fast-forward back out; hitting the end of recorded data while the
    // recording is still running folds the session back into live
    s.dvr.fast_forward().await.unwrap();
    run_for(Duration::from_secs(8)).await;

    assert_eq!(s.dvr.mode().await, DvrMode::Live);
    assert_eq!(s.source.payload().await, SourcePayload::Live);
    assert!(s.source.is_playing().await);

    let events = drain(&mut s.events);
    assert!(events.iter().any(|e| matches!(e, DvrEvent::ReachedEnd)));
    assert!(events.iter().any(|e| matches!(
        e,
        DvrEvent::ModeChanged {
            mode: DvrMode::Live
        }
    )));

    s.dvr.dispose().await;
    s.source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn rewinding_to_the_start_stays_in_playback() {
    let mut s = session();
    s.dvr.start_recording().await.unwrap();
    run_for(Duration::from_secs(4)).await;

    s.dvr.pause().await.unwrap();
    s.dvr.rewind().await.unwrap();
    run_for(Duration::from_secs(4)).await;

    assert_eq!(s.dvr.mode().await, DvrMode::Playback);
    let pos = s.dvr.position().await.unwrap();
    assert!(pos < 0.1, "position {} not at the start", pos);
    assert!(drain(&mut s.events)
        .iter()
        .any(|e| matches!(e, DvrEvent::ReachedStart)));

    s.dvr.dispose().await;
    s.source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn transport_changes_are_reported_on_the_event_stream() {
    let mut s = session();
    s.dvr.start_recording().await.unwrap();
    run_for(Duration::from_secs(3)).await;
    drain(&mut s.events);

    s.dvr.pause().await.unwrap();
    s.dvr.play().await.unwrap();
    run_for(Duration::from_millis(100)).await;

    let events = drain(&mut s.events);
    let mut saw_playback = false;
    let mut saw_paused = false;
    let mut saw_live = false;
    let mut saw_played = false;
    for ev in &events {
        match ev {
            DvrEvent::ModeChanged {
                mode: DvrMode::Playback,
            } => saw_playback = true,
            DvrEvent::Paused => saw_paused = true,
            DvrEvent::ModeChanged {
                mode: DvrMode::Live,
            } => saw_live = true,
            DvrEvent::Played => saw_played = true,
            _ => {}
        }
    }
    assert!(saw_playback && saw_paused, "pause sequence missing: {:?}", events);
    assert!(saw_live && saw_played, "resume sequence missing: {:?}", events);

    s.dvr.dispose().await;
    s.source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn stopping_the_recording_freezes_the_seekable_range() {
    let mut s = session();
    s.dvr.start_recording().await.unwrap();
    run_for(Duration::from_secs(3)).await;

    s.dvr.pause().await.unwrap();
    s.dvr.stop_recording().await.unwrap();
    assert!(!s.dvr.is_recording().await);

    // History stays seekable
    s.dvr.switch_to_playback(Some(1.0)).await.unwrap();
    let pos = s.dvr.position().await.unwrap();
    assert!((pos - 1.0).abs() < 0.01, "position {}", pos);

    // Beyond the frozen range nothing will ever exist
    assert!(matches!(
        s.dvr.switch_to_playback(Some(30.0)).await,
        Err(DvrError::NoData(_))
    ));

    // And there is no live feed to return to
    assert!(matches!(
        s.dvr.switch_to_live_stream().await,
        Err(DvrError::Precondition(_))
    ));

    drain(&mut s.events);
    s.dvr.dispose().await;
    s.source.shutdown();
}

#[tokio::test(start_paused = true)]
async fn capture_failure_is_surfaced_without_killing_the_session() {
    let source = SimSource::new();
    let dvr = DvrOrchestrator::new(
        SimReader::failing(),
        Arc::new(MemorySink::new()),
        source.clone(),
        DvrConfig::default(),
    );
    let mut events = dvr.subscribe();

    dvr.start_recording().await.unwrap();
    assert!(!dvr.is_recording().await);
    assert_eq!(dvr.mode().await, DvrMode::Live);

    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, DvrEvent::RecordingError { .. })));

    dvr.dispose().await;
    source.shutdown();
}
