use media_source::SegmentLocator;
use tokio::sync::broadcast;

use crate::stream_recorder::Recording;
use crate::{DvrError, DvrEvent};

/// One finalized (or provisionally finalized) chunk of recorded video.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Position in the collection; assigned at insertion, never reused.
    pub index: usize,
    /// Timeline instant the segment begins at (seconds).
    pub start_time: f64,
    /// Seconds of playable content. Estimated at insertion, corrected once
    /// real playback resolves the true value.
    pub duration: f64,
    /// Handle to the underlying bytes; released when superseded.
    pub locator: SegmentLocator,
    /// Produced via force-render; subject to in-place replacement.
    pub is_partial: bool,
    /// A decode fault was hit while rendering this segment.
    pub had_decode_error: bool,
}

impl Segment {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Result of a time lookup: the covering segment and the offset into it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentHit {
    pub index: usize,
    pub offset: f64,
}

/// Result of an insertion: the segment's index and, when the trailing
/// partial was replaced, the locator the caller must release.
#[derive(Debug)]
pub struct AddOutcome {
    pub index: usize,
    pub replaced: Option<SegmentLocator>,
}

/// The authoritative, time-ordered record of all capture chunks.
///
/// Invariants: strictly increasing index and start time; at most one
/// trailing partial segment; non-partial segments are only ever mutated by
/// duration correction. All mutation comes from the single live-recorder
/// writer.
pub struct SegmentStore {
    segments: Vec<Segment>,
    next_index: usize,
    epsilon: f64,
    event_tx: broadcast::Sender<DvrEvent>,
}

impl SegmentStore {
    pub fn new(epsilon: f64, event_tx: broadcast::Sender<DvrEvent>) -> Self {
        Self {
            segments: Vec::new(),
            next_index: 0,
            epsilon,
            event_tx,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Segment> {
        self.segments.get(index).cloned()
    }

    /// Consume a recording into the collection.
    ///
    /// If the trailing segment is partial it is replaced in place (same
    /// index, superseded locator handed back for release); otherwise a new
    /// segment is appended with the next index.
    pub fn add_segment(&mut self, recording: &Recording, locator: SegmentLocator) -> AddOutcome {
        let replaced_trailing = self
            .segments
            .last()
            .map(|s| s.is_partial)
            .unwrap_or(false);

        let outcome = if replaced_trailing {
            let last = self
                .segments
                .last_mut()
                .unwrap_or_else(|| unreachable!("checked non-empty above"));
            let old_locator = std::mem::replace(&mut last.locator, locator);
            last.start_time = recording.start_time;
            last.duration = recording.duration;
            last.is_partial = recording.is_partial;
            last.had_decode_error = false;
            AddOutcome {
                index: last.index,
                replaced: Some(old_locator),
            }
        } else {
            let index = self.next_index;
            self.next_index += 1;
            self.segments.push(Segment {
                index,
                start_time: recording.start_time,
                duration: recording.duration,
                locator,
                is_partial: recording.is_partial,
                had_decode_error: false,
            });
            AddOutcome {
                index,
                replaced: None,
            }
        };

        self.rechain();

        let seg = &self.segments[outcome.index];
        log::debug!(
            "Segment {} {} (start {:.3}s, {:.3}s, partial={})",
            seg.index,
            if outcome.replaced.is_some() { "replaced" } else { "added" },
            seg.start_time,
            seg.duration,
            seg.is_partial,
        );
        let _ = self.event_tx.send(DvrEvent::SegmentAdded {
            index: seg.index,
            start_time: seg.start_time,
            duration: seg.duration,
            is_partial: seg.is_partial,
            replaced: outcome.replaced.is_some(),
        });

        outcome
    }

    /// Apply a more accurate duration reported by the presentable source.
    /// No-op if unchanged; otherwise later segments are re-chained.
    pub fn reset_segment_duration(
        &mut self,
        index: usize,
        new_duration: f64,
    ) -> Result<(), DvrError> {
        let segment = self
            .segments
            .get_mut(index)
            .ok_or_else(|| DvrError::Precondition(format!("no segment at index {}", index)))?;

        if (segment.duration - new_duration).abs() < f64::EPSILON {
            return Ok(());
        }

        log::debug!(
            "Segment {} duration corrected {:.3}s -> {:.3}s",
            index,
            segment.duration,
            new_duration
        );
        segment.duration = new_duration;
        self.rechain();

        let _ = self.event_tx.send(DvrEvent::SegmentDurationCorrected {
            index,
            duration: new_duration,
        });
        Ok(())
    }

    /// Find the segment covering `time`. Total over all of time: clamps to
    /// the first segment's start and the last segment's end, and resolves a
    /// time inside a gap (or exactly on an end boundary) to the *next*
    /// segment at offset zero so playback always lands in renderable
    /// content.
    pub fn segment_at_time(&self, time: f64) -> Result<SegmentHit, DvrError> {
        let first = self.segments.first().ok_or_else(|| {
            DvrError::Precondition("segment lookup on an empty collection".to_string())
        })?;
        let last = self
            .segments
            .last()
            .unwrap_or_else(|| unreachable!("non-empty"));

        if time <= first.start_time {
            return Ok(SegmentHit {
                index: 0,
                offset: 0.0,
            });
        }
        if time >= last.end_time() {
            return Ok(SegmentHit {
                index: self.segments.len() - 1,
                offset: last.duration,
            });
        }

        for (i, segment) in self.segments.iter().enumerate() {
            // Past the previous segment's window but before this one starts:
            // the time sits in a gap or on an end boundary. Land here.
            if time < segment.start_time {
                return Ok(SegmentHit {
                    index: i,
                    offset: 0.0,
                });
            }
            if time < segment.end_time() {
                return Ok(SegmentHit {
                    index: i,
                    offset: time - segment.start_time,
                });
            }
        }

        Err(DvrError::Internal(format!(
            "no segment covers {:.3}s despite being within collection bounds",
            time
        )))
    }

    pub fn next_segment(&self, index: usize) -> Option<Segment> {
        self.segments.get(index + 1).cloned()
    }

    pub fn is_first_segment(&self, index: usize) -> bool {
        index == 0 && !self.segments.is_empty()
    }

    pub fn is_last_segment(&self, index: usize) -> bool {
        !self.segments.is_empty() && index == self.segments.len() - 1
    }

    pub fn contains_time(&self, time: f64) -> bool {
        match (self.segments.first(), self.segments.last()) {
            (Some(first), Some(last)) => time >= first.start_time && time <= last.end_time(),
            _ => false,
        }
    }

    pub fn first_start_time(&self) -> Result<f64, DvrError> {
        self.segments
            .first()
            .map(|s| s.start_time)
            .ok_or_else(|| DvrError::Precondition("empty collection has no start".to_string()))
    }

    pub fn last_end_time(&self) -> Result<f64, DvrError> {
        self.segments
            .last()
            .map(|s| s.end_time())
            .ok_or_else(|| DvrError::Precondition("empty collection has no end".to_string()))
    }

    pub fn mark_decode_error(&mut self, index: usize) {
        if let Some(segment) = self.segments.get_mut(index) {
            segment.had_decode_error = true;
        }
    }

    /// Re-derive the start offset chain: segment n starts no earlier than a
    /// strictly positive epsilon after segment n-1 ends, so no two segments
    /// ever report the same boundary instant. Recorded gaps (capture
    /// interruptions) are preserved; only overlapping or coincident starts
    /// are pushed forward.
    fn rechain(&mut self) {
        for i in 1..self.segments.len() {
            let min_start = self.segments[i - 1].end_time() + self.epsilon;
            if self.segments[i].start_time < min_start {
                self.segments[i].start_time = min_start;
            }
        }
    }
}
