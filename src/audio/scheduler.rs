//! Gapless playback scheduling.
//!
//! Every buffer starts at `max(cursor, now)` and pushes the cursor to its end,
//! so consecutive buffers are contiguous and never overlap. Owned by the engine
//! loop; nothing else mutates it.

use std::collections::HashSet;
use std::sync::Arc;

use super::pcm_codec::AudioBuffer;
use super::play::{PlaybackOutput, ScheduledUnit};
use super::resample::{resample, to_mono};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Listening,
    Speaking,
}

/// Where a buffer landed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSlot {
    pub id: u64,
    pub start: u64,
    pub frames: u64,
}

impl ScheduledSlot {
    pub fn end(&self) -> u64 {
        self.start + self.frames
    }
}

pub struct PlaybackScheduler {
    output: Arc<dyn PlaybackOutput>,
    cursor: u64,
    active: HashSet<u64>,
    next_id: u64,
    status: PlaybackStatus,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn PlaybackOutput>) -> Self {
        let cursor = output.now();
        Self {
            output,
            cursor,
            active: HashSet::new(),
            next_id: 1,
            status: PlaybackStatus::Listening,
        }
    }

    /// Schedule `buffer` right after everything already queued.
    ///
    /// Returns `None` for an empty buffer, which changes nothing.
    pub fn enqueue(&mut self, buffer: &AudioBuffer) -> Option<ScheduledSlot> {
        let rate = self.output.timeline_rate();
        let mono = to_mono(&buffer.samples, buffer.channels);
        let samples = resample(&mono, buffer.sample_rate, rate);
        if samples.is_empty() {
            return None;
        }

        let now = self.output.now();
        if self.cursor < now && !self.active.is_empty() {
            log::debug!(
                "Playback fell behind by {} frames, resuming at now",
                now - self.cursor
            );
        }
        let frames = samples.len() as u64;
        let id = self.next_id;
        self.next_id += 1;

        // The output may push the start later if it rendered past it meanwhile
        let start = self.output.schedule(ScheduledUnit {
            id,
            start: self.cursor.max(now),
            samples: samples.into(),
        });
        self.cursor = start + frames;
        self.active.insert(id);
        if self.status == PlaybackStatus::Listening {
            self.status = PlaybackStatus::Speaking;
        }

        Some(ScheduledSlot { id, start, frames })
    }

    /// Natural completion of a unit. Unknown ids are ignored.
    pub fn on_unit_ended(&mut self, id: u64) {
        if !self.active.remove(&id) {
            return;
        }
        if self.active.is_empty() {
            self.status = PlaybackStatus::Listening;
        }
    }

    /// Silence everything and rewind the cursor to now.
    pub fn reset(&mut self) {
        self.output.cancel_all();
        self.active.clear();
        self.cursor = self.output.now();
        self.status = PlaybackStatus::Listening;
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn timeline_rate(&self) -> u32 {
        self.output.timeline_rate()
    }
}
