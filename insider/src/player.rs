//! Deterministic playback of a finalized recording.
//!
//! The player is a pure state machine: the caller owns the wall clock and
//! feeds elapsed real time into [`Player::tick`], which returns the events
//! that became due. Seeking backward replays from the start (event effects
//! are not invertible), signalled by a leading [`PlaybackSignal::Reset`].

use crate::recorder::{RecordedEvent, Recording};

/// Gaps longer than this are compressed down to it when skipping pauses.
const SKIP_LONG_PAUSES_THRESHOLD_MS: u64 = 5000;

const MIN_SPEED: f64 = 0.25;
const MAX_SPEED: f64 = 8.0;

/// What the caller must do to its presentation state.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackSignal {
    /// Discard all presentation state and start from an empty room.
    Reset,
    /// Apply this event's effect.
    Event(RecordedEvent),
}

/// Scrubable playback cursor over one recording.
pub struct Player {
    events: Vec<RecordedEvent>,
    /// Effective timestamp per event; differs from the recorded one only
    /// while long pauses are being skipped.
    display: Vec<u64>,
    clock_ms: f64,
    speed: f64,
    playing: bool,
    skip_long_pauses: bool,
    /// Index of the first event not yet emitted at the current clock.
    next: usize,
}

impl Player {
    pub fn new(recording: Recording) -> Self {
        let events = recording.recording;
        let display = events.iter().map(|e| e.timestamp_ms).collect();
        Self {
            events,
            display,
            clock_ms: 0.0,
            speed: 1.0,
            playing: false,
            skip_long_pauses: false,
            next: 0,
        }
    }

    pub fn play(&mut self) {
        self.playing = true;
    }

    pub fn pause(&mut self) {
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_finished(&self) -> bool {
        self.next == self.events.len()
    }

    /// Current position on the (possibly compressed) timeline.
    pub fn position_ms(&self) -> u64 {
        self.clock_ms as u64
    }

    /// Total length of the (possibly compressed) timeline.
    pub fn duration_ms(&self) -> u64 {
        self.display.last().copied().unwrap_or(0)
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed.clamp(MIN_SPEED, MAX_SPEED);
    }

    pub fn skips_long_pauses(&self) -> bool {
        self.skip_long_pauses
    }

    /// Advance the clock by `real_delta_ms` of wall time and return the
    /// events that became due, in timeline order. Pausing the player makes
    /// this a no-op. Reaching the end pauses automatically.
    pub fn tick(&mut self, real_delta_ms: f64) -> Vec<PlaybackSignal> {
        if !self.playing {
            return Vec::new();
        }
        let target = (self.clock_ms + real_delta_ms * self.speed)
            .min(self.duration_ms() as f64);
        self.clock_ms = target;
        let due = self.drain_due();
        if self.is_finished() {
            self.playing = false;
        }
        due
    }

    /// Jump to `to_ms` on the timeline.
    ///
    /// Forward seeks emit the skipped-over events; backward seeks emit a
    /// [`PlaybackSignal::Reset`] followed by every event up to the target.
    pub fn seek(&mut self, to_ms: u64) -> Vec<PlaybackSignal> {
        let to_ms = to_ms.min(self.duration_ms());
        if (to_ms as f64) < self.clock_ms {
            self.clock_ms = to_ms as f64;
            self.next = 0;
            let mut signals = vec![PlaybackSignal::Reset];
            signals.extend(self.drain_due());
            signals
        } else {
            self.clock_ms = to_ms as f64;
            self.drain_due()
        }
    }

    /// Toggle long-pause compression and rewind to the start.
    ///
    /// With compression on, every inter-event gap longer than the
    /// threshold is shortened to exactly the threshold and all later
    /// events shift earlier by the accumulated cut. Toggling rewinds
    /// because positions on the two timelines do not correspond.
    pub fn toggle_skip_long_pauses(&mut self) -> Vec<PlaybackSignal> {
        self.skip_long_pauses = !self.skip_long_pauses;
        self.display = if self.skip_long_pauses {
            let mut cut = 0u64;
            // Only gaps between events count; the lead-in before the first
            // event stays as recorded.
            let mut previous: Option<u64> = None;
            self.events
                .iter()
                .map(|event| {
                    if let Some(prev) = previous {
                        let gap = event.timestamp_ms.saturating_sub(prev);
                        if gap > SKIP_LONG_PAUSES_THRESHOLD_MS {
                            cut += gap - SKIP_LONG_PAUSES_THRESHOLD_MS;
                        }
                    }
                    previous = Some(event.timestamp_ms);
                    event.timestamp_ms - cut
                })
                .collect()
        } else {
            self.events.iter().map(|e| e.timestamp_ms).collect()
        };
        self.clock_ms = 0.0;
        self.next = 0;
        vec![PlaybackSignal::Reset]
    }

    fn drain_due(&mut self) -> Vec<PlaybackSignal> {
        let clock = self.clock_ms as u64;
        let mut due = Vec::new();
        while self.next < self.events.len() && self.display[self.next] <= clock {
            due.push(PlaybackSignal::Event(self.events[self.next].clone()));
            self.next += 1;
        }
        due
    }
}
