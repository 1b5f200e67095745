//! Gapless playback scheduling for streamed model audio
//!
//! Units arrive with network jitter but are logically sequential. Each unit
//! starts at `max(next_start, now)`, so bursts play back to back and stalls
//! resume at the current clock instead of building a backlog.

use crate::pcm::{self, PcmError};

/// One decoded buffer of remote audio.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Output-clock time (seconds) at which playback begins
    pub start_time: f64,
}

impl PlaybackUnit {
    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }
}

/// Decode a base64 PCM16 payload into an unscheduled unit.
pub fn decode_unit(payload: &str, sample_rate: u32) -> Result<PlaybackUnit, PcmError> {
    Ok(PlaybackUnit {
        samples: pcm::decode_base64_pcm(payload)?,
        sample_rate,
        start_time: 0.0,
    })
}

/// Tracks where the next unit may start.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start: f64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `duration` seconds of output starting no earlier than `now`.
    /// Returns the start time.
    pub fn schedule(&mut self, duration: f64, now: f64) -> f64 {
        let start = self.next_start.max(now);
        self.next_start = start + duration;
        start
    }

    /// Stamp a unit with its start time.
    pub fn schedule_unit(&mut self, unit: &mut PlaybackUnit, now: f64) {
        unit.start_time = self.schedule(unit.duration(), now);
    }

    /// Forget scheduling state from a previous session.
    pub fn reset(&mut self) {
        self.next_start = 0.0;
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}
