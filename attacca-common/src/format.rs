//! Audio format descriptors
//!
//! A processing format is the pair of sample rate and channel count a decoder
//! produces and a player node renders. Samples are always non-interleaved
//! f32 in the range [-1.0, 1.0]; the format does not carry a sample type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sample rate and channel count of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Frames per second.
    pub sample_rate: u32,

    /// Number of channels (1 = mono, 2 = stereo, ...).
    pub channel_count: u16,
}

impl AudioFormat {
    /// Create a format, e.g. `AudioFormat::new(44_100, 2)`.
    pub const fn new(sample_rate: u32, channel_count: u16) -> Self {
        Self { sample_rate, channel_count }
    }

    /// CD-quality stereo, the most common rendering format.
    pub const fn stereo_44100() -> Self {
        Self::new(44_100, 2)
    }

    /// True when both fields are usable.
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channel_count > 0
    }

    /// Duration of `frames` frames at this format's sample rate.
    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        debug_assert!(self.sample_rate > 0);
        let nanos = (frames as u128 * 1_000_000_000) / self.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Frame count spanning `duration` at this format's sample rate,
    /// rounding toward zero.
    pub fn duration_to_frames(&self, duration: Duration) -> u64 {
        ((duration.as_nanos() * self.sample_rate as u128) / 1_000_000_000) as u64
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz, {} ch", self.sample_rate, self.channel_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_duration_round_trip() {
        let fmt = AudioFormat::stereo_44100();
        assert_eq!(fmt.frames_to_duration(44_100), Duration::from_secs(1));
        assert_eq!(fmt.duration_to_frames(Duration::from_secs(1)), 44_100);
        assert_eq!(fmt.duration_to_frames(Duration::from_millis(500)), 22_050);
    }

    #[test]
    fn validity() {
        assert!(AudioFormat::new(48_000, 2).is_valid());
        assert!(!AudioFormat::new(0, 2).is_valid());
        assert!(!AudioFormat::new(44_100, 0).is_valid());
    }

    #[test]
    fn display_reads_naturally() {
        assert_eq!(AudioFormat::stereo_44100().to_string(), "44100 Hz, 2 ch");
    }
}
