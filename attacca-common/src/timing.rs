//! Host-tick timing for sample-accurate event timestamps
//!
//! The engine timestamps render-side events with a monotonic tick counter
//! rather than wall-clock samples, so a boundary that falls in the middle of
//! an output buffer can be stamped with the exact instant its sample reaches
//! the output, computed by frame arithmetic.
//!
//! Ticks run at 28,224,000 Hz, the least common multiple of the common audio
//! sample rates:
//!
//! - 44,100 Hz: 640 ticks per frame
//! - 48,000 Hz: 588 ticks per frame
//! - 88,200 Hz: 320 ticks per frame
//! - 96,000 Hz: 294 ticks per frame
//!
//! so frame→tick conversion at any of these rates is exact. Tick↔nanosecond
//! conversion uses a fixed numerator/denominator ratio (15,625 / 441),
//! established once per process; all event timestamps remain directly
//! comparable with each other and with `HostTicks::now()`.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Tick rate in ticks per second.
pub const TICK_RATE: u64 = 28_224_000;

/// Fixed tick→nanosecond ratio: `ns = ticks * TICK_NS_NUMER / TICK_NS_DENOM`.
///
/// 1,000,000,000 / 28,224,000 reduced to lowest terms.
pub const TICK_NS_NUMER: u64 = 15_625;
pub const TICK_NS_DENOM: u64 = 441;

/// Process epoch for `HostTicks::now()`, captured on first use.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A monotonic host timestamp in ticks since the process epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostTicks(pub u64);

impl HostTicks {
    /// Current host time.
    ///
    /// The first call fixes the process epoch; all later calls are relative
    /// to it.
    pub fn now() -> Self {
        let elapsed = EPOCH.elapsed();
        HostTicks(ns_to_ticks(elapsed.as_nanos() as u64))
    }

    /// Construct from a raw tick count.
    pub const fn from_ticks(ticks: u64) -> Self {
        HostTicks(ticks)
    }

    /// Raw tick count.
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// This timestamp expressed in nanoseconds.
    pub fn as_nanos(self) -> u64 {
        ticks_to_ns(self.0)
    }

    /// This timestamp expressed in seconds.
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / TICK_RATE as f64
    }

    /// Timestamp `frames` audio frames later at `sample_rate`.
    pub fn adding_frames(self, frames: u64, sample_rate: u32) -> Self {
        HostTicks(self.0.saturating_add(frames_to_ticks(frames, sample_rate)))
    }
}

/// Convert ticks to nanoseconds using the fixed ratio.
pub fn ticks_to_ns(ticks: u64) -> u64 {
    ((ticks as u128 * TICK_NS_NUMER as u128) / TICK_NS_DENOM as u128) as u64
}

/// Convert nanoseconds to ticks using the fixed ratio.
pub fn ns_to_ticks(ns: u64) -> u64 {
    ((ns as u128 * TICK_NS_DENOM as u128) / TICK_NS_NUMER as u128) as u64
}

/// Convert a frame count at `sample_rate` to ticks.
///
/// Exact for every rate that divides the tick rate (all standard rates);
/// other rates round toward zero.
pub fn frames_to_ticks(frames: u64, sample_rate: u32) -> u64 {
    debug_assert!(sample_rate > 0);
    if TICK_RATE % sample_rate as u64 == 0 {
        frames * (TICK_RATE / sample_rate as u64)
    } else {
        ((frames as u128 * TICK_RATE as u128) / sample_rate as u128) as u64
    }
}

/// Convert ticks to a frame count at `sample_rate`, rounding toward zero.
pub fn ticks_to_frames(ticks: u64, sample_rate: u32) -> u64 {
    debug_assert!(sample_rate > 0);
    ((ticks as u128 * sample_rate as u128) / TICK_RATE as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_rate_divides_standard_rates() {
        for rate in [8_000u64, 22_050, 44_100, 48_000, 88_200, 96_000, 176_400, 192_000] {
            assert_eq!(TICK_RATE % rate, 0, "{} must divide the tick rate", rate);
        }
    }

    #[test]
    fn ns_ratio_is_exact_at_one_second() {
        assert_eq!(ticks_to_ns(TICK_RATE), 1_000_000_000);
        assert_eq!(ns_to_ticks(1_000_000_000), TICK_RATE);
    }

    #[test]
    fn frames_to_ticks_exact_at_44100() {
        assert_eq!(frames_to_ticks(1, 44_100), 640);
        assert_eq!(frames_to_ticks(44_100, 44_100), TICK_RATE);
        assert_eq!(frames_to_ticks(512, 48_000), 512 * 588);
    }

    #[test]
    fn ticks_frames_round_trip() {
        for frames in [0u64, 1, 511, 512, 44_100, 1_000_000] {
            let ticks = frames_to_ticks(frames, 44_100);
            assert_eq!(ticks_to_frames(ticks, 44_100), frames);
        }
    }

    #[test]
    fn now_is_monotonic() {
        let a = HostTicks::now();
        let b = HostTicks::now();
        assert!(b >= a);
    }

    #[test]
    fn adding_frames_advances_by_frame_duration() {
        let t = HostTicks::from_ticks(1000);
        let later = t.adding_frames(441, 44_100);
        assert_eq!(later.ticks() - t.ticks(), 441 * 640);
    }
}
