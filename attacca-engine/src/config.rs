//! Engine configuration
//!
//! Tunables for the playback node, loadable from TOML. Every field has a
//! documented default and a valid range enforced by [`EngineConfig::validate`];
//! construction of a node with an invalid configuration fails rather than
//! clamping silently.

use crate::error::{Error, Result};
use serde::Deserialize;

/// Default ring buffer capacity in frames (~0.37 s @ 44.1kHz).
///
/// Rounded up to a power of two by the ring buffer itself.
const DEFAULT_RING_BUFFER_FRAMES: usize = 16_384;

/// Default decode chunk size in frames (~93 ms @ 44.1kHz).
const DEFAULT_DECODE_CHUNK_FRAMES: usize = 4_096;

/// Default capacity of each event queue, in records.
const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Playback node tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Sample ring buffer capacity in frames.
    ///
    /// Valid range: [1024, 16,777,216]. Rounded up to the next power of two.
    pub ring_buffer_frames: usize,

    /// Frames decoded per chunk on the decoding thread.
    ///
    /// Valid range: [64, ring_buffer_frames / 2]. Chunk boundaries are also
    /// the cancellation and seek observation points.
    pub decode_chunk_frames: usize,

    /// Capacity of each of the two event queues, in records.
    ///
    /// Valid range: [16, 65,536].
    pub event_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_buffer_frames: DEFAULT_RING_BUFFER_FRAMES,
            decode_chunk_frames: DEFAULT_DECODE_CHUNK_FRAMES,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(s).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check all fields against their valid ranges.
    pub fn validate(&self) -> Result<()> {
        if !(1_024..=16_777_216).contains(&self.ring_buffer_frames) {
            return Err(Error::Config(format!(
                "ring_buffer_frames {} outside [1024, 16777216]",
                self.ring_buffer_frames
            )));
        }
        if self.decode_chunk_frames < 64 {
            return Err(Error::Config(format!(
                "decode_chunk_frames {} below minimum 64",
                self.decode_chunk_frames
            )));
        }
        if self.decode_chunk_frames > self.ring_buffer_frames / 2 {
            return Err(Error::Config(format!(
                "decode_chunk_frames {} exceeds half the ring buffer ({})",
                self.decode_chunk_frames,
                self.ring_buffer_frames / 2
            )));
        }
        if !(16..=65_536).contains(&self.event_queue_capacity) {
            return Err(Error::Config(format!(
                "event_queue_capacity {} outside [16, 65536]",
                self.event_queue_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ring_buffer_frames, 16_384);
        assert_eq!(config.decode_chunk_frames, 4_096);
        assert_eq!(config.event_queue_capacity, 256);
    }

    #[test]
    fn toml_overrides_subset_of_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
            ring_buffer_frames = 65536
            decode_chunk_frames = 8192
            "#,
        )
        .unwrap();
        assert_eq!(config.ring_buffer_frames, 65_536);
        assert_eq!(config.decode_chunk_frames, 8_192);
        assert_eq!(config.event_queue_capacity, 256);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(EngineConfig::from_toml_str("ring_buffer_size = 4096").is_err());
    }

    #[test]
    fn rejects_oversized_chunk() {
        let config = EngineConfig {
            ring_buffer_frames: 4_096,
            decode_chunk_frames: 4_096,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
