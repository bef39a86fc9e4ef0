//! # Attacca Audio Engine
//!
//! Format-agnostic decoding, gapless playback, and realtime rendering of
//! compressed and PCM audio.
//!
//! The centerpiece is [`PlayerNode`]: decoders are enqueued and decoded on a
//! background thread into a lock-free sample ring buffer, and a realtime
//! [`RenderContext`] drains that buffer on the host audio callback while
//! tracking frame-accurate decoder boundaries, so consecutive sources play
//! back-to-back with no inserted silence. Lifecycle events from both threads
//! are merged into causal order and delivered to [`NodeObserver`]s on a
//! dedicated event thread.
//!
//! **Architecture:** symphonia decoders behind a capability trait, a planar
//! SPSC ring buffer with monotonic frame counters, one decoding thread, one
//! event thread, and a never-blocking render callback driven by cpal (or any
//! other host runtime).

pub mod buffer;
pub mod config;
pub mod decoder;
pub mod error;
pub mod node;
pub mod output;

pub use attacca_common::{AudioFormat, HostTicks};
pub use buffer::SampleBuffer;
pub use config::EngineConfig;
pub use decoder::{Decoder, SymphoniaDecoder};
pub use error::{Error, Result};
pub use node::{
    DecoderHandle, DecoderId, NodeObserver, PlaybackPosition, PlaybackTime, PlayerNode,
    RenderContext, RenderStatus,
};
pub use output::AudioOutput;
