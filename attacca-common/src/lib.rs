//! # Attacca Common Library
//!
//! Shared leaf types for the attacca audio engine:
//! - Host-tick timing (tick/nanosecond/frame conversions)
//! - Audio format descriptors

pub mod format;
pub mod timing;

pub use format::AudioFormat;
pub use timing::HostTicks;
