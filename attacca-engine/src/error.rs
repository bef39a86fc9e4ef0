//! Error types for attacca-engine
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation. Synchronous operations return these directly; failures on the
//! decoding thread are serialized as events and surfaced through
//! `NodeObserver::encountered_error` instead of crossing thread boundaries.

use thiserror::Error;

/// Main error type for attacca-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Source format is unsupported or does not match the rendering format
    #[error("Format error: {0}")]
    Format(String),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Seek request could not be satisfied
    #[error("Seek error: {0}")]
    Seek(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    Output(String),

    /// Buffer or thread resources could not be allocated
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using attacca-engine Error
pub type Result<T> = std::result::Result<T, Error>;
