//! Decoding capability
//!
//! The node consumes codecs through the [`Decoder`] trait: open a source,
//! report a processing format, produce PCM frames into a caller-supplied
//! planar buffer, optionally seek. Concrete codecs register themselves in a
//! process-wide table keyed by file extension; the node only depends on the
//! lookup contract, never on a specific codec.

pub mod symphonia;

use crate::buffer::SampleBuffer;
use crate::error::{Error, Result};
use attacca_common::AudioFormat;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::path::Path;
use tracing::debug;

pub use self::symphonia::SymphoniaDecoder;

/// A source of decoded PCM audio.
///
/// Contract:
/// - `open` must succeed before `processing_format`, `decode_into`,
///   `seek_to_frame`, or `total_frames` are meaningful.
/// - `processing_format` is fixed once open.
/// - `decode_into` fills the buffer from frame 0 with up to `max_frames`
///   frames and returns the count produced; 0 signals end of stream.
/// - `seek_to_frame` repositions so the next `decode_into` starts at (or
///   within the codec's stated tolerance of) the requested frame.
pub trait Decoder: Send {
    /// Open the source for reading.
    fn open(&mut self) -> Result<()>;

    /// True once `open` has succeeded and `close` has not been called.
    fn is_open(&self) -> bool;

    /// The PCM format this decoder produces. Fixed once open.
    fn processing_format(&self) -> AudioFormat;

    /// Decode up to `max_frames` frames into `buffer`.
    ///
    /// Returns the number of frames produced; 0 means end of stream.
    fn decode_into(&mut self, buffer: &mut SampleBuffer, max_frames: usize) -> Result<usize>;

    /// Whether `seek_to_frame` is supported for this source.
    fn supports_seeking(&self) -> bool;

    /// Reposition to `frame`.
    fn seek_to_frame(&mut self, frame: u64) -> Result<()>;

    /// Total frame count of the source, when the container reports one.
    fn total_frames(&self) -> Option<u64>;

    /// Release the source.
    fn close(&mut self) -> Result<()>;

    /// Human-readable description for logging.
    fn description(&self) -> String;
}

/// Factory entry in the decoder registry.
#[derive(Clone, Copy)]
pub struct DecoderFactory {
    /// Codec family name, for logs.
    pub name: &'static str,

    /// Lowercase file extensions this factory claims.
    pub extensions: &'static [&'static str],

    /// Construct an unopened decoder for the given path.
    pub open: fn(&Path) -> Result<Box<dyn Decoder>>,
}

/// Process-wide registry of decoder factories.
///
/// Seeded with the symphonia factory; external codecs may register
/// additional entries. Lookup is first-registered-wins per extension.
static REGISTRY: Lazy<RwLock<Vec<DecoderFactory>>> = Lazy::new(|| {
    RwLock::new(vec![DecoderFactory {
        name: "symphonia",
        extensions: &[
            "wav", "wave", "aiff", "aif", "mp3", "flac", "ogg", "oga", "m4a", "mp4", "aac", "caf",
        ],
        open: |path| Ok(Box::new(SymphoniaDecoder::for_path(path))),
    }])
});

/// Register an additional decoder factory.
pub fn register_factory(factory: DecoderFactory) {
    REGISTRY.write().push(factory);
}

/// Construct an unopened decoder for `path` by extension lookup.
///
/// Returns `Error::Format` when no registered factory claims the extension.
pub fn open_path(path: &Path) -> Result<Box<dyn Decoder>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .ok_or_else(|| Error::Format(format!("no file extension: {}", path.display())))?;

    let registry = REGISTRY.read();
    for factory in registry.iter() {
        if factory.extensions.contains(&extension.as_str()) {
            debug!(
                "Decoder factory '{}' claims .{} for {}",
                factory.name,
                extension,
                path.display()
            );
            return (factory.open)(path);
        }
    }

    Err(Error::Format(format!(
        "no decoder registered for .{} ({})",
        extension,
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn known_extensions_resolve() {
        for name in ["a.flac", "b.mp3", "c.WAV", "d.Ogg"] {
            let path = PathBuf::from(name);
            assert!(open_path(&path).is_ok(), "{} should resolve", name);
        }
    }

    #[test]
    fn unknown_extension_is_a_format_error() {
        let Err(err) = open_path(Path::new("notes.txt")) else {
            panic!("expected an error");
        };
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn missing_extension_is_a_format_error() {
        let Err(err) = open_path(Path::new("trackfile")) else {
            panic!("expected an error");
        };
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn registered_factory_takes_its_extensions() {
        fn open_stub(_: &Path) -> Result<Box<dyn Decoder>> {
            Err(Error::Internal("stub".into()))
        }
        register_factory(DecoderFactory {
            name: "stub",
            extensions: &["stubx"],
            open: open_stub,
        });
        let Err(err) = open_path(Path::new("x.stubx")) else {
            panic!("expected an error");
        };
        assert!(matches!(err, Error::Internal(_)));
    }
}
