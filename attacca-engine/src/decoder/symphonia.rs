//! Streaming audio decoder backed by symphonia
//!
//! Decodes MP3, FLAC, AAC, Vorbis, WAV and friends to planar f32 PCM. The
//! decoder is streaming: each `decode_into` call serves exactly the requested
//! frame count from an internal planar carry-over, pulling packets from the
//! format reader as needed, so callers never see partial-packet granularity.

use crate::buffer::SampleBuffer;
use crate::decoder::Decoder;
use crate::error::{Error, Result};
use attacca_common::AudioFormat;
use std::fs::File;
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer as SymphoniaSampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

/// Reader-side state that exists only while the decoder is open.
struct OpenState {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    format: AudioFormat,
    total_frames: Option<u64>,
    /// Interleaved conversion scratch, grown to the largest packet seen.
    conversion: Option<SymphoniaSampleBuffer<f32>>,
    /// Planar frames decoded but not yet handed out.
    carry: Vec<Vec<f32>>,
    /// Consumed frame offset into `carry`.
    carry_pos: usize,
    /// End of stream reached on the reader.
    exhausted: bool,
}

/// Symphonia-backed implementation of the decoding capability.
pub struct SymphoniaDecoder {
    path: PathBuf,
    state: Option<OpenState>,
}

impl SymphoniaDecoder {
    /// Create an unopened decoder for a file path.
    pub fn for_path(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            state: None,
        }
    }

    /// Probe the file and build reader + codec decoder.
    fn probe(path: &Path) -> Result<OpenState> {
        let file = File::open(path)
            .map_err(|e| Error::Decode(format!("failed to open {}: {}", path.display(), e)))?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| Error::Decode(format!("failed to probe format: {}", e)))?;

        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("no audio track found".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode("sample rate not reported".to_string()))?;
        let channel_count = codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::Decode("channel count not reported".to_string()))?;
        let total_frames = codec_params.n_frames;

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("failed to create decoder: {}", e)))?;

        let format = AudioFormat::new(sample_rate, channel_count);
        debug!(
            "Opened {}: {}, {:?} total frames",
            path.display(),
            format,
            total_frames
        );

        Ok(OpenState {
            reader,
            decoder,
            track_id,
            format,
            total_frames,
            conversion: None,
            carry: vec![Vec::new(); channel_count as usize],
            carry_pos: 0,
            exhausted: false,
        })
    }

    /// Pull one packet, decode it, and refill the carry-over.
    ///
    /// Returns false at end of stream.
    fn refill_carry(state: &mut OpenState) -> Result<bool> {
        loop {
            let packet = match state.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    warn!("Format reader requires reset, treating as end of stream");
                    return Ok(false);
                }
                Err(e) => {
                    return Err(Error::Decode(format!("error reading packet: {}", e)));
                }
            };

            if packet.track_id() != state.track_id {
                continue;
            }

            let decoded = match state.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    // Recoverable per-packet corruption: skip the packet.
                    warn!("Decode error, skipping packet: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(Error::Decode(format!("decode failed: {}", e)));
                }
            };

            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let duration = decoded.capacity() as u64;
            let needed = decoded.frames() * spec.channels.count();

            if state.conversion.as_ref().map_or(true, |b| b.capacity() < needed) {
                state.conversion = None;
            }
            let conversion = state
                .conversion
                .get_or_insert_with(|| SymphoniaSampleBuffer::<f32>::new(duration, spec));
            conversion.copy_interleaved_ref(decoded);

            let channel_count = spec.channels.count();
            let frames = conversion.samples().len() / channel_count;

            for carry in state.carry.iter_mut() {
                carry.clear();
            }
            state.carry_pos = 0;

            let samples = conversion.samples();
            for (ch, carry) in state.carry.iter_mut().enumerate() {
                carry.extend(
                    samples[ch..]
                        .iter()
                        .step_by(channel_count)
                        .take(frames)
                        .copied(),
                );
            }

            return Ok(true);
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn open(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }
        self.state = Some(Self::probe(&self.path)?);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn processing_format(&self) -> AudioFormat {
        self.state
            .as_ref()
            .map(|s| s.format)
            .unwrap_or(AudioFormat::new(0, 0))
    }

    fn decode_into(&mut self, buffer: &mut SampleBuffer, max_frames: usize) -> Result<usize> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::InvalidState("decoder is not open".to_string()))?;

        let max_frames = max_frames.min(buffer.frame_capacity());
        let channel_count = state.format.channel_count as usize;
        let mut produced = 0usize;

        while produced < max_frames {
            let available = state.carry[0].len().saturating_sub(state.carry_pos);
            if available == 0 {
                if state.exhausted {
                    break;
                }
                if !Self::refill_carry(state)? {
                    state.exhausted = true;
                    break;
                }
                continue;
            }

            let take = available.min(max_frames - produced);
            for ch in 0..channel_count {
                let src = &state.carry[ch][state.carry_pos..state.carry_pos + take];
                buffer.channel_mut(ch)[produced..produced + take].copy_from_slice(src);
            }
            state.carry_pos += take;
            produced += take;
        }

        buffer.set_frame_len(produced);
        Ok(produced)
    }

    fn supports_seeking(&self) -> bool {
        self.state.is_some()
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::InvalidState("decoder is not open".to_string()))?;

        let sample_rate = state.format.sample_rate as u64;
        let seconds = frame / sample_rate;
        let frac = (frame % sample_rate) as f64 / sample_rate as f64;

        state
            .reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::new(seconds, frac),
                    track_id: Some(state.track_id),
                },
            )
            .map_err(|e| Error::Seek(format!("seek to frame {} failed: {}", frame, e)))?;

        // Codec state is stale after a reader seek.
        state.decoder.reset();
        for carry in state.carry.iter_mut() {
            carry.clear();
        }
        state.carry_pos = 0;
        state.exhausted = false;
        Ok(())
    }

    fn total_frames(&self) -> Option<u64> {
        self.state.as_ref().and_then(|s| s.total_frames)
    }

    fn close(&mut self) -> Result<()> {
        if self.state.take().is_some() {
            debug!("Closed {}", self.path.display());
        }
        Ok(())
    }

    fn description(&self) -> String {
        format!("symphonia:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unopened_decoder_rejects_decode() {
        let mut decoder = SymphoniaDecoder::for_path(Path::new("/nonexistent/file.flac"));
        assert!(!decoder.is_open());
        let mut buf = SampleBuffer::with_capacity(2, 64);
        assert!(matches!(
            decoder.decode_into(&mut buf, 64),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn missing_file_fails_to_open() {
        let mut decoder = SymphoniaDecoder::for_path(Path::new("/nonexistent/file.flac"));
        assert!(matches!(decoder.open(), Err(Error::Decode(_))));
    }

    #[test]
    fn close_is_idempotent() {
        let mut decoder = SymphoniaDecoder::for_path(Path::new("/nonexistent/file.flac"));
        assert!(decoder.close().is_ok());
        assert!(decoder.close().is_ok());
    }
}
