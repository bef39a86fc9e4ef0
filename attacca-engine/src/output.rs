//! Audio output using cpal
//!
//! Host-runtime glue: opens an output device matching the node's rendering
//! format and drives the node's [`RenderContext`] from the device's realtime
//! callback. Device policy is intentionally minimal (named device with
//! fallback to the default, f32 or i16 sample formats); the node itself is
//! agnostic to how its render callback is invoked.

use crate::buffer::SampleBuffer;
use crate::error::{Error, Result};
use crate::node::RenderContext;
use attacca_common::HostTicks;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tracing::{debug, error, info, warn};

/// Largest callback buffer serviced in one render pass; bigger host buffers
/// are rendered in slices of this many frames.
const MAX_RENDER_SLICE_FRAMES: usize = 8_192;

/// Audio output stream driving a player node's render callback.
///
/// The wrapped `cpal::Stream` is not `Send`; keep the output on the thread
/// that created it.
pub struct AudioOutput {
    stream: Stream,
}

impl AudioOutput {
    /// Open an output device and start rendering `context`.
    ///
    /// `device_name` selects a device by name; `None` (or a name that cannot
    /// be found) uses the default output device.
    pub fn start(context: RenderContext, device_name: Option<&str>) -> Result<Self> {
        let device = Self::pick_device(device_name)?;
        let format = context.format();

        let (config, sample_format) = Self::pick_config(&device, format)?;
        info!(
            "Opening audio output: {} ch @ {} Hz, {:?} samples",
            config.channels, config.sample_rate.0, sample_format
        );

        let stream = match sample_format {
            SampleFormat::F32 => Self::build_stream_f32(&device, &config, context)?,
            SampleFormat::I16 => Self::build_stream_i16(&device, &config, context)?,
            other => {
                return Err(Error::Output(format!(
                    "unsupported device sample format: {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| Error::Output(format!("failed to start stream: {}", e)))?;

        Ok(Self { stream })
    }

    /// Pause the device stream without tearing it down.
    pub fn pause(&self) -> Result<()> {
        self.stream
            .pause()
            .map_err(|e| Error::Output(format!("failed to pause stream: {}", e)))
    }

    /// Resume a paused device stream.
    pub fn resume(&self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| Error::Output(format!("failed to resume stream: {}", e)))
    }

    fn pick_device(device_name: Option<&str>) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = device_name {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::Output(format!("failed to enumerate devices: {}", e)))?;
            if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                info!("Using requested audio device: {}", name);
                return Ok(device);
            }
            warn!("Requested device '{}' not found, falling back to default", name);
        }

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Output("no default output device found".to_string()))?;
        debug!(
            "Using default audio device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        Ok(device)
    }

    /// Find a supported config matching the node's rendering format,
    /// preferring f32 samples.
    fn pick_config(
        device: &Device,
        format: attacca_common::AudioFormat,
    ) -> Result<(StreamConfig, SampleFormat)> {
        let rate = cpal::SampleRate(format.sample_rate);
        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| Error::Output(format!("failed to query device configs: {}", e)))?
            .filter(|range| {
                range.channels() == format.channel_count
                    && range.min_sample_rate() <= rate
                    && range.max_sample_rate() >= rate
            })
            .collect();

        let chosen = ranges
            .iter()
            .find(|range| range.sample_format() == SampleFormat::F32)
            .or_else(|| {
                ranges
                    .iter()
                    .find(|range| range.sample_format() == SampleFormat::I16)
            })
            .ok_or_else(|| {
                Error::Output(format!(
                    "device supports no configuration matching {}",
                    format
                ))
            })?;

        let supported = chosen.with_sample_rate(rate);
        let sample_format = supported.sample_format();
        Ok((supported.config(), sample_format))
    }

    fn build_stream_f32(
        device: &Device,
        config: &StreamConfig,
        mut context: RenderContext,
    ) -> Result<Stream> {
        let channels = config.channels as usize;
        let sample_rate = config.sample_rate.0;
        let mut scratch = SampleBuffer::with_capacity(config.channels, MAX_RENDER_SLICE_FRAMES);

        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut host_time = HostTicks::now();
                    for slice in data.chunks_mut(channels * MAX_RENDER_SLICE_FRAMES) {
                        let frames = slice.len() / channels;
                        context.render(&mut scratch, frames, host_time);
                        for frame in 0..frames {
                            for ch in 0..channels {
                                slice[frame * channels + ch] =
                                    scratch.channel(ch)[frame].clamp(-1.0, 1.0);
                            }
                        }
                        host_time = host_time.adding_frames(frames as u64, sample_rate);
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| Error::Output(format!("failed to build stream: {}", e)))
    }

    fn build_stream_i16(
        device: &Device,
        config: &StreamConfig,
        mut context: RenderContext,
    ) -> Result<Stream> {
        let channels = config.channels as usize;
        let sample_rate = config.sample_rate.0;
        let mut scratch = SampleBuffer::with_capacity(config.channels, MAX_RENDER_SLICE_FRAMES);

        device
            .build_output_stream(
                config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut host_time = HostTicks::now();
                    for slice in data.chunks_mut(channels * MAX_RENDER_SLICE_FRAMES) {
                        let frames = slice.len() / channels;
                        context.render(&mut scratch, frames, host_time);
                        for frame in 0..frames {
                            for ch in 0..channels {
                                let sample = scratch.channel(ch)[frame].clamp(-1.0, 1.0);
                                slice[frame * channels + ch] = (sample * i16::MAX as f32) as i16;
                            }
                        }
                        host_time = host_time.adding_frames(frames as u64, sample_rate);
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| Error::Output(format!("failed to build stream: {}", e)))
    }
}
