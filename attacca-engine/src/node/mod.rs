//! Gapless player node
//!
//! `PlayerNode` owns the whole pipeline: the pending-decoder queue, the
//! active decoder states, the sample ring buffer, the decoding thread, the
//! event thread, and the realtime `RenderContext` handed to the host audio
//! runtime. The rendering format is fixed at construction; decoders whose
//! processing format differs are rejected at enqueue.

pub mod decoder_state;
pub mod events;
pub mod render;
pub mod ring_buffer;

mod decode_worker;
mod flags;
mod sync;

pub use decoder_state::DecoderHandle;
pub use events::NodeObserver;
pub use render::{RenderContext, RenderStatus};

use crate::config::EngineConfig;
use crate::decoder::{self, Decoder};
use crate::error::{Error, Result};
use attacca_common::AudioFormat;
use decoder_state::{ActiveDecoders, DecoderState};
use events::event_queue;
use flags::{Flags, IS_PLAYING, MUTE_REQUESTED, STOP_DECODING, STOP_EVENTS, UNMUTE_AFTER_DEQUEUE};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use sync::Semaphore;
use tracing::{debug, info, trace};

/// Token identifying an enqueued decoder; becomes the decoder's sequence
/// number when it is activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecoderId(u64);

impl DecoderId {
    /// The underlying sequence value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Current playback position of the current decoder, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackPosition {
    /// Frames rendered so far.
    pub frame: u64,

    /// Total frames, when the container reports a length.
    pub total_frames: Option<u64>,
}

/// Current playback position of the current decoder, as time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTime {
    /// Time rendered so far.
    pub current: Duration,

    /// Total duration, when the container reports a length.
    pub total: Option<Duration>,
}

/// A decoder waiting in the FIFO queue.
pub(crate) struct PendingDecoder {
    pub sequence: u64,
    pub decoder: Box<dyn Decoder>,
}

/// State shared by the façade, the decoding thread, the event thread, and
/// the render callback.
pub(crate) struct NodeShared {
    pub format: AudioFormat,
    pub config: EngineConfig,
    pub flags: Flags,

    /// Active decoder states, ordered by sequence. Non-realtime threads
    /// lock; the render callback only try-locks.
    pub active: Mutex<ActiveDecoders>,

    /// Pending decoders. Never touched by the render callback.
    pub pending: Mutex<VecDeque<PendingDecoder>>,

    /// Source of queue tokens and activation sequence numbers.
    pub sequence_counter: AtomicU64,

    /// Parks the decoding thread; signaled by enqueue, render, shutdown.
    pub decode_sem: Semaphore,

    /// Parks the event thread; signaled by both event producers.
    pub event_sem: Semaphore,

    /// Registered observers, snapshotted per dispatch.
    pub observers: RwLock<Vec<Arc<dyn NodeObserver>>>,
}

impl NodeShared {
    /// Remove finished states under the decoder lock.
    pub fn retire_finished(&self) {
        let retired = self.active.lock().retire_finished();
        if retired > 0 {
            trace!("Retired {} decoder state(s)", retired);
        }
    }
}

/// Format-agnostic gapless playback node.
///
/// Construction allocates every buffer and spawns the decoding and event
/// threads; any allocation or spawn failure aborts construction. Dropping
/// the node stops and joins both threads. The realtime half is obtained
/// once via [`PlayerNode::take_render_context`] and driven by the host
/// audio runtime.
pub struct PlayerNode {
    shared: Arc<NodeShared>,
    render_context: Option<RenderContext>,
    decode_thread: Option<JoinHandle<()>>,
    event_thread: Option<JoinHandle<()>>,
}

impl PlayerNode {
    /// Create a node rendering `format`, with default tuning.
    pub fn new(format: AudioFormat) -> Result<Self> {
        Self::with_config(format, EngineConfig::default())
    }

    /// Create a node rendering `format` with explicit tuning.
    pub fn with_config(format: AudioFormat, config: EngineConfig) -> Result<Self> {
        if !format.is_valid() {
            return Err(Error::Format(format!("invalid rendering format: {}", format)));
        }
        config.validate()?;

        let ring = ring_buffer::SampleRingBuffer::new(format.channel_count, config.ring_buffer_frames)?;
        let (writer, reader) = ring.split();

        let (decode_tx, decode_rx) = event_queue(config.event_queue_capacity);
        let (render_tx, render_rx) = event_queue(config.event_queue_capacity);

        let shared = Arc::new(NodeShared {
            format,
            config,
            flags: Flags::new(),
            active: Mutex::new(ActiveDecoders::default()),
            pending: Mutex::new(VecDeque::new()),
            sequence_counter: AtomicU64::new(0),
            decode_sem: Semaphore::new(),
            event_sem: Semaphore::new(),
            observers: RwLock::new(Vec::new()),
        });

        let decode_shared = Arc::clone(&shared);
        let decode_thread = std::thread::Builder::new()
            .name("attacca-decode".into())
            .spawn(move || decode_worker::decode_thread_loop(decode_shared, writer, decode_tx))
            .map_err(|e| Error::Allocation(format!("failed to spawn decoding thread: {}", e)))?;

        let event_shared = Arc::clone(&shared);
        let event_thread = match std::thread::Builder::new()
            .name("attacca-events".into())
            .spawn(move || events::event_thread_loop(event_shared, decode_rx, render_rx))
        {
            Ok(handle) => handle,
            Err(e) => {
                // Unwind the decode thread before reporting failure.
                shared.flags.set(STOP_DECODING);
                shared.decode_sem.signal();
                let _ = decode_thread.join();
                return Err(Error::Allocation(format!("failed to spawn event thread: {}", e)));
            }
        };

        let render_context = RenderContext::new(Arc::clone(&shared), reader, render_tx);

        info!("Player node created: {} ({} frame ring)", format, shared.config.ring_buffer_frames);

        Ok(Self {
            shared,
            render_context: Some(render_context),
            decode_thread: Some(decode_thread),
            event_thread: Some(event_thread),
        })
    }

    /// Take the realtime rendering half. Returns `None` after the first call.
    pub fn take_render_context(&mut self) -> Option<RenderContext> {
        self.render_context.take()
    }

    // -- queue management --------------------------------------------------

    /// Append a decoder to the queue.
    ///
    /// Opens the decoder if needed and rejects it when its processing format
    /// does not match the node's rendering format. Ownership of the decoder
    /// moves into the node, so a decoder cannot be enqueued twice.
    pub fn enqueue(&self, decoder: Box<dyn Decoder>) -> Result<DecoderId> {
        self.enqueue_inner(decoder, false)
    }

    /// Cancel everything active, clear the queue, and enqueue `decoder` for
    /// immediate playback of its audio next.
    pub fn reset_and_enqueue(&self, decoder: Box<dyn Decoder>) -> Result<DecoderId> {
        self.enqueue_inner(decoder, true)
    }

    /// [`PlayerNode::enqueue`] by filesystem path, via the decoder registry.
    pub fn enqueue_path(&self, path: impl AsRef<Path>) -> Result<DecoderId> {
        self.enqueue(decoder::open_path(path.as_ref())?)
    }

    /// [`PlayerNode::reset_and_enqueue`] by filesystem path.
    pub fn reset_and_enqueue_path(&self, path: impl AsRef<Path>) -> Result<DecoderId> {
        self.reset_and_enqueue(decoder::open_path(path.as_ref())?)
    }

    fn enqueue_inner(&self, mut decoder: Box<dyn Decoder>, reset_first: bool) -> Result<DecoderId> {
        if !decoder.is_open() {
            decoder.open()?;
        }
        let decoder_format = decoder.processing_format();
        if !self.supports_format(decoder_format) {
            return Err(Error::Format(format!(
                "decoder format ({}) does not match rendering format ({})",
                decoder_format, self.shared.format
            )));
        }

        if reset_first {
            // Keep the transition silent until the replacement is live.
            if self.shared.flags.is_playing() {
                self.shared.flags.set(MUTE_REQUESTED | UNMUTE_AFTER_DEQUEUE);
            }
            self.clear_queue();
            self.cancel_active_decoders(true);
        }

        let sequence = self.shared.sequence_counter.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Enqueued decoder: seq={}, {} (reset_first={})",
            sequence,
            decoder.description(),
            reset_first
        );
        self.shared
            .pending
            .lock()
            .push_back(PendingDecoder { sequence, decoder });
        self.shared.decode_sem.signal();
        Ok(DecoderId(sequence))
    }

    /// Pop and return the decoder at the head of the queue, if any.
    pub fn dequeue(&self) -> Option<Box<dyn Decoder>> {
        self.shared.pending.lock().pop_front().map(|p| p.decoder)
    }

    /// Remove a specific not-yet-active decoder from the queue.
    ///
    /// Returns whether it was found.
    pub fn remove_from_queue(&self, id: DecoderId) -> bool {
        let mut pending = self.shared.pending.lock();
        let before = pending.len();
        pending.retain(|p| p.sequence != id.0);
        before != pending.len()
    }

    /// Drop every queued decoder.
    pub fn clear_queue(&self) {
        let count = {
            let mut pending = self.shared.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if count > 0 {
            debug!("Cleared {} queued decoder(s)", count);
        }
    }

    /// Number of decoders waiting in the queue.
    pub fn queued_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Mark active decoder state(s) canceled. Cancellation is cooperative:
    /// an in-flight decode finishes its current chunk first, and already
    /// canceled or retired decoders are unaffected.
    pub fn cancel_active_decoders(&self, cancel_all: bool) {
        let canceled = {
            let active = self.shared.active.lock();
            if cancel_all {
                active.cancel_all()
            } else {
                usize::from(active.cancel_current())
            }
        };
        if canceled > 0 {
            debug!("Canceled {} active decoder(s)", canceled);
            self.shared.decode_sem.signal();
        }
    }

    // -- transport ---------------------------------------------------------

    /// Begin (or resume) rendering audio.
    pub fn play(&self) {
        if self.shared.flags.set(IS_PLAYING) {
            debug!("Playback started");
            self.shared.decode_sem.signal();
        }
    }

    /// Stop rendering audio; the queue and active decoders are untouched.
    pub fn pause(&self) {
        if self.shared.flags.clear(IS_PLAYING) {
            debug!("Playback paused");
        }
    }

    /// Toggle between playing and paused.
    pub fn toggle_play_pause(&self) {
        let now_playing = self.shared.flags.toggle(IS_PLAYING) & IS_PLAYING != 0;
        debug!("Playback toggled: playing={}", now_playing);
        if now_playing {
            self.shared.decode_sem.signal();
        }
    }

    /// Stop playback and perform a full reset: cancel active decoders and
    /// clear the queue.
    pub fn stop(&self) {
        self.shared.flags.clear(IS_PLAYING);
        self.clear_queue();
        self.cancel_active_decoders(true);
        debug!("Playback stopped");
    }

    /// True while the play flag is set.
    pub fn is_playing(&self) -> bool {
        self.shared.flags.is_playing()
    }

    // -- seeking -----------------------------------------------------------

    /// Seek the current decoder to an absolute frame.
    ///
    /// Buffered-but-unplayed audio for the current decoder is discarded and
    /// decoding resumes from the new position.
    pub fn seek_to_frame(&self, frame: u64) -> Result<()> {
        let state = self.current_state_required()?;
        self.request_seek(&state, frame)
    }

    /// Seek the current decoder to an absolute time.
    pub fn seek_to_time(&self, time: Duration) -> Result<()> {
        let state = self.current_state_required()?;
        let frame = self.shared.format.duration_to_frames(time);
        self.request_seek(&state, frame)
    }

    /// Seek the current decoder to a relative position in `[0.0, 1.0]`.
    ///
    /// Fails when the decoder does not report a total length.
    pub fn seek_to_position(&self, position: f64) -> Result<()> {
        let state = self.current_state_required()?;
        let total = state
            .total_frames
            .ok_or_else(|| Error::Seek("decoder does not report a length".to_string()))?;
        let frame = (total as f64 * position.clamp(0.0, 1.0)) as u64;
        self.request_seek(&state, frame)
    }

    /// Seek forward by `seconds` from the current position.
    pub fn seek_forward(&self, seconds: f64) -> Result<()> {
        self.seek_relative(seconds)
    }

    /// Seek backward by `seconds` from the current position.
    pub fn seek_backward(&self, seconds: f64) -> Result<()> {
        self.seek_relative(-seconds)
    }

    fn seek_relative(&self, seconds: f64) -> Result<()> {
        let state = self.current_state_required()?;
        let rate = self.shared.format.sample_rate as f64;
        let current = state.frames_rendered() as f64;
        let target = (current + seconds * rate).max(0.0) as u64;
        self.request_seek(&state, target)
    }

    fn request_seek(&self, state: &Arc<DecoderState>, frame: u64) -> Result<()> {
        if !state.with_decoder(|d| d.supports_seeking()) {
            return Err(Error::Seek(format!(
                "{} does not support seeking",
                state.description()
            )));
        }
        state.request_seek(frame);
        self.shared.decode_sem.signal();
        Ok(())
    }

    // -- queries -----------------------------------------------------------

    /// Handle to the decoder currently being rendered, if any.
    pub fn current_decoder(&self) -> Option<DecoderHandle> {
        self.current_state().map(DecoderHandle::new)
    }

    /// Frame-accurate playback position of the current decoder, or `None`
    /// when no decoder is current.
    pub fn playback_position(&self) -> Option<PlaybackPosition> {
        self.current_state().map(|state| PlaybackPosition {
            frame: state.frames_rendered(),
            total_frames: state.total_frames,
        })
    }

    /// Playback position of the current decoder as time, or `None` when no
    /// decoder is current.
    pub fn playback_time(&self) -> Option<PlaybackTime> {
        self.current_state().map(|state| {
            let format = state.format;
            PlaybackTime {
                current: format.frames_to_duration(state.frames_rendered()),
                total: state.total_frames.map(|n| format.frames_to_duration(n)),
            }
        })
    }

    /// True when `format` matches the node's fixed rendering format.
    pub fn supports_format(&self, format: AudioFormat) -> bool {
        format == self.shared.format
    }

    /// The node's fixed rendering format.
    pub fn format(&self) -> AudioFormat {
        self.shared.format
    }

    // -- observers ---------------------------------------------------------

    /// Register an observer. Callbacks run on the event thread.
    pub fn add_observer(&self, observer: Arc<dyn NodeObserver>) {
        self.shared.observers.write().push(observer);
    }

    /// Remove all observers.
    pub fn clear_observers(&self) {
        self.shared.observers.write().clear();
    }

    // -- internals ---------------------------------------------------------

    fn current_state(&self) -> Option<Arc<DecoderState>> {
        self.shared.active.lock().first_rendering_incomplete()
    }

    fn current_state_required(&self) -> Result<Arc<DecoderState>> {
        self.current_state()
            .ok_or_else(|| Error::InvalidState("no decoder is current".to_string()))
    }
}

impl Drop for PlayerNode {
    fn drop(&mut self) {
        self.shared.flags.set(STOP_DECODING);
        self.shared.decode_sem.signal();
        if let Some(handle) = self.decode_thread.take() {
            let _ = handle.join();
        }

        self.shared.flags.set(STOP_EVENTS);
        self.shared.event_sem.signal();
        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }

        debug!("Player node dropped");
    }
}
