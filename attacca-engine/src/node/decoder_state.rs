//! Per-decoder bookkeeping
//!
//! A `DecoderState` is created when a decoder is dequeued and begins
//! decoding, and is the unit the decode loop and render callback coordinate
//! over. All cross-thread fields are atomics; the decoder object itself is
//! only ever touched by non-realtime threads through its mutex.
//!
//! States live in an `ActiveDecoders` vector ordered by sequence number.
//! The lowest-sequence state that has not finished rendering is "current"
//! for position queries and the render callback's data/silence decision.
//! A state is removed (retired) only while the vector's lock is held and
//! only after it can no longer be reached from the render path; the render
//! callback's cached pointer stays valid regardless because states are
//! Arc-backed.

use crate::decoder::Decoder;
use attacca_common::AudioFormat;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Decoding reached end of stream (or a seek cleared it again).
const DECODING_COMPLETE: u32 = 1 << 0;
/// The render callback has rendered at least one frame of this decoder.
const RENDERING_STARTED: u32 = 1 << 1;
/// The render callback has rendered the last frame of this decoder.
const RENDERING_COMPLETE: u32 = 1 << 2;
/// Cooperative cancellation requested; observed at chunk boundaries.
const CANCELED: u32 = 1 << 3;
/// The cancellation event has been posted (guards against duplicates).
const CANCEL_EVENT_POSTED: u32 = 1 << 4;

/// Sentinel for "no seek pending".
const NO_SEEK: u64 = u64::MAX;

/// Bookkeeping for one enqueued-and-activated decoder.
pub(crate) struct DecoderState {
    /// Position in the total order of all decoders ever activated.
    pub sequence: u64,

    /// The decoder object. Locked only by non-realtime threads.
    decoder: Mutex<Box<dyn Decoder>>,

    /// Processing format, fixed at open.
    pub format: AudioFormat,

    /// Total frame count reported by the container, if any.
    pub total_frames: Option<u64>,

    /// Frames decoded into the ring buffer (absolute decoder position).
    frames_decoded: AtomicU64,

    /// Frames rendered to the output (absolute decoder position).
    frames_rendered: AtomicU64,

    /// Ring coordinate at which this decoder's audio begins.
    ring_origin: AtomicU64,

    /// Value of `frames_decoded` when `ring_origin` was established.
    /// `ring_origin + (frames_decoded - decode_base)` is the ring coordinate
    /// one past this decoder's last decoded frame.
    decode_base: AtomicU64,

    /// Pending seek target, `NO_SEEK` when none.
    frame_to_seek: AtomicU64,

    /// Lifecycle flags, fetch_or/fetch_and only.
    flags: AtomicU32,
}

impl DecoderState {
    pub fn new(
        sequence: u64,
        decoder: Box<dyn Decoder>,
        format: AudioFormat,
        total_frames: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sequence,
            decoder: Mutex::new(decoder),
            format,
            total_frames,
            frames_decoded: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            ring_origin: AtomicU64::new(0),
            decode_base: AtomicU64::new(0),
            frame_to_seek: AtomicU64::new(NO_SEEK),
            flags: AtomicU32::new(0),
        })
    }

    /// Run `f` with the decoder object locked.
    pub fn with_decoder<R>(&self, f: impl FnOnce(&mut dyn Decoder) -> R) -> R {
        let mut decoder = self.decoder.lock();
        f(decoder.as_mut())
    }

    pub fn description(&self) -> String {
        self.with_decoder(|d| d.description())
    }

    // -- frame counters ----------------------------------------------------

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Acquire)
    }

    pub fn add_frames_decoded(&self, frames: u64) {
        self.frames_decoded.fetch_add(frames, Ordering::AcqRel);
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    pub fn add_frames_rendered(&self, frames: u64) {
        self.frames_rendered.fetch_add(frames, Ordering::AcqRel);
    }

    // -- ring coordinates --------------------------------------------------

    /// Establish where this decoder's audio begins in ring coordinates.
    ///
    /// Called at activation and again after a serviced seek, always from the
    /// decode thread with the render side quiescent or not yet aware of the
    /// state.
    pub fn set_ring_span(&self, ring_origin: u64, decoder_position: u64) {
        self.decode_base.store(decoder_position, Ordering::Relaxed);
        self.frames_decoded.store(decoder_position, Ordering::Relaxed);
        self.frames_rendered.store(decoder_position, Ordering::Relaxed);
        self.ring_origin.store(ring_origin, Ordering::Release);
    }

    pub fn ring_origin(&self) -> u64 {
        self.ring_origin.load(Ordering::Acquire)
    }

    /// Ring coordinate one past this decoder's final frame, known only once
    /// decoding is complete.
    pub fn ring_end(&self) -> Option<u64> {
        if !self.is_decoding_complete() {
            return None;
        }
        let origin = self.ring_origin.load(Ordering::Acquire);
        let decoded = self.frames_decoded.load(Ordering::Acquire);
        let base = self.decode_base.load(Ordering::Relaxed);
        Some(origin + (decoded - base))
    }

    // -- seek requests -----------------------------------------------------

    pub fn request_seek(&self, frame: u64) {
        self.frame_to_seek.store(frame.min(NO_SEEK - 1), Ordering::Release);
    }

    /// Take the pending seek target, if any.
    pub fn take_seek_request(&self) -> Option<u64> {
        let frame = self.frame_to_seek.swap(NO_SEEK, Ordering::AcqRel);
        (frame != NO_SEEK).then_some(frame)
    }

    pub fn has_seek_request(&self) -> bool {
        self.frame_to_seek.load(Ordering::Acquire) != NO_SEEK
    }

    // -- lifecycle flags ---------------------------------------------------

    fn set_flag(&self, bit: u32) -> bool {
        self.flags.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Returns true on the first call (transition edge).
    pub fn mark_decoding_complete(&self) -> bool {
        self.set_flag(DECODING_COMPLETE)
    }

    /// A seek after end of stream resumes decoding.
    pub fn clear_decoding_complete(&self) {
        self.flags.fetch_and(!DECODING_COMPLETE, Ordering::AcqRel);
    }

    pub fn is_decoding_complete(&self) -> bool {
        self.flags.load(Ordering::Acquire) & DECODING_COMPLETE != 0
    }

    pub fn mark_rendering_started(&self) -> bool {
        self.set_flag(RENDERING_STARTED)
    }

    pub fn has_rendering_started(&self) -> bool {
        self.flags.load(Ordering::Acquire) & RENDERING_STARTED != 0
    }

    pub fn mark_rendering_complete(&self) -> bool {
        self.set_flag(RENDERING_COMPLETE)
    }

    pub fn is_rendering_complete(&self) -> bool {
        self.flags.load(Ordering::Acquire) & RENDERING_COMPLETE != 0
    }

    /// Returns true on the first call; later calls are the idempotent no-op
    /// the cancellation contract requires.
    pub fn cancel(&self) -> bool {
        self.set_flag(CANCELED)
    }

    pub fn is_canceled(&self) -> bool {
        self.flags.load(Ordering::Acquire) & CANCELED != 0
    }

    /// Claim the right to post this state's cancellation event.
    pub fn claim_cancel_event(&self) -> bool {
        self.set_flag(CANCEL_EVENT_POSTED)
    }

    /// True when the state can be removed from the active vector.
    pub fn is_finished(&self) -> bool {
        let flags = self.flags.load(Ordering::Acquire);
        if flags & CANCELED != 0 {
            // Canceled states linger until their event is on the wire.
            flags & CANCEL_EVENT_POSTED != 0
        } else {
            flags & DECODING_COMPLETE != 0 && flags & RENDERING_COMPLETE != 0
        }
    }

    /// Still eligible for decode or render work.
    fn is_live(&self) -> bool {
        !self.is_canceled()
    }
}

impl std::fmt::Debug for DecoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderState")
            .field("sequence", &self.sequence)
            .field("format", &self.format)
            .field("frames_decoded", &self.frames_decoded())
            .field("frames_rendered", &self.frames_rendered())
            .field("decoding_complete", &self.is_decoding_complete())
            .field("rendering_complete", &self.is_rendering_complete())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// The sequence-ordered vector of decoder states currently decoding or
/// rendering. Guarded by one low-contention mutex in the node; the render
/// callback only ever try-locks it.
#[derive(Default)]
pub(crate) struct ActiveDecoders {
    states: Vec<Arc<DecoderState>>,
}

impl ActiveDecoders {
    pub fn push(&mut self, state: Arc<DecoderState>) {
        debug_assert!(
            self.states.last().map_or(true, |s| s.sequence < state.sequence),
            "sequence numbers must strictly increase"
        );
        self.states.push(state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DecoderState>> {
        self.states.iter()
    }

    /// Lowest-sequence live state still being decoded.
    pub fn first_decoding_incomplete(&self) -> Option<Arc<DecoderState>> {
        self.states
            .iter()
            .find(|s| s.is_live() && !s.is_decoding_complete())
            .cloned()
    }

    /// Lowest-sequence live state still being rendered ("current").
    pub fn first_rendering_incomplete(&self) -> Option<Arc<DecoderState>> {
        self.states
            .iter()
            .find(|s| s.is_live() && !s.is_rendering_complete())
            .cloned()
    }

    /// Lowest-sequence live state after `sequence` still being rendered.
    /// Used by the render callback for gapless handoff.
    pub fn following_rendering_incomplete(&self, sequence: u64) -> Option<Arc<DecoderState>> {
        self.states
            .iter()
            .find(|s| s.sequence > sequence && s.is_live() && !s.is_rendering_complete())
            .cloned()
    }

    /// Mark every unfinished state canceled. Returns the number of states
    /// newly canceled.
    pub fn cancel_all(&self) -> usize {
        self.states
            .iter()
            .filter(|s| !s.is_finished() && s.cancel())
            .count()
    }

    /// Mark only the current (rendering) state canceled.
    pub fn cancel_current(&self) -> bool {
        self.first_rendering_incomplete()
            .map_or(false, |s| s.cancel())
    }

    /// Remove finished states. Caller must hold the vector's lock; never
    /// called from the render callback.
    pub fn retire_finished(&mut self) -> usize {
        let before = self.states.len();
        self.states.retain(|s| !s.is_finished());
        before - self.states.len()
    }
}

/// Public, clonable handle to an active decoder's bookkeeping.
///
/// Handed to observers; keeps the underlying state (and decoder object)
/// alive independent of retirement.
#[derive(Clone)]
pub struct DecoderHandle {
    state: Arc<DecoderState>,
}

impl DecoderHandle {
    pub(crate) fn new(state: Arc<DecoderState>) -> Self {
        Self { state }
    }

    /// Activation sequence number, unique and increasing per node.
    pub fn sequence(&self) -> u64 {
        self.state.sequence
    }

    /// The decoder's processing format.
    pub fn format(&self) -> AudioFormat {
        self.state.format
    }

    /// Frames decoded so far (absolute decoder position).
    pub fn frames_decoded(&self) -> u64 {
        self.state.frames_decoded()
    }

    /// Frames rendered so far (absolute decoder position).
    pub fn frames_rendered(&self) -> u64 {
        self.state.frames_rendered()
    }

    /// Total frames, when the container reports a length.
    pub fn total_frames(&self) -> Option<u64> {
        self.state.total_frames
    }

    pub fn is_canceled(&self) -> bool {
        self.state.is_canceled()
    }

    pub fn is_decoding_complete(&self) -> bool {
        self.state.is_decoding_complete()
    }

    pub fn is_rendering_complete(&self) -> bool {
        self.state.is_rendering_complete()
    }

    /// Human-readable decoder description (locks the decoder briefly).
    pub fn description(&self) -> String {
        self.state.description()
    }
}

impl std::fmt::Debug for DecoderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderHandle")
            .field("sequence", &self.sequence())
            .field("format", &self.format())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleBuffer;
    use crate::error::Result;

    struct NullDecoder;

    impl Decoder for NullDecoder {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        fn processing_format(&self) -> AudioFormat {
            AudioFormat::stereo_44100()
        }
        fn decode_into(&mut self, _: &mut SampleBuffer, _: usize) -> Result<usize> {
            Ok(0)
        }
        fn supports_seeking(&self) -> bool {
            false
        }
        fn seek_to_frame(&mut self, _: u64) -> Result<()> {
            Ok(())
        }
        fn total_frames(&self) -> Option<u64> {
            None
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn description(&self) -> String {
            "null".into()
        }
    }

    fn state(sequence: u64) -> Arc<DecoderState> {
        DecoderState::new(
            sequence,
            Box::new(NullDecoder),
            AudioFormat::stereo_44100(),
            None,
        )
    }

    #[test]
    fn flag_transitions_fire_once() {
        let s = state(0);
        assert!(s.mark_decoding_complete());
        assert!(!s.mark_decoding_complete());
        assert!(s.mark_rendering_complete());
        assert!(!s.mark_rendering_complete());
    }

    #[test]
    fn cancel_is_idempotent() {
        let s = state(0);
        assert!(s.cancel());
        assert!(!s.cancel());
        assert!(s.claim_cancel_event());
        assert!(!s.claim_cancel_event());
    }

    #[test]
    fn finished_requires_both_completions_or_handled_cancel() {
        let s = state(0);
        assert!(!s.is_finished());
        s.mark_decoding_complete();
        assert!(!s.is_finished());
        s.mark_rendering_complete();
        assert!(s.is_finished());

        let c = state(1);
        c.cancel();
        assert!(!c.is_finished());
        c.claim_cancel_event();
        assert!(c.is_finished());
    }

    #[test]
    fn ring_end_known_only_after_decode_complete() {
        let s = state(0);
        s.set_ring_span(100, 0);
        s.add_frames_decoded(250);
        assert_eq!(s.ring_end(), None);
        s.mark_decoding_complete();
        assert_eq!(s.ring_end(), Some(350));
    }

    #[test]
    fn set_ring_span_rebases_counters() {
        let s = state(0);
        s.add_frames_decoded(500);
        s.set_ring_span(1_000, 200);
        assert_eq!(s.frames_decoded(), 200);
        assert_eq!(s.frames_rendered(), 200);
        s.add_frames_decoded(50);
        s.mark_decoding_complete();
        assert_eq!(s.ring_end(), Some(1_050));
    }

    #[test]
    fn seek_request_take_semantics() {
        let s = state(0);
        assert_eq!(s.take_seek_request(), None);
        s.request_seek(44_100);
        assert!(s.has_seek_request());
        assert_eq!(s.take_seek_request(), Some(44_100));
        assert_eq!(s.take_seek_request(), None);
    }

    #[test]
    fn selectors_respect_sequence_order() {
        let mut active = ActiveDecoders::default();
        let a = state(0);
        let b = state(1);
        let c = state(2);
        active.push(Arc::clone(&a));
        active.push(Arc::clone(&b));
        active.push(Arc::clone(&c));

        assert_eq!(active.first_decoding_incomplete().unwrap().sequence, 0);
        assert_eq!(active.first_rendering_incomplete().unwrap().sequence, 0);

        a.mark_decoding_complete();
        assert_eq!(active.first_decoding_incomplete().unwrap().sequence, 1);

        a.mark_rendering_complete();
        assert_eq!(active.first_rendering_incomplete().unwrap().sequence, 1);
        assert_eq!(
            active.following_rendering_incomplete(1).unwrap().sequence,
            2
        );
        assert!(active.following_rendering_incomplete(2).is_none());
    }

    #[test]
    fn canceled_states_skipped_by_selectors() {
        let mut active = ActiveDecoders::default();
        let a = state(0);
        let b = state(1);
        active.push(Arc::clone(&a));
        active.push(Arc::clone(&b));

        a.cancel();
        assert_eq!(active.first_decoding_incomplete().unwrap().sequence, 1);
        assert_eq!(active.first_rendering_incomplete().unwrap().sequence, 1);
    }

    #[test]
    fn retire_removes_only_finished() {
        let mut active = ActiveDecoders::default();
        let a = state(0);
        let b = state(1);
        active.push(Arc::clone(&a));
        active.push(Arc::clone(&b));

        a.mark_decoding_complete();
        a.mark_rendering_complete();
        assert_eq!(active.retire_finished(), 1);
        assert_eq!(active.len(), 1);

        b.cancel();
        assert_eq!(active.retire_finished(), 0);
        b.claim_cancel_event();
        assert_eq!(active.retire_finished(), 1);
        assert!(active.is_empty());
    }

    #[test]
    fn cancel_all_counts_new_cancellations() {
        let mut active = ActiveDecoders::default();
        let a = state(0);
        let b = state(1);
        active.push(Arc::clone(&a));
        active.push(Arc::clone(&b));

        a.cancel();
        assert_eq!(active.cancel_all(), 1);
        assert_eq!(active.cancel_all(), 0);
    }
}
