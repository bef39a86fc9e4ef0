//! Render callback
//!
//! `RenderContext` is the consumer half of the node, handed to the host
//! audio runtime (the cpal output glue, or a test harness) and invoked on a
//! hard-realtime thread. Every call must supply exactly the requested frame
//! count: ring data when available, digital silence otherwise. The callback
//! never blocks, never allocates, and touches exactly one lock - the
//! decoder-state vector's try_lock, whose failure path falls back to the
//! previous callback's cached state pointer. That fallback is safe because
//! state pointers are Arc-backed and retirement is deferred until after
//! rendering-complete is observed.
//!
//! Boundary accounting runs in ring coordinates: each decoder state records
//! where its audio begins in the monotonic frame-counter space, and once its
//! decoding is complete, where it ends. Comparing the read cursor against
//! those marks detects the exact frame at which one decoder's audio gives
//! way to the next, even mid-callback, and the event timestamps are computed
//! from the callback's host time by frame arithmetic.

use crate::buffer::SampleBuffer;
use crate::node::decoder_state::DecoderState;
use crate::node::events::{EventSender, NodeEvent};
use crate::node::flags::IS_MUTED;
use crate::node::ring_buffer::RingReader;
use crate::node::NodeShared;
use attacca_common::HostTicks;
use std::sync::Arc;

/// Result of one render callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderStatus {
    /// Frames delivered from the ring buffer (the rest of the output, if
    /// any, was filled with silence).
    pub frames_rendered: usize,

    /// True when the output contains only silence.
    pub is_silence: bool,
}

/// The node's realtime rendering half.
pub struct RenderContext {
    shared: Arc<NodeShared>,
    reader: RingReader,
    events: EventSender,
    /// Current decoder state as of the last successful lookup; may be one
    /// callback stale under lock contention.
    cached_current: Option<Arc<DecoderState>>,
}

impl RenderContext {
    pub(crate) fn new(shared: Arc<NodeShared>, reader: RingReader, events: EventSender) -> Self {
        Self {
            shared,
            reader,
            events,
            cached_current: None,
        }
    }

    /// Render `frame_count` frames into `output` (which must have at least
    /// that capacity and the node's channel count).
    ///
    /// `host_time` is the host timestamp at which the first frame of this
    /// buffer reaches the output; boundary events are stamped relative to it.
    pub fn render(
        &mut self,
        output: &mut SampleBuffer,
        frame_count: usize,
        host_time: HostTicks,
    ) -> RenderStatus {
        let frame_count = frame_count.min(output.frame_capacity());
        self.events.pump();

        let flags = &self.shared.flags;

        // Acknowledge a mute request at this callback boundary; from here on
        // this and every following callback stays out of the ring, which is
        // what makes the decode thread's flush safe.
        if flags.mute_requested() && !flags.is_muted() {
            flags.set(IS_MUTED);
        }

        if !flags.is_playing() || flags.is_muted() {
            output.fill_silence(frame_count);
            // Wake the decode thread so a pending handshake can progress.
            self.shared.decode_sem.signal();
            return RenderStatus {
                frames_rendered: 0,
                is_silence: true,
            };
        }

        self.refresh_current();
        let Some(current) = self.cached_current.clone() else {
            output.fill_silence(frame_count);
            return RenderStatus {
                frames_rendered: 0,
                is_silence: true,
            };
        };

        let read_origin = self.reader.frames_read();
        let frames_read = self.reader.read(output, frame_count);
        output.silence_range(frames_read, frame_count);
        output.set_frame_len(frame_count);

        if frames_read > 0 {
            // Space was freed; let the decode thread refill.
            self.shared.decode_sem.signal();
        }

        // Runs even for a starved callback: a fully drained (or zero-length)
        // decoder completes on the boundary check, not on data.
        self.account_frames(current, read_origin, frames_read as u64, host_time);

        RenderStatus {
            frames_rendered: frames_read,
            // Starved (or between decoders): silence, never a wait.
            is_silence: frames_read == 0,
        }
    }

    /// Attribute the frames just rendered to decoder states, crossing
    /// decoder boundaries where the ring coordinates say they fall.
    fn account_frames(
        &mut self,
        mut state: Arc<DecoderState>,
        read_origin: u64,
        frames_read: u64,
        host_time: HostTicks,
    ) {
        let sample_rate = self.shared.format.sample_rate;
        let mut cursor = read_origin;
        let mut remaining = frames_read;

        loop {
            if state.is_canceled() {
                // Canceled audio is flushed by the decode thread; whatever
                // was read in this race is not attributable.
                break;
            }

            // Frames below the state's origin are remnants of a flush race;
            // skip them without attribution.
            let origin = state.ring_origin();
            if cursor < origin {
                let skip = remaining.min(origin - cursor);
                if skip == 0 {
                    break;
                }
                cursor += skip;
                remaining -= skip;
                continue;
            }

            let take = match state.ring_end() {
                Some(end) if end <= cursor => 0,
                Some(end) => remaining.min(end - cursor),
                None => remaining,
            };

            if take > 0 {
                if state.mark_rendering_started() {
                    let start_time = host_time.adding_frames(cursor - read_origin, sample_rate);
                    self.events.post(
                        NodeEvent::RenderingWillStart {
                            state: Arc::clone(&state),
                            host_time: start_time,
                        },
                        &self.shared.event_sem,
                    );
                    self.events.post(
                        NodeEvent::RenderingStarted {
                            state: Arc::clone(&state),
                        },
                        &self.shared.event_sem,
                    );
                }
                state.add_frames_rendered(take);
                cursor += take;
                remaining -= take;
            }

            match state.ring_end() {
                Some(end) if cursor >= end => {
                    // This decoder's final frame has been rendered.
                    let boundary_time = host_time.adding_frames(cursor - read_origin, sample_rate);
                    let first_completion = state.mark_rendering_complete();
                    if first_completion {
                        self.events.post(
                            NodeEvent::RenderingWillComplete {
                                state: Arc::clone(&state),
                                host_time: boundary_time,
                            },
                            &self.shared.event_sem,
                        );
                        self.events.post(
                            NodeEvent::RenderingComplete {
                                state: Arc::clone(&state),
                            },
                            &self.shared.event_sem,
                        );
                    }

                    match self.lookup_following(state.sequence) {
                        Some(next) => {
                            if first_completion {
                                self.events.post(
                                    NodeEvent::RenderingDecoderWillChange {
                                        from: Arc::clone(&state),
                                        to: Arc::clone(&next),
                                        host_time: boundary_time,
                                    },
                                    &self.shared.event_sem,
                                );
                            }
                            self.cached_current = Some(Arc::clone(&next));
                            state = next;
                        }
                        None => {
                            // No successor visible (none exists, or the lock
                            // was contended); retry next callback.
                            self.cached_current = None;
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Non-blocking refresh of the current decoder state.
    fn refresh_current(&mut self) {
        match self.shared.active.try_lock() {
            Some(active) => {
                self.cached_current = active.first_rendering_incomplete();
            }
            None => {
                // Contended: reuse the cached pointer, except when it is
                // visibly finished.
                if let Some(current) = &self.cached_current {
                    if current.is_rendering_complete() || current.is_canceled() {
                        self.cached_current = None;
                    }
                }
            }
        }
    }

    /// Non-blocking successor lookup for gapless handoff.
    fn lookup_following(&self, sequence: u64) -> Option<Arc<DecoderState>> {
        self.shared
            .active
            .try_lock()
            .and_then(|active| active.following_rendering_incomplete(sequence))
    }

    /// The node's fixed rendering format.
    pub fn format(&self) -> attacca_common::AudioFormat {
        self.shared.format
    }
}
