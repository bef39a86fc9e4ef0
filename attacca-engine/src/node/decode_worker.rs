//! Decoding thread
//!
//! The non-realtime worker that turns queued decoders into ring-buffer
//! resident PCM. Parks on the decode semaphore when there is nothing to do
//! (no work, or the ring is full) and is signaled by enqueue operations, by
//! the render callback when it frees ring space, and by shutdown.
//!
//! Destructive ring operations (seek, cancellation) go through the mute
//! handshake: request mute, wait for the render callback itself to
//! acknowledge by setting IS_MUTED at a callback boundary, then flush. The
//! wait is bounded so a stalled or absent host callback cannot deadlock the
//! engine; if callbacks are not running the reader is idle anyway.

use crate::buffer::SampleBuffer;
use crate::node::decoder_state::DecoderState;
use crate::node::events::{EventSender, NodeEvent};
use crate::node::flags::{IS_MUTED, MUTE_REQUESTED, RING_NEEDS_FLUSH, UNMUTE_AFTER_DEQUEUE};
use crate::node::ring_buffer::RingWriter;
use crate::node::NodeShared;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Upper bound on waiting for the render callback to acknowledge a mute
/// request before proceeding with a flush.
const MUTE_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Decoding thread main loop.
pub(crate) fn decode_thread_loop(
    shared: Arc<NodeShared>,
    mut writer: RingWriter,
    mut events: EventSender,
) {
    debug!("Decoding thread started");
    let chunk_frames = shared.config.decode_chunk_frames;
    let mut scratch = SampleBuffer::with_capacity(shared.format.channel_count, chunk_frames);

    loop {
        if shared.flags.stop_decoding() {
            break;
        }

        service_cancellations(&shared, &mut writer, &mut events);

        // Seeks take priority over decode progress; the target may be a
        // decoder that already reached end of stream.
        if let Some(state) = find_pending_seek(&shared) {
            if let Some(target) = state.take_seek_request() {
                service_seek(&shared, &state, target, &mut writer, &mut events);
            }
            continue;
        }

        let state = match { shared.active.lock().first_decoding_incomplete() } {
            Some(state) => state,
            None => match activate_next(&shared, &mut writer, &mut events) {
                Some(state) => state,
                None => {
                    shared.decode_sem.wait();
                    continue;
                }
            },
        };

        if state.is_canceled() {
            continue;
        }

        let free = writer.free_frames();
        if free == 0 {
            // Full ring: wait until the render callback frees space.
            shared.decode_sem.wait();
            continue;
        }

        let want = chunk_frames.min(free);
        match state.with_decoder(|d| d.decode_into(&mut scratch, want)) {
            Ok(0) => {
                if state.mark_decoding_complete() {
                    debug!(
                        "Decoding complete: seq={}, {} frames",
                        state.sequence,
                        state.frames_decoded()
                    );
                    events.post(
                        NodeEvent::DecodingComplete {
                            state: Arc::clone(&state),
                        },
                        &shared.event_sem,
                    );
                }
            }
            Ok(frames) => {
                let written = writer.write(&scratch, frames);
                debug_assert_eq!(written, frames, "chunk exceeds reserved ring space");
                state.add_frames_decoded(written as u64);
                trace!(
                    "Decoded chunk: seq={}, {} frames (total {})",
                    state.sequence,
                    written,
                    state.frames_decoded()
                );
            }
            Err(error) => {
                // A failing decoder cancels only itself; the queue continues.
                warn!(
                    "Decode error from {}: {}",
                    state.description(),
                    error
                );
                state.cancel();
                events.post(
                    NodeEvent::EncounteredError {
                        error: Arc::new(error),
                    },
                    &shared.event_sem,
                );
            }
        }
    }

    debug!("Decoding thread exiting");
}

/// Any live state with a seek request pending.
fn find_pending_seek(shared: &Arc<NodeShared>) -> Option<Arc<DecoderState>> {
    shared
        .active
        .lock()
        .iter()
        .find(|s| s.has_seek_request() && !s.is_canceled())
        .cloned()
}

/// Dequeue, open, and activate the next pending decoder.
///
/// Open failures surface as error events and the loop falls through to the
/// next queued decoder.
fn activate_next(
    shared: &Arc<NodeShared>,
    writer: &mut RingWriter,
    events: &mut EventSender,
) -> Option<Arc<DecoderState>> {
    loop {
        let pending = match shared.pending.lock().pop_front() {
            Some(pending) => pending,
            None => {
                // An emptied queue cannot deliver the dequeue that a silent
                // reset was waiting on; do not stay muted forever.
                if shared.flags.test(UNMUTE_AFTER_DEQUEUE) {
                    shared
                        .flags
                        .clear(UNMUTE_AFTER_DEQUEUE | MUTE_REQUESTED | IS_MUTED);
                }
                return None;
            }
        };
        let sequence = pending.sequence;
        let mut decoder = pending.decoder;

        if !decoder.is_open() {
            if let Err(error) = decoder.open() {
                warn!("Failed to open queued decoder: {}", error);
                events.post(
                    NodeEvent::EncounteredError {
                        error: Arc::new(error),
                    },
                    &shared.event_sem,
                );
                continue;
            }
        }

        let format = decoder.processing_format();
        let total_frames = decoder.total_frames();
        let description = decoder.description();
        let state = DecoderState::new(sequence, decoder, format, total_frames);
        state.set_ring_span(writer.frames_written(), 0);

        shared.active.lock().push(Arc::clone(&state));

        // A silent reset-and-enqueue stays muted until its replacement is up.
        if shared.flags.test(UNMUTE_AFTER_DEQUEUE) {
            shared
                .flags
                .clear(UNMUTE_AFTER_DEQUEUE | MUTE_REQUESTED | IS_MUTED);
        }

        debug!(
            "Activated decoder: seq={}, {} ({}, {:?} frames)",
            sequence, description, format, total_frames
        );
        events.post(
            NodeEvent::DecodingStarted {
                state: Arc::clone(&state),
            },
            &shared.event_sem,
        );
        return Some(state);
    }
}

/// Post cancellation events and release decoders for every canceled state
/// that has not been handled yet, discarding their ring-resident audio.
fn service_cancellations(
    shared: &Arc<NodeShared>,
    writer: &mut RingWriter,
    events: &mut EventSender,
) {
    let mut claimed = Vec::new();
    {
        let active = shared.active.lock();
        for state in active.iter() {
            if state.is_canceled() && state.claim_cancel_event() {
                claimed.push(Arc::clone(state));
            }
        }
    }
    if claimed.is_empty() {
        return;
    }

    // Ring contents are stale if any canceled decoder still had audio
    // buffered; discard and rewind the survivors.
    if claimed.iter().any(|s| !s.is_rendering_complete()) {
        mute_for_flush(shared);
        writer.flush_unread();
        rewind_live_states(shared, writer, None);
        unmute_after_flush(shared);
    }

    for state in claimed {
        let frames_rendered = if state.has_rendering_started() {
            state.frames_rendered()
        } else {
            0
        };
        if let Err(error) = state.with_decoder(|d| d.close()) {
            warn!("Error closing canceled decoder: {}", error);
        }
        debug!(
            "Decoder canceled: seq={}, {} frames rendered",
            state.sequence, frames_rendered
        );
        events.post(
            NodeEvent::DecoderCanceled {
                state,
                frames_rendered,
            },
            &shared.event_sem,
        );
    }

    shared.retire_finished();
}

/// Service one seek request on `state`.
fn service_seek(
    shared: &Arc<NodeShared>,
    state: &Arc<DecoderState>,
    target: u64,
    writer: &mut RingWriter,
    events: &mut EventSender,
) {
    if !state.with_decoder(|d| d.supports_seeking()) {
        // The façade validates before requesting; tolerate the race.
        warn!("Seek requested on non-seekable decoder seq={}", state.sequence);
        return;
    }

    let target = match state.total_frames {
        Some(total) if total > 0 => target.min(total - 1),
        _ => target,
    };

    mute_for_flush(shared);
    writer.flush_unread();

    match state.with_decoder(|d| d.seek_to_frame(target)) {
        Ok(()) => {
            // Buffered-but-unplayed audio is gone; decode resumes at the
            // target in fresh ring coordinates.
            state.clear_decoding_complete();
            state.set_ring_span(writer.frames_written(), target);
            debug!("Seek serviced: seq={} -> frame {}", state.sequence, target);
        }
        Err(error) => {
            warn!("Seek failed on seq={}: {}", state.sequence, error);
            state.cancel();
            events.post(
                NodeEvent::EncounteredError {
                    error: Arc::new(error),
                },
                &shared.event_sem,
            );
        }
    }

    // The flush also discarded audio belonging to decoders queued behind
    // this one; rewind them so nothing is lost.
    rewind_live_states(shared, writer, Some(state.sequence));
    unmute_after_flush(shared);
}

/// After a ring flush, reposition every live not-yet-finished state at the
/// last frame actually rendered so its discarded audio is decoded again.
fn rewind_live_states(shared: &Arc<NodeShared>, writer: &mut RingWriter, skip_sequence: Option<u64>) {
    let live: Vec<Arc<DecoderState>> = shared
        .active
        .lock()
        .iter()
        .filter(|s| {
            Some(s.sequence) != skip_sequence && !s.is_canceled() && !s.is_rendering_complete()
        })
        .cloned()
        .collect();

    for state in live {
        let resume = state.frames_rendered();
        if state.frames_decoded() == resume {
            // Nothing of this decoder was in the ring; just rebase it.
            state.set_ring_span(writer.frames_written(), resume);
            continue;
        }
        let result = state.with_decoder(|d| {
            if d.supports_seeking() {
                d.seek_to_frame(resume)
            } else {
                Err(crate::error::Error::Seek(format!(
                    "{} cannot rewind discarded audio",
                    d.description()
                )))
            }
        });
        match result {
            Ok(()) => {
                state.clear_decoding_complete();
                state.set_ring_span(writer.frames_written(), resume);
                trace!("Rewound seq={} to frame {}", state.sequence, resume);
            }
            Err(error) => {
                warn!("Cannot rewind seq={}: {}", state.sequence, error);
                state.cancel();
            }
        }
    }
}

/// Request mute and wait (bounded) for the render callback to acknowledge.
fn mute_for_flush(shared: &Arc<NodeShared>) {
    shared.flags.set(MUTE_REQUESTED | RING_NEEDS_FLUSH);
    if !shared.flags.is_playing() {
        // No reader activity is possible; the flush is already safe.
        return;
    }
    let deadline = Instant::now() + MUTE_ACK_TIMEOUT;
    while !shared.flags.is_muted() && Instant::now() < deadline {
        shared.decode_sem.wait_timeout(Duration::from_millis(5));
    }
    if !shared.flags.is_muted() {
        trace!("Mute acknowledgement timed out; host callback appears idle");
    }
}

/// Clear the mute unless a reset-and-enqueue asked to stay silent until the
/// next activation.
fn unmute_after_flush(shared: &Arc<NodeShared>) {
    if shared.flags.test(UNMUTE_AFTER_DEQUEUE) {
        shared.flags.clear(RING_NEEDS_FLUSH);
    } else {
        shared.flags.clear(MUTE_REQUESTED | IS_MUTED | RING_NEEDS_FLUSH);
    }
}
