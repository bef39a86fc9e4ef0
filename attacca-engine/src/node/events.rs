//! Event sequencing
//!
//! Lifecycle notifications are produced on the decoding thread and on the
//! realtime render callback, each into its own lock-free SPSC queue. Every
//! record carries an identification number drawn from one process-wide
//! monotonic counter, regardless of which queue it lands in; the event
//! thread merges the two queues by dispatching whichever head has the
//! smaller id first. That reproduces the exact causal order the producers
//! emitted in, without either producer ever blocking.
//!
//! Observer callbacks run on the event thread only, never on the decode or
//! render thread.

use crate::error::Error;
use crate::node::decoder_state::{DecoderHandle, DecoderState};
use crate::node::sync::Semaphore;
use crate::node::NodeShared;
use attacca_common::HostTicks;
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Identification numbers shared by every queue in the process, so events
/// from physically separate queues interleave into one total order.
static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(0);

fn next_event_id() -> u64 {
    NEXT_EVENT_ID.fetch_add(1, Ordering::SeqCst)
}

/// Spare slots used when a queue is momentarily full; preallocated so the
/// render producer never allocates.
const OVERFLOW_SLOTS: usize = 8;

/// Lifecycle events flowing to the event thread.
#[derive(Debug, Clone)]
pub(crate) enum NodeEvent {
    DecodingStarted {
        state: Arc<DecoderState>,
    },
    DecodingComplete {
        state: Arc<DecoderState>,
    },
    DecoderCanceled {
        state: Arc<DecoderState>,
        frames_rendered: u64,
    },
    EncounteredError {
        error: Arc<Error>,
    },
    RenderingWillStart {
        state: Arc<DecoderState>,
        host_time: HostTicks,
    },
    RenderingStarted {
        state: Arc<DecoderState>,
    },
    RenderingDecoderWillChange {
        from: Arc<DecoderState>,
        to: Arc<DecoderState>,
        host_time: HostTicks,
    },
    RenderingWillComplete {
        state: Arc<DecoderState>,
        host_time: HostTicks,
    },
    RenderingComplete {
        state: Arc<DecoderState>,
    },
}

/// One record in an event queue.
#[derive(Debug)]
pub(crate) struct EventRecord {
    pub id: u64,
    pub event: NodeEvent,
}

/// Create one SPSC event queue of the given capacity.
pub(crate) fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (producer, consumer) = HeapRb::<EventRecord>::new(capacity).split();
    (
        EventSender {
            producer,
            overflow: Vec::with_capacity(OVERFLOW_SLOTS),
            dropped: 0,
        },
        EventReceiver { consumer },
    )
}

/// Producer half of an event queue, owned by exactly one thread.
pub(crate) struct EventSender {
    producer: HeapProd<EventRecord>,
    /// FIFO holding records that did not fit; retried on every post/pump.
    overflow: Vec<EventRecord>,
    dropped: u64,
}

impl EventSender {
    /// Assign the next identification number, enqueue, and wake the event
    /// thread. Realtime-safe: no allocation past the preallocated overflow,
    /// no blocking.
    pub fn post(&mut self, event: NodeEvent, sem: &Semaphore) {
        let record = EventRecord {
            id: next_event_id(),
            event,
        };
        self.pump();
        if self.overflow.is_empty() {
            if let Err(record) = self.producer.try_push(record) {
                self.stash(record);
            }
        } else {
            // Keep id order: earlier records leave first.
            self.stash(record);
        }
        sem.signal();
    }

    /// Retry parked records. Cheap when the overflow is empty.
    pub fn pump(&mut self) {
        while !self.overflow.is_empty() {
            let record = self.overflow.remove(0);
            if let Err(record) = self.producer.try_push(record) {
                self.overflow.insert(0, record);
                break;
            }
        }
    }

    fn stash(&mut self, record: EventRecord) {
        if self.overflow.len() == OVERFLOW_SLOTS {
            // Both the queue and the spare slots are full; drop the oldest.
            self.overflow.remove(0);
            self.dropped += 1;
        }
        self.overflow.push(record);
    }

    /// Records lost to sustained queue overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Consumer half of an event queue, owned by the event thread.
pub(crate) struct EventReceiver {
    consumer: HeapCons<EventRecord>,
}

impl EventReceiver {
    pub fn pop(&mut self) -> Option<EventRecord> {
        self.consumer.try_pop()
    }
}

/// Pick the next record across both queues in identification-number order.
///
/// `staged_*` hold records popped but not yet dispatched, surviving across
/// calls so a record is never reordered behind its queue-mate.
pub(crate) fn next_in_order(
    staged_decode: &mut Option<EventRecord>,
    staged_render: &mut Option<EventRecord>,
    decode_rx: &mut EventReceiver,
    render_rx: &mut EventReceiver,
) -> Option<EventRecord> {
    if staged_decode.is_none() {
        *staged_decode = decode_rx.pop();
    }
    if staged_render.is_none() {
        *staged_render = render_rx.pop();
    }
    match (&*staged_decode, &*staged_render) {
        (Some(d), Some(r)) => {
            if d.id < r.id {
                staged_decode.take()
            } else {
                staged_render.take()
            }
        }
        (Some(_), None) => staged_decode.take(),
        (None, Some(_)) => staged_render.take(),
        (None, None) => None,
    }
}

/// Observer of node lifecycle events.
///
/// All methods have empty defaults; implement only what you need. Every
/// callback runs on the node's event thread.
#[allow(unused_variables)]
pub trait NodeObserver: Send + Sync {
    /// A decoder has been activated and decoding has begun.
    fn decoding_started(&self, decoder: &DecoderHandle) {}

    /// The decoder reached end of stream; rendering may still be under way.
    fn decoding_complete(&self, decoder: &DecoderHandle) {}

    /// The decoder was canceled after rendering `frames_rendered` frames
    /// (zero when rendering never started).
    fn decoder_canceled(&self, decoder: &DecoderHandle, frames_rendered: u64) {}

    /// The first frame of this decoder will reach the output at `host_time`.
    fn rendering_will_start(&self, decoder: &DecoderHandle, host_time: HostTicks) {}

    /// The first frame of this decoder has been rendered.
    fn rendering_started(&self, decoder: &DecoderHandle) {}

    /// Gapless transition: `from`'s last frame is followed by `to`'s first
    /// frame at `host_time`.
    fn rendering_decoder_will_change(
        &self,
        from: &DecoderHandle,
        to: &DecoderHandle,
        host_time: HostTicks,
    ) {
    }

    /// The final frame of this decoder will reach the output at `host_time`.
    fn rendering_will_complete(&self, decoder: &DecoderHandle, host_time: HostTicks) {}

    /// The final frame of this decoder has been rendered.
    fn rendering_complete(&self, decoder: &DecoderHandle) {}

    /// An asynchronous failure occurred (decode errors and the like).
    fn encountered_error(&self, error: &Error) {}
}

/// Event thread main loop: wait for either producer to signal, dispatch
/// everything available in id order, retire finished decoder states, sleep.
pub(crate) fn event_thread_loop(
    shared: Arc<NodeShared>,
    mut decode_rx: EventReceiver,
    mut render_rx: EventReceiver,
) {
    trace!("Event thread started");
    let mut staged_decode: Option<EventRecord> = None;
    let mut staged_render: Option<EventRecord> = None;

    loop {
        while let Some(record) =
            next_in_order(&mut staged_decode, &mut staged_render, &mut decode_rx, &mut render_rx)
        {
            dispatch(&shared, record);
        }

        shared.retire_finished();

        if shared.flags.stop_events() {
            break;
        }

        // The timeout bounds shutdown latency if a signal is missed.
        shared.event_sem.wait_timeout(Duration::from_millis(250));
    }

    trace!("Event thread exiting");
}

fn dispatch(shared: &Arc<NodeShared>, record: EventRecord) {
    trace!("Dispatching event #{}: {:?}", record.id, record.event);
    let observers = shared.observers.read().clone();
    if observers.is_empty() {
        return;
    }

    match record.event {
        NodeEvent::DecodingStarted { state } => {
            let handle = DecoderHandle::new(state);
            for obs in &observers {
                obs.decoding_started(&handle);
            }
        }
        NodeEvent::DecodingComplete { state } => {
            let handle = DecoderHandle::new(state);
            for obs in &observers {
                obs.decoding_complete(&handle);
            }
        }
        NodeEvent::DecoderCanceled {
            state,
            frames_rendered,
        } => {
            let handle = DecoderHandle::new(state);
            for obs in &observers {
                obs.decoder_canceled(&handle, frames_rendered);
            }
        }
        NodeEvent::EncounteredError { error } => {
            warn!("Playback error surfaced to observers: {}", error);
            for obs in &observers {
                obs.encountered_error(&error);
            }
        }
        NodeEvent::RenderingWillStart { state, host_time } => {
            let handle = DecoderHandle::new(state);
            for obs in &observers {
                obs.rendering_will_start(&handle, host_time);
            }
        }
        NodeEvent::RenderingStarted { state } => {
            let handle = DecoderHandle::new(state);
            for obs in &observers {
                obs.rendering_started(&handle);
            }
        }
        NodeEvent::RenderingDecoderWillChange {
            from,
            to,
            host_time,
        } => {
            let from = DecoderHandle::new(from);
            let to = DecoderHandle::new(to);
            for obs in &observers {
                obs.rendering_decoder_will_change(&from, &to, host_time);
            }
        }
        NodeEvent::RenderingWillComplete { state, host_time } => {
            let handle = DecoderHandle::new(state);
            for obs in &observers {
                obs.rendering_will_complete(&handle, host_time);
            }
        }
        NodeEvent::RenderingComplete { state } => {
            let handle = DecoderHandle::new(state);
            for obs in &observers {
                obs.rendering_complete(&handle);
            }
        }
    }
}
