//! Lock-free sample ring buffer for the decode → render handoff
//!
//! Single-producer single-consumer ring of non-interleaved f32 frames with a
//! power-of-two capacity. Ordering is enforced purely through two monotonic
//! frame counters: the writer publishes `frames_written` with Release after
//! copying samples in, the reader observes it with Acquire before copying
//! samples out, and vice versa for `frames_read`. Neither side blocks or
//! allocates after construction.
//!
//! The counters never wrap or reset, so a position in the stream ("ring
//! coordinate") identifies a sample for the whole life of the buffer. The
//! node uses these coordinates to mark where one decoder's audio ends and the
//! next begins, which is what makes frame-accurate gapless handoff possible.
//!
//! Invariant: `frames_read <= frames_written <= frames_read + capacity`.

use crate::buffer::SampleBuffer;
use crate::error::{Error, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared ring storage. Channel data is guarded by the counter protocol:
/// the writer only touches frames in `[frames_written, frames_read + capacity)`
/// and the reader only frames in `[frames_read, frames_written)`, so the two
/// sides never alias the same slot.
struct RingInner {
    channels: Vec<Box<[UnsafeCell<f32>]>>,
    capacity: usize,
    mask: usize,
    frames_written: AtomicU64,
    frames_read: AtomicU64,
}

// Slot access is disjoint under the counter protocol; see RingInner docs.
unsafe impl Send for RingInner {}
unsafe impl Sync for RingInner {}

impl RingInner {
    /// Copy `src` into `channel` starting at ring coordinate `position`,
    /// splitting across the wrap point when needed.
    ///
    /// Safety: caller owns the target region per the counter protocol.
    unsafe fn copy_in(&self, channel: usize, position: u64, src: &[f32]) {
        let storage = &self.channels[channel];
        let start = (position as usize) & self.mask;
        let first = src.len().min(self.capacity - start);
        let dst = storage.as_ptr() as *mut f32;
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(start), first);
        if first < src.len() {
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), dst, src.len() - first);
        }
    }

    /// Copy out of `channel` starting at ring coordinate `position` into `dst`.
    ///
    /// Safety: caller owns the source region per the counter protocol.
    unsafe fn copy_out(&self, channel: usize, position: u64, dst: &mut [f32]) {
        let storage = &self.channels[channel];
        let start = (position as usize) & self.mask;
        let first = dst.len().min(self.capacity - start);
        let src = storage.as_ptr() as *const f32;
        std::ptr::copy_nonoverlapping(src.add(start), dst.as_mut_ptr(), first);
        if first < dst.len() {
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }
}

/// A fixed-capacity planar SPSC audio ring buffer.
///
/// Split into a [`RingWriter`] (decode thread) and [`RingReader`] (render
/// callback) before use.
pub struct SampleRingBuffer {
    inner: Arc<RingInner>,
}

impl SampleRingBuffer {
    /// Allocate storage for `channel_count` channels of `capacity_frames`
    /// frames, rounded up to the next power of two.
    ///
    /// Not realtime-safe. Fails on a zero channel count or capacity.
    pub fn new(channel_count: u16, capacity_frames: usize) -> Result<Self> {
        if channel_count == 0 {
            return Err(Error::Allocation("channel count must be positive".into()));
        }
        if capacity_frames == 0 {
            return Err(Error::Allocation("capacity must be positive".into()));
        }
        let capacity = capacity_frames.next_power_of_two();

        let channels = (0..channel_count)
            .map(|_| {
                (0..capacity)
                    .map(|_| UnsafeCell::new(0.0f32))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect();

        Ok(Self {
            inner: Arc::new(RingInner {
                channels,
                capacity,
                mask: capacity - 1,
                frames_written: AtomicU64::new(0),
                frames_read: AtomicU64::new(0),
            }),
        })
    }

    /// Rounded capacity in frames.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Split into the producer and consumer halves.
    pub fn split(self) -> (RingWriter, RingReader) {
        let writer = RingWriter {
            inner: Arc::clone(&self.inner),
        };
        let reader = RingReader { inner: self.inner };
        (writer, reader)
    }
}

/// Producer half, owned by the decode thread.
pub struct RingWriter {
    inner: Arc<RingInner>,
}

impl RingWriter {
    /// Copy up to `frames` frames from `src` (valid data starting at frame 0)
    /// into the ring. Returns the number of frames actually written, bounded
    /// by free capacity. Never blocks, never allocates.
    pub fn write(&mut self, src: &SampleBuffer, frames: usize) -> usize {
        debug_assert_eq!(src.channel_count() as usize, self.inner.channels.len());
        let w = self.inner.frames_written.load(Ordering::Relaxed);
        let r = self.inner.frames_read.load(Ordering::Acquire);
        let free = self.inner.capacity - (w - r) as usize;
        let n = frames.min(free).min(src.frame_len());
        if n == 0 {
            return 0;
        }

        for ch in 0..self.inner.channels.len() {
            // The region [w, r + capacity) belongs to the writer.
            unsafe { self.inner.copy_in(ch, w, &src.channel(ch)[..n]) };
        }

        // Publish after the copies so the reader never observes stale samples.
        self.inner.frames_written.store(w + n as u64, Ordering::Release);
        n
    }

    /// Frames that can currently be written without overwriting unread data.
    pub fn free_frames(&self) -> usize {
        let w = self.inner.frames_written.load(Ordering::Relaxed);
        let r = self.inner.frames_read.load(Ordering::Acquire);
        self.inner.capacity - (w - r) as usize
    }

    /// Total frames ever written (the write-side ring coordinate).
    pub fn frames_written(&self) -> u64 {
        self.inner.frames_written.load(Ordering::Relaxed)
    }

    /// Discard everything written but not yet read by advancing the read
    /// counter to the write counter.
    ///
    /// Not realtime-safe in the protocol sense: may only be called while the
    /// reader is guaranteed quiescent (muted render or stopped playback), as
    /// it mutates the reader's counter. Ring coordinates remain monotonic.
    pub fn flush_unread(&mut self) {
        let w = self.inner.frames_written.load(Ordering::Relaxed);
        self.inner.frames_read.store(w, Ordering::Release);
    }

    /// Ring capacity in frames.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Consumer half, owned by the render callback.
pub struct RingReader {
    inner: Arc<RingInner>,
}

impl RingReader {
    /// Copy up to `frames` frames into `dst` starting at frame 0, advancing
    /// the read counter. Returns the number of frames actually read, bounded
    /// by available data. Never blocks, never allocates. Does not touch
    /// `dst.frame_len`; the caller decides how much of the buffer is valid.
    pub fn read(&mut self, dst: &mut SampleBuffer, frames: usize) -> usize {
        debug_assert_eq!(dst.channel_count() as usize, self.inner.channels.len());
        let w = self.inner.frames_written.load(Ordering::Acquire);
        let r = self.inner.frames_read.load(Ordering::Relaxed);
        let available = (w - r) as usize;
        let n = frames.min(available).min(dst.frame_capacity());
        if n == 0 {
            return 0;
        }

        for ch in 0..self.inner.channels.len() {
            // The region [r, w) belongs to the reader.
            unsafe { self.inner.copy_out(ch, r, &mut dst.channel_mut(ch)[..n]) };
        }

        // Release the region back to the writer only after the copies.
        self.inner.frames_read.store(r + n as u64, Ordering::Release);
        n
    }

    /// Frames currently available to read.
    pub fn available_frames(&self) -> usize {
        let w = self.inner.frames_written.load(Ordering::Acquire);
        let r = self.inner.frames_read.load(Ordering::Relaxed);
        (w - r) as usize
    }

    /// Total frames ever read (the read-side ring coordinate).
    pub fn frames_read(&self) -> u64 {
        self.inner.frames_read.load(Ordering::Relaxed)
    }

    /// Ring capacity in frames.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(channels: u16, frames: usize, value: f32) -> SampleBuffer {
        let mut buf = SampleBuffer::with_capacity(channels, frames);
        for ch in 0..channels as usize {
            buf.channel_mut(ch)[..frames].fill(value);
        }
        buf.set_frame_len(frames);
        buf
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let ring = SampleRingBuffer::new(2, 1000).unwrap();
        assert_eq!(ring.capacity(), 1024);
        let ring = SampleRingBuffer::new(2, 1024).unwrap();
        assert_eq!(ring.capacity(), 1024);
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(matches!(
            SampleRingBuffer::new(2, 0),
            Err(Error::Allocation(_))
        ));
        assert!(matches!(
            SampleRingBuffer::new(0, 64),
            Err(Error::Allocation(_))
        ));
    }

    #[test]
    fn basic_write_read_round_trip() {
        let (mut writer, mut reader) = SampleRingBuffer::new(2, 64).unwrap().split();

        let mut src = SampleBuffer::with_capacity(2, 8);
        for ch in 0..2 {
            for (i, s) in src.channel_mut(ch)[..8].iter_mut().enumerate() {
                *s = (ch * 100 + i) as f32;
            }
        }
        src.set_frame_len(8);

        assert_eq!(writer.write(&src, 8), 8);
        assert_eq!(reader.available_frames(), 8);

        let mut dst = SampleBuffer::with_capacity(2, 8);
        assert_eq!(reader.read(&mut dst, 8), 8);
        for ch in 0..2 {
            for i in 0..8 {
                assert_eq!(dst.channel(ch)[i], (ch * 100 + i) as f32);
            }
        }
        assert_eq!(reader.available_frames(), 0);
    }

    #[test]
    fn write_bounded_by_free_space() {
        let (mut writer, mut reader) = SampleRingBuffer::new(1, 16).unwrap().split();
        let src = filled(1, 16, 1.0);

        assert_eq!(writer.write(&src, 16), 16);
        assert_eq!(writer.free_frames(), 0);
        assert_eq!(writer.write(&src, 16), 0);

        let mut dst = SampleBuffer::with_capacity(1, 4);
        assert_eq!(reader.read(&mut dst, 4), 4);
        assert_eq!(writer.free_frames(), 4);
        assert_eq!(writer.write(&src, 16), 4);
    }

    #[test]
    fn read_bounded_by_available() {
        let (mut writer, mut reader) = SampleRingBuffer::new(1, 16).unwrap().split();
        let src = filled(1, 3, 0.25);
        writer.write(&src, 3);

        let mut dst = SampleBuffer::with_capacity(1, 8);
        assert_eq!(reader.read(&mut dst, 8), 3);
        assert_eq!(reader.read(&mut dst, 8), 0);
    }

    #[test]
    fn wraparound_preserves_order() {
        let (mut writer, mut reader) = SampleRingBuffer::new(1, 8).unwrap().split();
        let mut dst = SampleBuffer::with_capacity(1, 8);

        // Advance the ring position close to the wrap point.
        let pad = filled(1, 6, 0.0);
        writer.write(&pad, 6);
        reader.read(&mut dst, 6);

        // This write straddles the physical end of the storage.
        let mut src = SampleBuffer::with_capacity(1, 5);
        for (i, s) in src.channel_mut(0)[..5].iter_mut().enumerate() {
            *s = i as f32 + 1.0;
        }
        src.set_frame_len(5);
        assert_eq!(writer.write(&src, 5), 5);

        assert_eq!(reader.read(&mut dst, 5), 5);
        assert_eq!(&dst.channel(0)[..5], &[1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn counters_are_monotonic_coordinates() {
        let (mut writer, mut reader) = SampleRingBuffer::new(1, 8).unwrap().split();
        let src = filled(1, 8, 1.0);
        let mut dst = SampleBuffer::with_capacity(1, 8);

        for round in 1..=5u64 {
            writer.write(&src, 8);
            reader.read(&mut dst, 8);
            assert_eq!(writer.frames_written(), round * 8);
            assert_eq!(reader.frames_read(), round * 8);
        }
    }

    #[test]
    fn flush_unread_discards_pending_audio() {
        let (mut writer, mut reader) = SampleRingBuffer::new(1, 16).unwrap().split();
        let src = filled(1, 10, 0.7);
        writer.write(&src, 10);

        writer.flush_unread();
        assert_eq!(reader.available_frames(), 0);
        assert_eq!(writer.free_frames(), 16);
        // Coordinates stay monotonic: read jumped forward to write.
        assert_eq!(reader.frames_read(), 10);

        // New audio written after the flush is readable as usual.
        let fresh = filled(1, 4, 0.9);
        writer.write(&fresh, 4);
        let mut dst = SampleBuffer::with_capacity(1, 4);
        assert_eq!(reader.read(&mut dst, 4), 4);
        assert_eq!(dst.channel(0)[0], 0.9);
    }

    #[test]
    fn read_never_exceeds_writes() {
        // Property sweep over mixed write/read sizes.
        let (mut writer, mut reader) = SampleRingBuffer::new(1, 32).unwrap().split();
        let mut dst = SampleBuffer::with_capacity(1, 32);
        let mut total_written = 0u64;
        let mut total_read = 0u64;

        for step in 0..200usize {
            let w_frames = (step * 7) % 13;
            let r_frames = (step * 5) % 11;
            let src = filled(1, w_frames.max(1), 0.5);
            total_written += writer.write(&src, w_frames) as u64;
            total_read += reader.read(&mut dst, r_frames) as u64;
            assert!(total_read <= total_written);
            assert_eq!(writer.frames_written(), total_written);
            assert_eq!(reader.frames_read(), total_read);
        }

        // Drain to completion: totals converge.
        while reader.read(&mut dst, 32) > 0 {}
        assert_eq!(reader.frames_read(), writer.frames_written());
    }

    #[test]
    fn concurrent_producer_consumer() {
        use std::thread;

        let (mut writer, mut reader) = SampleRingBuffer::new(1, 64).unwrap().split();
        const TOTAL: usize = 50_000;

        let producer = thread::spawn(move || {
            let mut src = SampleBuffer::with_capacity(1, 16);
            let mut sent = 0usize;
            while sent < TOTAL {
                let n = 16.min(TOTAL - sent);
                for (i, s) in src.channel_mut(0)[..n].iter_mut().enumerate() {
                    *s = (sent + i) as f32;
                }
                src.set_frame_len(n);
                sent += writer.write(&src, n);
            }
        });

        let mut dst = SampleBuffer::with_capacity(1, 16);
        let mut received = 0usize;
        while received < TOTAL {
            let n = reader.read(&mut dst, 16);
            for i in 0..n {
                assert_eq!(dst.channel(0)[i], (received + i) as f32);
            }
            received += n;
        }

        producer.join().unwrap();
        assert_eq!(received, TOTAL);
    }
}
