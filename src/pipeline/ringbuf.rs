//! Latest-frame-wins pending slots for the multiplexer

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tokio::time::Instant;

use crate::capture::Frame;

struct Pending {
    frame: Frame,
    arrived: Instant,
}

/// One capacity-1 ring per stream index. A newer frame overwrites the pending one.
pub struct PendingSlots {
    slots: Vec<HeapRb<Pending>>,
}

impl PendingSlots {
    pub fn new(streams: usize) -> Self {
        Self {
            slots: (0..streams).map(|_| HeapRb::new(1)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store `frame` in its stream's slot. Returns true if an older frame was dropped.
    /// Frames for unknown stream indices are discarded.
    pub fn put(&mut self, frame: Frame, arrived: Instant) -> bool {
        match self.slots.get_mut(frame.stream()) {
            Some(slot) => slot.push_overwrite(Pending { frame, arrived }).is_some(),
            None => false,
        }
    }

    pub fn take(&mut self, stream: usize) -> Option<Frame> {
        self.slots
            .get_mut(stream)
            .and_then(|slot| slot.try_pop())
            .map(|pending| pending.frame)
    }

    pub fn any_pending(&self) -> bool {
        self.slots.iter().any(|slot| !slot.is_empty())
    }

    /// Arrival time of the oldest pending frame
    pub fn oldest(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|slot| slot.try_peek().map(|p| p.arrived))
            .min()
    }
}

/// Multiplexer counters, readable while the multiplexer runs
#[derive(Debug, Default)]
pub struct MuxStats {
    batches: CachePadded<AtomicU64>,
    frames_in: CachePadded<AtomicU64>,
    overwritten: CachePadded<AtomicU64>,
    missing: CachePadded<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuxSnapshot {
    pub batches: u64,
    pub frames_in: u64,
    pub overwritten: u64,
    pub missing: u64,
}

impl MuxStats {
    pub fn record_frame(&self, overwrote: bool) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        if overwrote {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_batch(&self, missing: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.missing.fetch_add(missing as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MuxSnapshot {
        MuxSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{DecodedImage, PixelFormat};

    fn frame(stream: usize, sequence: u64) -> Frame {
        let image = DecodedImage::packed(vec![0u8; 4], 2, 2, PixelFormat::Gray8);
        Frame::from_decoded(image, stream, sequence, 1)
    }

    #[test]
    fn newer_frame_replaces_pending_one() {
        let now = Instant::now();
        let mut slots = PendingSlots::new(2);
        assert!(!slots.put(frame(0, 1), now));
        assert!(slots.put(frame(0, 2), now));
        assert_eq!(slots.oldest(), Some(now));
        assert!(slots.any_pending());

        assert_eq!(slots.take(0).unwrap().sequence(), 2);
        assert!(slots.take(0).is_none());
        assert!(slots.take(1).is_none());
        assert!(!slots.any_pending());
    }

    #[test]
    fn unknown_stream_is_discarded() {
        let mut slots = PendingSlots::new(1);
        assert!(!slots.put(frame(5, 0), Instant::now()));
        assert!(!slots.any_pending());
    }

    #[test]
    fn stats_accumulate() {
        let stats = MuxStats::default();
        stats.record_frame(false);
        stats.record_frame(true);
        stats.record_batch(2);
        assert_eq!(
            stats.snapshot(),
            MuxSnapshot {
                batches: 1,
                frames_in: 2,
                overwritten: 1,
                missing: 2,
            }
        );
    }
}
