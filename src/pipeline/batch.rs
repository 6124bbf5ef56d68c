//! Batch multiplexer: N independent frame streams in, one deterministic batch
//! sequence out.

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, trace};

use super::ringbuf::{MuxStats, PendingSlots};
use crate::capture::Frame;

/// One stream's slot in a batch
#[derive(Debug, Clone)]
pub enum BatchEntry {
    Present(Frame),
    Missing,
}

impl BatchEntry {
    pub fn frame(&self) -> Option<&Frame> {
        match self {
            BatchEntry::Present(frame) => Some(frame),
            BatchEntry::Missing => None,
        }
    }
}

/// Frames aligned to one multiplexer tick; `entries[i]` belongs to stream `i`
#[derive(Debug, Clone)]
pub struct Batch {
    pub sequence: u64,
    pub deadline: Instant,
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.frame().is_some()).count()
    }

    pub fn missing_count(&self) -> usize {
        self.entries.len() - self.present_count()
    }

    pub fn is_missing(&self, stream: usize) -> bool {
        matches!(self.entries.get(stream), Some(BatchEntry::Missing))
    }
}

/// Single-threaded batch assembly over the pending slots
pub struct BatchAssembler {
    slots: PendingSlots,
    next_sequence: u64,
    stats: Arc<MuxStats>,
}

impl BatchAssembler {
    pub fn new(streams: usize) -> Self {
        Self {
            slots: PendingSlots::new(streams),
            next_sequence: 0,
            stats: Arc::new(MuxStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MuxStats> {
        Arc::clone(&self.stats)
    }

    pub fn accept(&mut self, frame: Frame, arrived: Instant) {
        let stream = frame.stream();
        let overwrote = self.slots.put(frame, arrived);
        if overwrote {
            trace!(stream, "Pending frame overwritten");
            metrics::counter!("argus_frames_dropped", "stream" => stream.to_string()).increment(1);
        }
        self.stats.record_frame(overwrote);
    }

    pub fn oldest_pending(&self) -> Option<Instant> {
        self.slots.oldest()
    }

    /// Close the current batch. Nothing is emitted when no stream has a frame.
    pub fn close(&mut self, deadline: Instant) -> Option<Batch> {
        if !self.slots.any_pending() {
            return None;
        }

        let entries: Vec<BatchEntry> = (0..self.slots.len())
            .map(|stream| match self.slots.take(stream) {
                Some(frame) => BatchEntry::Present(frame),
                None => BatchEntry::Missing,
            })
            .collect();

        let batch = Batch {
            sequence: self.next_sequence,
            deadline,
            entries,
        };
        self.next_sequence += 1;

        let missing = batch.missing_count();
        self.stats.record_batch(missing);
        metrics::counter!("argus_batches_emitted").increment(1);
        metrics::counter!("argus_missing_entries").increment(missing as u64);

        Some(batch)
    }
}

/// Tick-driven multiplexer task
pub struct BatchMultiplexer {
    assembler: BatchAssembler,
    period: Duration,
    max_pending_age: Option<Duration>,
}

impl BatchMultiplexer {
    pub fn new(streams: usize, period: Duration, max_pending_age: Option<Duration>) -> Self {
        Self {
            assembler: BatchAssembler::new(streams),
            period,
            max_pending_age,
        }
    }

    pub fn stats(&self) -> Arc<MuxStats> {
        self.assembler.stats()
    }

    /// Run until the frame channel closes or the batch consumer goes away.
    /// Frames still pending when the inputs close are flushed as a final batch.
    #[instrument(skip_all, name = "multiplexer")]
    pub async fn run(mut self, frames: Receiver<Frame>, batches: Sender<Batch>) {
        info!(
            "Multiplexer started: {} streams, period {:?}",
            self.assembler.slots.len(),
            self.period
        );
        let mut deadline = Instant::now() + self.period;

        loop {
            let close_at = match (self.max_pending_age, self.assembler.oldest_pending()) {
                (Some(age), Some(oldest)) => deadline.min(oldest + age),
                _ => deadline,
            };

            tokio::select! {
                biased;
                _ = sleep_until(close_at) => {
                    if let Some(batch) = self.assembler.close(close_at) {
                        trace!(seq = batch.sequence, missing = batch.missing_count(), "Batch closed");
                        if batches.send_async(batch).await.is_err() {
                            debug!("Batch consumer gone");
                            break;
                        }
                    }
                    // Ticks stay on the period grid even after an early close
                    let now = Instant::now();
                    while deadline <= now {
                        deadline += self.period;
                    }
                }
                frame = frames.recv_async() => match frame {
                    Ok(frame) => self.assembler.accept(frame, Instant::now()),
                    Err(_) => {
                        if let Some(batch) = self.assembler.close(Instant::now()) {
                            let _ = batches.send_async(batch).await;
                        }
                        break;
                    }
                },
            }
        }

        let stats = self.assembler.stats.snapshot();
        info!(
            "Multiplexer stopped: {} batches, {} frames, {} overwritten",
            stats.batches, stats.frames_in, stats.overwritten
        );
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
    fn empty_tick_emits_nothing() {
        let mut asm = BatchAssembler::new(3);
        assert!(asm.close(Instant::now()).is_none());
        assert_eq!(asm.stats().snapshot().batches, 0);
    }

    #[test]
    fn burst_keeps_only_latest_frame() {
        let mut asm = BatchAssembler::new(2);
        let now = Instant::now();
        for seq in 0..5 {
            asm.accept(frame(1, seq), now);
        }
        let batch = asm.close(now).unwrap();
        assert!(batch.is_missing(0));
        assert_eq!(batch.entries[1].frame().unwrap().sequence(), 4);
        assert_eq!(asm.stats().snapshot().overwritten, 4);
    }

    #[test]
    fn sequences_increase_without_gaps() {
        let mut asm = BatchAssembler::new(2);
        let mut seen = Vec::new();
        for round in 0..6u64 {
            // Odd rounds are empty and must not consume a sequence number
            if round % 2 == 0 {
                asm.accept(frame(0, round), Instant::now());
            }
            if let Some(batch) = asm.close(Instant::now()) {
                assert_eq!(batch.present_count() + batch.missing_count(), 2);
                seen.push(batch.sequence);
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_is_missing_in_every_batch() {
        const STREAMS: usize = 4;
        let period = Duration::from_millis(100);

        let (frame_tx, frame_rx) = flume::bounded(64);
        let (batch_tx, batch_rx) = flume::unbounded();
        let mux = BatchMultiplexer::new(STREAMS, period, None);
        let stats = mux.stats();
        let mux_task = tokio::spawn(mux.run(frame_rx, batch_tx));

        // Streams 0, 1 and 3 deliver every 30ms; stream 2 never connects
        let producer = tokio::spawn(async move {
            let mut seq = 0;
            let end = Instant::now() + period * 5;
            while Instant::now() + Duration::from_millis(30) < end {
                tokio::time::sleep(Duration::from_millis(30)).await;
                for stream in [0, 1, 3] {
                    frame_tx.send_async(frame(stream, seq)).await.unwrap();
                }
                seq += 1;
            }
        });

        tokio::time::sleep(period * 5 + Duration::from_millis(10)).await;
        let batches: Vec<Batch> = batch_rx.drain().collect();

        assert_eq!(batches.len(), 5);
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.sequence, i as u64);
            assert!(batch.is_missing(2));
            assert_eq!(batch.present_count(), 3);
            assert_eq!(batch.missing_count(), 1);
        }
        assert_eq!(stats.snapshot().batches, 5);

        producer.await.unwrap();
        mux_task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pending_frame_closes_batch_early() {
        let (frame_tx, frame_rx) = flume::bounded(8);
        let (batch_tx, batch_rx) = flume::unbounded();
        let mux = BatchMultiplexer::new(
            2,
            Duration::from_millis(1_000),
            Some(Duration::from_millis(50)),
        );
        let task = tokio::spawn(mux.run(frame_rx, batch_tx));

        tokio::time::sleep(Duration::from_millis(10)).await;
        frame_tx.send_async(frame(0, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let batch = batch_rx.try_recv().unwrap();
        assert_eq!(batch.sequence, 0);
        assert!(batch.is_missing(1));

        drop(frame_tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_frames_are_flushed_when_inputs_close() {
        let (frame_tx, frame_rx) = flume::bounded(8);
        let (batch_tx, batch_rx) = flume::unbounded();
        let task = tokio::spawn(
            BatchMultiplexer::new(1, Duration::from_secs(10), None).run(frame_rx, batch_tx),
        );

        frame_tx.send_async(frame(0, 7)).await.unwrap();
        drop(frame_tx);
        task.await.unwrap();

        let batch = batch_rx.try_recv().unwrap();
        assert_eq!(batch.entries[0].frame().unwrap().sequence(), 7);
    }
}
