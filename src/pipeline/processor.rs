//! Per-batch detection, composition and fan-out to the output collaborators

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use flume::Receiver;
use tracing::{debug, error, info, warn};

use super::batch::{Batch, BatchEntry};
use crate::display::{AlertSink, FrameSink, Overlay, Tiler};
use crate::motion::{MotionEvent, MotionParams, Roi, StreamDetector};
use crate::{Error, Result};

/// Owns every stream's detector; runs on a blocking thread
pub struct BatchProcessor {
    detectors: Vec<StreamDetector>,
    tiler: Tiler,
    sink: Arc<dyn FrameSink>,
    alerts: Arc<dyn AlertSink>,
    invalid_reported: HashSet<usize>,
}

impl BatchProcessor {
    pub fn new(
        rois: &[Option<Roi>],
        params: &MotionParams,
        tiler: Tiler,
        sink: Arc<dyn FrameSink>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            detectors: rois
                .iter()
                .enumerate()
                .map(|(stream, roi)| StreamDetector::new(stream, *roi, params.clone()))
                .collect(),
            tiler,
            sink,
            alerts,
            invalid_reported: HashSet::new(),
        }
    }

    pub fn detector(&self, stream: usize) -> Option<&StreamDetector> {
        self.detectors.get(stream)
    }

    /// Detect on every present frame, then compose and hand off. The canvas is
    /// only produced after every detection in the batch has finished.
    pub fn process(&mut self, batch: &Batch) -> Vec<MotionEvent> {
        let results = detect_all(&mut self.detectors, &batch.entries);

        let layout = self.tiler.layout(batch.entries.len()).clone();
        let mut overlays = Vec::new();
        let mut events = Vec::new();

        for (stream, (entry, result)) in batch.entries.iter().zip(results).enumerate() {
            let BatchEntry::Present(frame) = entry else {
                continue;
            };
            let (width, height) = (frame.meta.width, frame.meta.height);

            let event = match result {
                Some(Ok(event)) => {
                    self.invalid_reported.remove(&stream);
                    event
                }
                Some(Err(e @ Error::InvalidRegion { .. })) => {
                    if self.invalid_reported.insert(stream) {
                        warn!(stream, "Skipping detection: {}", e);
                    }
                    None
                }
                Some(Err(e)) if e.is_recoverable() => {
                    warn!(stream, "Detection failed: {}", e);
                    None
                }
                Some(Err(e)) => {
                    error!(stream, "Detection failed: {}", e);
                    None
                }
                None => None,
            };

            let Some(detector) = self.detectors.get(stream) else {
                continue;
            };
            let roi = detector.roi_for(width, height);
            overlays.push(Overlay {
                stream,
                roi: layout.map_rect(stream, roi, width, height),
                boxes: event
                    .iter()
                    .flat_map(|ev| ev.boxes.iter())
                    .map(|b| layout.map_rect(stream, *b, width, height))
                    .collect(),
                motion: event.is_some(),
            });

            if let Some(event) = event {
                debug!(
                    stream,
                    seq = event.sequence,
                    boxes = event.boxes.len(),
                    "Motion detected"
                );
                self.alerts.emit(&event, frame);
                events.push(event);
            }
        }

        let canvas = self.tiler.compose(batch);
        self.sink.present(canvas, overlays);
        events
    }

    /// Consume batches until the multiplexer hangs up
    pub fn run_blocking(mut self, batches: Receiver<Batch>) {
        let mut processed = 0u64;
        while let Ok(batch) = batches.recv() {
            self.process(&batch);
            processed += 1;
        }
        info!("Batch processor stopped after {} batches", processed);
    }
}

/// One detector call per present frame, streams in parallel.
/// A stream's detector is borrowed by exactly one worker.
fn detect_all(
    detectors: &mut [StreamDetector],
    entries: &[BatchEntry],
) -> Vec<Option<Result<Option<MotionEvent>>>> {
    let mut work: Vec<_> = detectors
        .iter_mut()
        .zip(entries)
        .filter_map(|(det, entry)| entry.frame().map(|f| (det, f)))
        .collect();

    let mut results: Vec<Option<Result<Option<MotionEvent>>>> =
        (0..entries.len()).map(|_| None).collect();

    if work.len() <= 1 {
        for (det, frame) in work.drain(..) {
            let stream = det.stream();
            results[stream] = Some(det.process(frame));
        }
        return results;
    }

    thread::scope(|scope| {
        let handles: Vec<_> = work
            .into_iter()
            .map(|(det, frame)| {
                let stream = det.stream();
                (stream, scope.spawn(move || det.process(frame)))
            })
            .collect();

        for (stream, handle) in handles {
            results[stream] = settle(stream, handle.join());
        }
    });

    results
}

/// A panicked worker yields no result; the stream is skipped for this batch
fn settle(
    stream: usize,
    joined: thread::Result<Result<Option<MotionEvent>>>,
) -> Option<Result<Option<MotionEvent>>> {
    match joined {
        Ok(result) => Some(result),
        Err(_) => {
            error!(stream, "Detector panicked; skipping stream for this batch");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{DecodedImage, Frame, PixelFormat};
    use crate::display::LatestCanvas;
    use crate::motion::Rect;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Collect(Mutex<Vec<MotionEvent>>);

    impl AlertSink for Collect {
        fn emit(&self, event: &MotionEvent, _frame: &Frame) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn frame(stream: usize, seq: u64, width: u32, square: Option<Rect>) -> Frame {
        let height = width;
        let mut data = vec![50u8; (width * height * 3) as usize];
        if let Some(r) = square {
            for y in r.y..r.bottom() {
                for x in r.x..r.right() {
                    let i = ((y * width + x) * 3) as usize;
                    data[i..i + 3].fill(150);
                }
            }
        }
        let image = DecodedImage::packed(data, width, height, PixelFormat::Rgb24);
        Frame::from_decoded(image, stream, seq, 1)
    }

    fn batch(sequence: u64, entries: Vec<BatchEntry>) -> Batch {
        Batch {
            sequence,
            deadline: Instant::now(),
            entries,
        }
    }

    #[test]
    fn motion_is_detected_per_stream_and_forwarded() {
        let sink = LatestCanvas::new();
        let alerts = Arc::new(Collect::default());
        let rois = [Some(Rect::new(0, 0, 100, 100)), None, Some(Rect::new(0, 0, 100, 100))];
        let mut proc = BatchProcessor::new(
            &rois,
            &MotionParams::default(),
            Tiler::new(300, 100),
            Arc::new(sink.clone()),
            alerts.clone(),
        );

        let square = Some(Rect::new(35, 35, 30, 30));
        proc.process(&batch(
            0,
            vec![
                BatchEntry::Present(frame(0, 0, 100, None)),
                BatchEntry::Missing,
                BatchEntry::Present(frame(2, 0, 100, None)),
            ],
        ));
        let events = proc.process(&batch(
            1,
            vec![
                BatchEntry::Present(frame(0, 1, 100, square)),
                BatchEntry::Missing,
                BatchEntry::Present(frame(2, 1, 100, None)),
            ],
        ));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream, 0);
        assert_eq!(alerts.0.lock().unwrap().len(), 1);

        let presented = sink.latest().unwrap();
        assert_eq!(presented.canvas.sequence, 1);
        assert_eq!(presented.overlays.len(), 2);
        assert!(presented.overlays[0].motion);
        assert_eq!(presented.overlays[0].boxes.len(), 1);
        assert!(!presented.overlays[1].motion);
        assert!(proc.detector(1).unwrap().reference().is_none());
    }

    #[test]
    fn invalid_region_skips_only_that_stream() {
        let sink = LatestCanvas::new();
        let rois = [Some(Rect::new(0, 0, 200, 200)), None];
        let mut proc = BatchProcessor::new(
            &rois,
            &MotionParams::default(),
            Tiler::new(200, 100),
            Arc::new(sink.clone()),
            Arc::new(crate::display::NullSink),
        );

        let entries = || {
            vec![
                BatchEntry::Present(frame(0, 0, 64, None)),
                BatchEntry::Present(frame(1, 0, 64, None)),
            ]
        };
        assert!(proc.process(&batch(0, entries())).is_empty());
        assert!(proc.process(&batch(1, entries())).is_empty());

        assert!(proc.detector(0).unwrap().reference().is_none());
        assert!(proc.detector(1).unwrap().reference().is_some());
        assert_eq!(sink.latest().unwrap().canvas.sequence, 1);
    }

    #[test]
    fn panicked_detector_is_skipped() {
        let joined: thread::Result<Result<Option<MotionEvent>>> = Err(Box::new("boom"));
        assert!(settle(3, joined).is_none());
        assert!(matches!(settle(3, Ok(Ok(None))), Some(Ok(None))));
    }
}
