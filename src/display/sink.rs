//! Output collaborators: composed-canvas sinks and motion alert sinks

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::tiler::Canvas;
use crate::capture::Frame;
use crate::motion::{MotionEvent, Rect, Roi};
use crate::Result;

const ROI_COLOR: [u8; 3] = [0, 200, 0];
const BOX_COLOR: [u8; 3] = [230, 30, 30];

/// Per-stream annotation for one batch, in canvas coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub stream: usize,
    pub roi: Roi,
    pub boxes: Vec<Rect>,
    pub motion: bool,
}

/// Receives one composed canvas per batch. Fire-and-forget.
pub trait FrameSink: Send + Sync {
    fn present(&self, canvas: Canvas, overlays: Vec<Overlay>);
}

/// Receives one record per motion occurrence. No acknowledgment.
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: &MotionEvent, frame: &Frame);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&self, _canvas: Canvas, _overlays: Vec<Overlay>) {}
}

impl AlertSink for NullSink {
    fn emit(&self, _event: &MotionEvent, _frame: &Frame) {}
}

/// Most recent canvas and its overlays
#[derive(Debug, Clone)]
pub struct Presented {
    pub canvas: Canvas,
    pub overlays: Vec<Overlay>,
}

/// Keeps the latest presented canvas for inspection
#[derive(Debug, Default, Clone)]
pub struct LatestCanvas {
    latest: Arc<ArcSwapOption<Presented>>,
}

impl LatestCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Arc<Presented>> {
        self.latest.load_full()
    }
}

impl FrameSink for LatestCanvas {
    fn present(&self, canvas: Canvas, overlays: Vec<Overlay>) {
        self.latest.store(Some(Arc::new(Presented { canvas, overlays })));
    }
}

#[derive(Serialize)]
struct AlertRecord<'a> {
    stream_id: &'a str,
    #[serde(flatten)]
    event: &'a MotionEvent,
}

/// One JSON log record per motion event, on the `argus::alerts` target
#[derive(Debug, Clone)]
pub struct LogAlerts {
    ids: Arc<Vec<String>>,
}

impl LogAlerts {
    pub fn new(ids: Vec<String>) -> Self {
        Self { ids: Arc::new(ids) }
    }

    fn id(&self, stream: usize) -> &str {
        self.ids.get(stream).map(String::as_str).unwrap_or("unknown")
    }
}

impl AlertSink for LogAlerts {
    fn emit(&self, event: &MotionEvent, _frame: &Frame) {
        metrics::counter!("argus_motion_events", "stream" => event.stream.to_string()).increment(1);
        let record = AlertRecord {
            stream_id: self.id(event.stream),
            event,
        };
        match serde_json::to_string(&record) {
            Ok(json) => info!(target: "argus::alerts", "{}", json),
            Err(e) => warn!("Failed to serialize motion event: {}", e),
        }
    }
}

/// Saves `<dir>/stream_<i>/frame_<seq>.jpg` for every motion event, ROI and boxes drawn
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
    rois: Arc<Vec<Option<Roi>>>,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, rois: Vec<Option<Roi>>) -> Self {
        Self {
            dir: dir.into(),
            rois: Arc::new(rois),
        }
    }

    pub fn path_for(&self, stream: usize, sequence: u64) -> PathBuf {
        self.dir
            .join(format!("stream_{}", stream))
            .join(format!("frame_{}.jpg", sequence))
    }

    fn write(&self, event: &MotionEvent, frame: &Frame) -> Result<PathBuf> {
        let meta = &frame.meta;
        let mut image = image::RgbImage::new(meta.width, meta.height);
        for y in 0..meta.height {
            let row = frame.row(y);
            let channels = meta.format.channels();
            for x in 0..meta.width {
                let px = meta.format.rgb(&row[x as usize * channels..]);
                image.put_pixel(x, y, image::Rgb(px));
            }
        }

        let roi = self
            .rois
            .get(event.stream)
            .copied()
            .flatten()
            .unwrap_or(Rect::full(meta.width, meta.height));
        draw_rect(&mut image, roi, ROI_COLOR);
        for bbox in &event.boxes {
            draw_rect(&mut image, *bbox, BOX_COLOR);
        }

        let path = self.path_for(event.stream, event.sequence);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        image.save(&path)?;
        Ok(path)
    }
}

impl AlertSink for SnapshotWriter {
    fn emit(&self, event: &MotionEvent, frame: &Frame) {
        match self.write(event, frame) {
            Ok(path) => debug!(stream = event.stream, "Snapshot saved to {}", path.display()),
            Err(e) => warn!(stream = event.stream, "Failed to save snapshot: {}", e),
        }
    }
}

/// Fan one event out to several sinks
pub struct AlertFanout(pub Vec<Arc<dyn AlertSink>>);

impl AlertSink for AlertFanout {
    fn emit(&self, event: &MotionEvent, frame: &Frame) {
        for sink in &self.0 {
            sink.emit(event, frame);
        }
    }
}

/// 1-pixel outline, clipped to the image
fn draw_rect(image: &mut image::RgbImage, rect: Rect, color: [u8; 3]) {
    let (w, h) = image.dimensions();
    if rect.w == 0 || rect.h == 0 || rect.x >= w || rect.y >= h {
        return;
    }
    let right = rect.right().min(w) - 1;
    let bottom = rect.bottom().min(h) - 1;
    let px = image::Rgb(color);

    for x in rect.x..=right {
        image.put_pixel(x, rect.y, px);
        image.put_pixel(x, bottom, px);
    }
    for y in rect.y..=bottom {
        image.put_pixel(rect.x, y, px);
        image.put_pixel(right, y, px);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{DecodedImage, PixelFormat};
    use std::time::Instant;

    fn event(stream: usize, sequence: u64) -> MotionEvent {
        MotionEvent {
            stream,
            sequence,
            captured_at_ms: 1_700_000_000_000,
            boxes: vec![Rect::new(2, 2, 4, 4)],
            max_area: 16,
            timestamp: Instant::now(),
        }
    }

    fn frame(stream: usize) -> Frame {
        let image = DecodedImage::packed(vec![90u8; 16 * 12 * 3], 16, 12, PixelFormat::Rgb24);
        Frame::from_decoded(image, stream, 5, 1)
    }

    #[test]
    fn latest_canvas_keeps_last_presentation() {
        let sink = LatestCanvas::new();
        assert!(sink.latest().is_none());

        let mut canvas = Canvas::new(4, 4);
        canvas.sequence = 9;
        sink.present(canvas, Vec::new());
        assert_eq!(sink.latest().unwrap().canvas.sequence, 9);
    }

    #[test]
    fn alert_record_carries_stream_id_and_boxes() {
        let ev = event(1, 5);
        let record = AlertRecord {
            stream_id: "gate",
            event: &ev,
        };
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["stream_id"], "gate");
        assert_eq!(json["stream"], 1);
        assert_eq!(json["boxes"][0], serde_json::json!([2, 2, 4, 4]));
        assert!(json.get("timestamp").is_none());
    }

    #[test]
    fn snapshot_lands_in_per_stream_folder() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path(), vec![None, Some(Rect::new(1, 1, 10, 8))]);

        writer.emit(&event(1, 5), &frame(1));

        let path = dir.path().join("stream_1").join("frame_5.jpg");
        assert_eq!(writer.path_for(1, 5), path);
        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (16, 12));
    }

    #[test]
    fn outlines_are_clipped() {
        let mut img = image::RgbImage::new(8, 8);
        draw_rect(&mut img, Rect::new(6, 6, 10, 10), [255, 0, 0]);
        assert_eq!(img.get_pixel(6, 6).0, [255, 0, 0]);
        assert_eq!(img.get_pixel(7, 7).0, [255, 0, 0]);
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
    }
}
