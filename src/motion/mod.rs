//! Frame-differencing motion detection inside a per-stream region of interest

pub mod filter;
pub mod regions;

use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capture::Frame;
use crate::{Error, Result};

pub use filter::GrayPlane;
pub use regions::Region;

/// Axis-aligned rectangle in pixel coordinates, serialized as `[x, y, w, h]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Region of interest
pub type Roi = Rect;

impl Rect {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.w)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.h)
    }

    /// True when the rectangle lies inside a `width` x `height` image
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        match (self.x.checked_add(self.w), self.y.checked_add(self.h)) {
            (Some(r), Some(b)) => self.w > 0 && self.h > 0 && r <= width && b <= height,
            _ => false,
        }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn translate(&self, dx: u32, dy: u32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.w, self.h)
    }
}

impl From<[u32; 4]> for Rect {
    fn from([x, y, w, h]: [u32; 4]) -> Self {
        Self { x, y, w, h }
    }
}

impl From<Rect> for [u32; 4] {
    fn from(r: Rect) -> Self {
        [r.x, r.y, r.w, r.h]
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x, self.y, self.w, self.h)
    }
}

/// Detector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionParams {
    /// Per-pixel intensity delta that counts as change (0-255)
    pub threshold: u8,
    /// Regions smaller than this many pixels are noise
    pub min_area: u32,
    /// Gaussian kernel size; below 3 disables smoothing
    pub blur_kernel: u32,
    pub dilate_iterations: u32,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            threshold: 25,
            min_area: 500,
            blur_kernel: 21,
            dilate_iterations: 2,
        }
    }
}

/// One motion occurrence, ready for the alert collaborator
#[derive(Debug, Clone, Serialize)]
pub struct MotionEvent {
    pub stream: usize,
    pub sequence: u64,
    /// Capture time, milliseconds since the Unix epoch
    pub captured_at_ms: u64,
    /// Full-frame coordinates
    pub boxes: Vec<Rect>,
    /// Largest surviving region area
    pub max_area: u32,
    #[serde(skip)]
    pub timestamp: Instant,
}

/// Last processed ROI plane for one stream
#[derive(Debug, Clone)]
pub struct ReferenceState {
    pub plane: GrayPlane,
    pub session: u32,
    pub last_seen: Instant,
}

/// Output of one differencing step
#[derive(Debug, Clone)]
pub struct Detection {
    /// Smoothed luminance of the ROI; becomes the next reference
    pub processed: GrayPlane,
    /// Surviving regions in full-frame coordinates
    pub regions: Vec<Region>,
}

impl Detection {
    pub fn motion(&self) -> bool {
        !self.regions.is_empty()
    }
}

/// Compare `frame`'s ROI against `reference`.
///
/// Without a reference (or with one of a different size) nothing is flagged;
/// the processed plane is still returned so the caller can store it.
pub fn detect_motion(
    reference: Option<&GrayPlane>,
    frame: &Frame,
    roi: Roi,
    params: &MotionParams,
) -> Result<Detection> {
    if !roi.fits_within(frame.meta.width, frame.meta.height) {
        return Err(Error::InvalidRegion {
            stream: frame.meta.stream,
            roi,
            width: frame.meta.width,
            height: frame.meta.height,
        });
    }

    let gray = filter::crop_luma(frame, roi);
    let processed = filter::gaussian_blur(&gray, params.blur_kernel);

    let reference = match reference {
        Some(r) if r.same_size(&processed) => r,
        _ => {
            return Ok(Detection {
                processed,
                regions: Vec::new(),
            })
        }
    };

    let mask = filter::diff_mask(reference, &processed, params.threshold);
    let mask = filter::dilate(&mask, params.dilate_iterations);

    let regions = regions::find_regions(&mask)
        .into_iter()
        .filter(|r| r.area >= params.min_area)
        .map(|r| Region {
            bbox: r.bbox.translate(roi.x, roi.y),
            area: r.area,
        })
        .collect();

    Ok(Detection { processed, regions })
}

/// Motion detector for one stream; sole owner of that stream's ReferenceState.
///
/// The reference is tagged with the connection session it came from, so the
/// first frame after a restart always starts cold.
pub struct StreamDetector {
    stream: usize,
    roi: Option<Roi>,
    params: MotionParams,
    reference: Option<ReferenceState>,
}

impl StreamDetector {
    pub fn new(stream: usize, roi: Option<Roi>, params: MotionParams) -> Self {
        Self {
            stream,
            roi,
            params,
            reference: None,
        }
    }

    pub fn stream(&self) -> usize {
        self.stream
    }

    /// Effective ROI for a frame of the given size
    pub fn roi_for(&self, width: u32, height: u32) -> Roi {
        self.roi.unwrap_or(Rect::full(width, height))
    }

    pub fn reference(&self) -> Option<&ReferenceState> {
        self.reference.as_ref()
    }

    /// Run one differencing step. An `InvalidRegion` error leaves the reference untouched.
    pub fn process(&mut self, frame: &Frame) -> Result<Option<MotionEvent>> {
        let started = Instant::now();
        let roi = self.roi_for(frame.meta.width, frame.meta.height);

        // A reference from an earlier connection session is stale
        if self
            .reference
            .as_ref()
            .is_some_and(|r| r.session != frame.meta.session)
        {
            self.reference = None;
        }

        let detection = detect_motion(
            self.reference.as_ref().map(|r| &r.plane),
            frame,
            roi,
            &self.params,
        )?;

        let event = detection.motion().then(|| MotionEvent {
            stream: self.stream,
            sequence: frame.meta.sequence,
            captured_at_ms: unix_millis(frame.timestamp),
            boxes: detection.regions.iter().map(|r| r.bbox).collect(),
            max_area: detection.regions.iter().map(|r| r.area).max().unwrap_or(0),
            timestamp: frame.timestamp,
        });

        self.reference = Some(ReferenceState {
            plane: detection.processed,
            session: frame.meta.session,
            last_seen: frame.timestamp,
        });

        metrics::histogram!("argus_detect_time_us").record(started.elapsed().as_micros() as f64);
        trace!(stream = self.stream, seq = frame.meta.sequence, motion = event.is_some(), "detect");

        Ok(event)
    }
}

fn unix_millis(at: Instant) -> u64 {
    let wall = SystemTime::now()
        .checked_sub(at.elapsed())
        .unwrap_or(UNIX_EPOCH);
    wall.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{DecodedImage, PixelFormat};

    const BACKGROUND: u8 = 50;

    /// Flat RGB frame with an optional bright square
    fn frame(width: u32, height: u32, block: Option<(Rect, u8)>, session: u32) -> Frame {
        let mut data = vec![BACKGROUND; (width * height * 3) as usize];
        if let Some((rect, delta)) = block {
            for y in rect.y..rect.bottom() {
                for x in rect.x..rect.right() {
                    let i = ((y * width + x) * 3) as usize;
                    data[i..i + 3].fill(BACKGROUND + delta);
                }
            }
        }
        let image = DecodedImage::packed(data, width, height, PixelFormat::Rgb24);
        Frame::from_decoded(image, 0, 0, session)
    }

    fn detector(roi: Roi) -> StreamDetector {
        StreamDetector::new(0, Some(roi), MotionParams::default())
    }

    #[test]
    fn cold_start_is_never_flagged() {
        let mut det = detector(Rect::new(0, 0, 100, 100));
        let block = Some((Rect::new(10, 10, 50, 50), 100));
        assert!(det.reference().is_none());
        assert!(det.process(&frame(100, 100, block, 1)).unwrap().is_none());
        assert!(det.reference().is_some());
    }

    #[test]
    fn identical_frames_report_nothing() {
        let mut det = detector(Rect::new(0, 0, 100, 100));
        let block = Some((Rect::new(20, 20, 40, 40), 80));
        det.process(&frame(100, 100, block, 1)).unwrap();
        assert!(det.process(&frame(100, 100, block, 1)).unwrap().is_none());
    }

    #[test]
    fn square_change_yields_one_box_around_it() {
        let mut det = detector(Rect::new(0, 0, 100, 100));
        let square = Rect::new(35, 35, 30, 30);

        assert!(det.process(&frame(100, 100, None, 1)).unwrap().is_none());
        let event = det
            .process(&frame(100, 100, Some((square, 100)), 1))
            .unwrap()
            .expect("motion");

        assert_eq!(event.boxes.len(), 1);
        let bbox = event.boxes[0];
        assert!(bbox.contains(&square), "{} should contain {}", bbox, square);
        // Smoothing and dilation grow the region by a few pixels per side
        assert!(bbox.w <= 42 && bbox.h <= 42, "box {} too large", bbox);
        assert!(bbox.x >= 29 && bbox.y >= 29, "box {} drifted", bbox);
        assert!(event.max_area >= 900);
    }

    #[test]
    fn boxes_are_translated_by_the_roi_offset() {
        let roi = Rect::new(40, 20, 100, 80);
        let mut det = detector(roi);
        let square = Rect::new(80, 50, 30, 30);

        det.process(&frame(200, 150, None, 1)).unwrap();
        let event = det
            .process(&frame(200, 150, Some((square, 100)), 1))
            .unwrap()
            .expect("motion");

        assert_eq!(event.boxes.len(), 1);
        assert!(event.boxes[0].contains(&square));
        assert!(roi.contains(&event.boxes[0]));
    }

    #[test]
    fn change_outside_roi_is_ignored() {
        let mut det = detector(Rect::new(0, 0, 60, 60));
        det.process(&frame(200, 150, None, 1)).unwrap();
        let outside = Some((Rect::new(120, 90, 40, 40), 100));
        assert!(det.process(&frame(200, 150, outside, 1)).unwrap().is_none());
    }

    #[test]
    fn small_change_is_noise() {
        let mut det = detector(Rect::new(0, 0, 100, 100));
        det.process(&frame(100, 100, None, 1)).unwrap();
        let speck = Some((Rect::new(50, 50, 4, 4), 100));
        assert!(det.process(&frame(100, 100, speck, 1)).unwrap().is_none());
    }

    #[test]
    fn reference_is_replaced_every_frame() {
        let mut det = detector(Rect::new(0, 0, 100, 100));
        let moved = Some((Rect::new(30, 30, 30, 30), 100));

        det.process(&frame(100, 100, None, 1)).unwrap();
        assert!(det.process(&frame(100, 100, moved, 1)).unwrap().is_some());
        // Same content as the previous frame: the square is now the baseline
        assert!(det.process(&frame(100, 100, moved, 1)).unwrap().is_none());
    }

    #[test]
    fn frame_smaller_than_roi_keeps_reference() {
        let mut det = detector(Rect::new(0, 0, 100, 100));
        det.process(&frame(100, 100, None, 1)).unwrap();
        let before = det.reference().unwrap().plane.clone();

        let err = det.process(&frame(64, 64, None, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidRegion { .. }));
        assert_eq!(det.reference().unwrap().plane, before);
    }

    #[test]
    fn new_session_starts_cold() {
        let mut det = detector(Rect::new(0, 0, 100, 100));
        let square = Some((Rect::new(35, 35, 30, 30), 100));

        det.process(&frame(100, 100, None, 1)).unwrap();
        assert!(det.process(&frame(100, 100, square, 2)).unwrap().is_none());
        assert_eq!(det.reference().unwrap().session, 2);
    }

    #[test]
    fn full_frame_roi_when_unset() {
        let det = StreamDetector::new(3, None, MotionParams::default());
        assert_eq!(det.roi_for(640, 480), Rect::full(640, 480));
    }

    #[test]
    fn rect_bounds() {
        assert!(Rect::new(0, 0, 100, 100).fits_within(100, 100));
        assert!(!Rect::new(1, 0, 100, 100).fits_within(100, 100));
        assert!(!Rect::new(0, 0, 0, 10).fits_within(100, 100));
        assert!(!Rect::new(u32::MAX, 0, 2, 2).fits_within(100, 100));
    }
}
