use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decoded frame with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - can be handed across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub stream: usize,
    pub sequence: u64,
    /// Connection session the frame was decoded in; bumped on every (re)start
    pub session: u32,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Decoder timestamp if available
}

/// Pixel formats the core understands. Anything else is converted by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba32,
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba32 => 4,
            PixelFormat::Gray8 => 1,
        }
    }

    /// BT.601 luminance of one pixel
    #[inline]
    pub fn luma(self, px: &[u8]) -> u8 {
        let (r, g, b) = match self {
            PixelFormat::Rgb24 | PixelFormat::Rgba32 => (px[0], px[1], px[2]),
            PixelFormat::Bgr24 => (px[2], px[1], px[0]),
            PixelFormat::Gray8 => return px[0],
        };
        ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114 + 500) / 1000) as u8
    }

    #[inline]
    pub fn rgb(self, px: &[u8]) -> [u8; 3] {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Rgba32 => [px[0], px[1], px[2]],
            PixelFormat::Bgr24 => [px[2], px[1], px[0]],
            PixelFormat::Gray8 => [px[0]; 3],
        }
    }
}

/// Pixel buffer as delivered by a decoder, before the source stamps it
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>,
}

impl DecodedImage {
    /// Tightly packed image (stride = width * channels)
    pub fn packed(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            stride: width * format.channels() as u32,
            format,
            device_timestamp: None,
        }
    }

    /// True when the buffer holds every row the header promises
    pub fn is_complete(&self) -> bool {
        let row_bytes = self.width as usize * self.format.channels();
        if self.width == 0 || self.height == 0 || (self.stride as usize) < row_bytes {
            return false;
        }
        let needed = self.stride as usize * (self.height as usize - 1) + row_bytes;
        self.data.len() >= needed
    }
}

impl Frame {
    pub fn from_decoded(image: DecodedImage, stream: usize, sequence: u64, session: u32) -> Self {
        Self {
            meta: Arc::new(FrameMetadata {
                stream,
                sequence,
                session,
                width: image.width,
                height: image.height,
                stride: image.stride,
                format: image.format,
                device_timestamp: image.device_timestamp,
            }),
            data: image.data,
            timestamp: Instant::now(),
        }
    }

    pub fn stream(&self) -> usize {
        self.meta.stream
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Pixel bytes of row `y`
    #[inline]
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.meta.stride as usize;
        let len = self.meta.width as usize * self.meta.format.channels();
        &self.data[start..start + len]
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("stream", &self.meta.stream)
            .field("sequence", &self.meta.sequence)
            .field("session", &self.meta.session)
            .field("size", &(self.meta.width, self.meta.height))
            .field("format", &self.meta.format)
            .finish()
    }
}
