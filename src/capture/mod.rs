pub mod decoder;
pub mod files;
pub mod frame;
#[cfg(feature = "gstreamer-source")]
pub mod gst_capture;
pub mod source;
pub mod synthetic;

pub use decoder::{Decoder, DecoderFactory, DefaultDecoderFactory, ReadOutcome};
pub use frame::{DecodedImage, Frame, PixelFormat};
pub use source::{FrameSource, HealthCell, NextFrame, SourceCommand, SourceHealth, SourceState};
