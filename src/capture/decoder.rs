//! Decoder collaborator boundary: anything that can hand the core decoded pixel buffers

use std::path::Path;

use tracing::debug;

use super::files::ImageSequenceDecoder;
use super::frame::DecodedImage;
use super::synthetic::SyntheticDecoder;
use crate::config::StreamConfig;
use crate::Result;

/// Result of one blocking read
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(DecodedImage),
    /// Nothing available yet; the caller polls again after checking for stop
    Idle,
    EndOfStream,
}

/// One open stream. All calls block and run on the source's decode thread.
///
/// A `Connection` error from `read_frame` means the stream is gone; any other
/// error is treated as a bad frame and skipped.
pub trait Decoder: Send {
    fn connect(&mut self) -> Result<()>;

    fn read_frame(&mut self) -> Result<ReadOutcome>;

    /// Release the connection and decoder handle. Called on every exit path.
    fn release(&mut self);
}

/// Builds a fresh decoder for every connection attempt
pub trait DecoderFactory: Send + Sync {
    fn create(&self, config: &StreamConfig) -> Result<Box<dyn Decoder>>;
}

/// Picks a decoder from the URI scheme
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoderFactory;

impl DecoderFactory for DefaultDecoderFactory {
    fn create(&self, config: &StreamConfig) -> Result<Box<dyn Decoder>> {
        let uri = config.uri.as_str();
        debug!(stream = config.index, uri, "Creating decoder");

        if uri.starts_with("synthetic://") {
            return Ok(Box::new(SyntheticDecoder::from_uri(config)?));
        }

        if let Some(path) = local_path(uri) {
            if ImageSequenceDecoder::handles(path) {
                return Ok(Box::new(ImageSequenceDecoder::new(config, path)?));
            }
        }

        network_decoder(config)
    }
}

/// `file://` prefix stripped, or the URI itself when it has no scheme
fn local_path(uri: &str) -> Option<&Path> {
    if let Some(rest) = uri.strip_prefix("file://") {
        Some(Path::new(rest))
    } else if uri.contains("://") {
        None
    } else {
        Some(Path::new(uri))
    }
}

#[cfg(feature = "gstreamer-source")]
fn network_decoder(config: &StreamConfig) -> Result<Box<dyn Decoder>> {
    Ok(Box::new(super::gst_capture::GstDecoder::new(config)?))
}

#[cfg(not(feature = "gstreamer-source"))]
fn network_decoder(config: &StreamConfig) -> Result<Box<dyn Decoder>> {
    Err(crate::Error::connection(
        config.index,
        format!(
            "no decoder for '{}' (network and video files need the gstreamer-source feature)",
            config.uri
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_path_detection() {
        assert_eq!(local_path("file:///srv/cam"), Some(Path::new("/srv/cam")));
        assert_eq!(local_path("/srv/cam"), Some(Path::new("/srv/cam")));
        assert_eq!(local_path("rtsp://10.0.0.2/live"), None);
    }
}
