//! Error taxonomy for the ingest/detect pipeline

use crate::motion::Roi;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Stream could not be opened or dropped its connection
    #[error("stream {stream}: connection error: {reason}")]
    Connection { stream: usize, reason: String },

    /// A single frame could not be decoded
    #[error("stream {stream}: decode error: {reason}")]
    Decode { stream: usize, reason: String },

    /// Frame too small for the configured region of interest
    #[error("stream {stream}: region {roi} does not fit a {width}x{height} frame")]
    InvalidRegion {
        stream: usize,
        roi: Roi,
        width: u32,
        height: u32,
    },

    /// Fatal at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    /// More streams than the pipeline can carry
    #[error("resource exhaustion: {requested} streams requested, capacity is {capacity}")]
    ResourceExhaustion { requested: usize, capacity: usize },

    /// Operator named a stream that is not configured
    #[error("unknown stream '{0}'")]
    UnknownStream(String),

    /// Settings file could not be loaded
    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Image codec error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn connection(stream: usize, reason: impl Into<String>) -> Self {
        Self::Connection {
            stream,
            reason: reason.into(),
        }
    }

    pub fn decode(stream: usize, reason: impl Into<String>) -> Self {
        Self::Decode {
            stream,
            reason: reason.into(),
        }
    }

    /// Per-stream and per-frame errors the pipeline keeps running through
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Decode { .. }
                | Self::InvalidRegion { .. }
                | Self::ResourceExhaustion { .. }
                | Self::UnknownStream(_)
        )
    }
}
