//! Multi-stream video ingest with per-stream motion detection and a tiled output canvas

pub mod capture;
pub mod config;
pub mod control;
pub mod display;
pub mod error;
pub mod health;
pub mod motion;
pub mod pipeline;

pub use capture::{Frame, PixelFormat, SourceHealth, SourceState};
pub use config::{Settings, StreamConfig, StreamEntry};
pub use error::{Error, Result};
pub use motion::{MotionEvent, MotionParams, Rect, Roi};
pub use pipeline::{Collaborators, ControlHandle, Pipeline};
