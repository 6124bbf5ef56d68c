pub mod sink;
pub mod tiler;

pub use sink::{AlertFanout, AlertSink, FrameSink, LatestCanvas, LogAlerts, NullSink, Overlay, SnapshotWriter};
pub use tiler::{Canvas, TileLayout, Tiler};
