pub mod batch;
pub mod controller;
pub mod processor;
pub mod ringbuf;

pub use batch::{Batch, BatchAssembler, BatchEntry, BatchMultiplexer};
pub use controller::{Collaborators, ControlHandle, Pipeline};
pub use processor::BatchProcessor;
pub use ringbuf::{MuxSnapshot, MuxStats};
