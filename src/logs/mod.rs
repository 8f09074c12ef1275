// Logs module - Per-app output capture

mod capture;
mod sink;

pub use capture::{spawn_pump, SharedSink};
pub use sink::{LogSink, StreamId};
