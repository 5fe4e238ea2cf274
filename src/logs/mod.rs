// Logs module - aggregation of child stdout/stderr into shared files

mod sink;

pub use sink::{pump_stream, LogSink, LogStream};
