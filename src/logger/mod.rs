//! Structured event logging with tee'd sinks and rotatable file output

pub mod event_logger;
pub mod file_sink;
pub mod sink;

pub use event_logger::{EventLogger, EventLoggerBuilder, SinkStats};
pub use file_sink::{ArchiveCompression, FileSink, Retention};
pub use sink::{ConsoleSink, MemorySink, RecordFormat, Sink};
pub use crate::types::LogLevel;
