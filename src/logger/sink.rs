//! Sink abstraction and the simple in-process sinks

use crate::config::{ConsoleSinkSettings, ConsoleStream};
use crate::types::{LogLevel, LogRecord};
use crate::{GatewayError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

/// Line encoding used by a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// One JSON object per line
    Json,
    /// `timestamp LEVEL message key=value ...`
    Human,
}

impl RecordFormat {
    /// Encode a record as a single line without the trailing newline
    pub fn encode(&self, record: &LogRecord) -> Result<String> {
        match self {
            RecordFormat::Json => Ok(record.to_json()?),
            RecordFormat::Human => Ok(record.to_human_readable()),
        }
    }
}

/// A single log destination with its own failure domain.
///
/// The [`EventLogger`](super::EventLogger) encodes each record once per
/// format and hands the line to every sink whose level admits it. A sink
/// must write a line atomically with respect to its own `rotate` and other
/// concurrent writes.
pub trait Sink: Send + Sync {
    /// Name used in diagnostics and statistics
    fn name(&self) -> &str;

    /// Encoding this sink expects
    fn format(&self) -> RecordFormat {
        RecordFormat::Json
    }

    /// Records below this level are skipped for this sink only
    fn min_level(&self) -> LogLevel {
        LogLevel::Debug
    }

    /// Write one encoded record; the sink appends the newline
    fn write_line(&self, line: &str) -> Result<()>;

    /// Flush buffered output
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Archive the current target and start a fresh one.
    ///
    /// Returns the archive path, or `None` when the sink has nothing to rotate.
    fn rotate(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Writes records to stdout or stderr
pub struct ConsoleSink {
    name: String,
    stream: ConsoleStream,
    format: RecordFormat,
    min_level: LogLevel,
}

impl ConsoleSink {
    /// JSON lines on standard output
    pub fn stdout() -> Self {
        Self::new(ConsoleStream::Stdout, RecordFormat::Json, LogLevel::Debug)
    }

    /// JSON lines on standard error
    pub fn stderr() -> Self {
        Self::new(ConsoleStream::Stderr, RecordFormat::Json, LogLevel::Debug)
    }

    /// Console sink with explicit stream, format and level
    pub fn new(stream: ConsoleStream, format: RecordFormat, min_level: LogLevel) -> Self {
        let name = match stream {
            ConsoleStream::Stdout => "stdout",
            ConsoleStream::Stderr => "stderr",
        };
        Self {
            name: name.to_string(),
            stream,
            format,
            min_level,
        }
    }

    /// Console sink from configuration
    pub fn from_settings(settings: &ConsoleSinkSettings) -> Self {
        Self::new(settings.stream, settings.format, settings.min_level)
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> RecordFormat {
        self.format
    }

    fn min_level(&self) -> LogLevel {
        self.min_level
    }

    fn write_line(&self, line: &str) -> Result<()> {
        // Holding the stream lock keeps each line contiguous.
        match self.stream {
            ConsoleStream::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
                out.flush()?;
            }
            ConsoleStream::Stderr => {
                let mut out = std::io::stderr().lock();
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        match self.stream {
            ConsoleStream::Stdout => std::io::stdout().flush()?,
            ConsoleStream::Stderr => std::io::stderr().flush()?,
        }
        Ok(())
    }
}

/// Keeps encoded lines in memory
pub struct MemorySink {
    name: String,
    min_level: LogLevel,
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Capture every level
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_level(name, LogLevel::Debug)
    }

    /// Capture records at or above `min_level`
    pub fn with_level(name: impl Into<String>, min_level: LogLevel) -> Self {
        Self {
            name: name.into(),
            min_level,
            lines: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of captured lines
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Captured lines decoded back into records
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        self.lines
            .lock()
            .iter()
            .map(|line| serde_json::from_str(line).map_err(GatewayError::from))
            .collect()
    }

    /// Number of captured lines
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// Whether nothing was captured
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_level(&self) -> LogLevel {
        self.min_level
    }

    fn write_line(&self, line: &str) -> Result<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogFields;

    #[test]
    fn memory_sink_round_trips_records() {
        let sink = MemorySink::new("mem");
        let record = LogRecord::new(LogLevel::Info, "hello", LogFields::new().with("k", "v"));
        sink.write_line(&RecordFormat::Json.encode(&record).unwrap()).unwrap();

        assert_eq!(sink.len(), 1);
        let records = sink.records().unwrap();
        assert_eq!(records[0].message, "hello");
        assert_eq!(records[0].fields, record.fields);
    }

    #[test]
    fn human_format_is_single_line() {
        let record = LogRecord::new(
            LogLevel::Error,
            "boom\nINFO forged",
            LogFields::new().with("code", 7),
        );
        let line = RecordFormat::Human.encode(&record).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains(r"ERROR boom\nINFO forged code=7"));
    }

    #[test]
    fn console_sink_settings() {
        let sink = ConsoleSink::from_settings(&ConsoleSinkSettings {
            enabled: true,
            stream: ConsoleStream::Stderr,
            format: RecordFormat::Human,
            min_level: LogLevel::Warn,
        });
        assert_eq!(sink.name(), "stderr");
        assert_eq!(sink.format(), RecordFormat::Human);
        assert_eq!(sink.min_level(), LogLevel::Warn);
        assert!(sink.rotate().unwrap().is_none());
    }
}
