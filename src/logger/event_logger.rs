//! Structured event logger that tees records to every registered sink

use super::file_sink::FileSink;
use super::sink::{ConsoleSink, RecordFormat, Sink};
use crate::config::LoggingSettings;
use crate::types::{LogFields, LogLevel, LogRecord};
use crate::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

struct SinkSlot {
    sink: Arc<dyn Sink>,
    written: AtomicU64,
    failures: AtomicU64,
}

/// Per-sink delivery counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkStats {
    /// Sink name
    pub name: String,
    /// Records accepted by the sink
    pub written: u64,
    /// Records the sink failed to accept
    pub failures: u64,
}

/// Builder for [`EventLogger`]
pub struct EventLoggerBuilder {
    sinks: Vec<Arc<dyn Sink>>,
    min_level: LogLevel,
    stamp_process: bool,
}

impl EventLoggerBuilder {
    /// Register a sink; sinks receive records in registration order
    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Drop records below `level` before they reach any sink
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Stamp records with the process id and hostname (on by default)
    pub fn stamp_process(mut self, enabled: bool) -> Self {
        self.stamp_process = enabled;
        self
    }

    /// Finish building
    pub fn build(self) -> EventLogger {
        let (pid, hostname) = if self.stamp_process {
            let hostname = gethostname::gethostname().to_string_lossy().to_string();
            (Some(std::process::id()), Some(hostname))
        } else {
            (None, None)
        };

        EventLogger {
            sinks: self
                .sinks
                .into_iter()
                .map(|sink| SinkSlot {
                    sink,
                    written: AtomicU64::new(0),
                    failures: AtomicU64::new(0),
                })
                .collect(),
            min_level: self.min_level,
            pid,
            hostname,
        }
    }
}

/// Long-lived logger shared by reference across the process.
///
/// `log` never fails and never panics into the caller: a sink error is
/// counted and reported on the diagnostics channel, and delivery continues
/// with the remaining sinks. Each sink sees one caller's records in the
/// order that caller issued them.
pub struct EventLogger {
    sinks: Vec<SinkSlot>,
    min_level: LogLevel,
    pid: Option<u32>,
    hostname: Option<String>,
}

impl EventLogger {
    /// Start building a logger
    pub fn builder() -> EventLoggerBuilder {
        EventLoggerBuilder {
            sinks: Vec::new(),
            min_level: LogLevel::Debug,
            stamp_process: true,
        }
    }

    /// Open the configured sinks. The file sink is also returned so that a
    /// rotation controller can drive it.
    pub fn from_settings(settings: &LoggingSettings) -> Result<(Self, Option<Arc<FileSink>>)> {
        let mut builder = Self::builder().min_level(settings.min_level);

        let file = if settings.file.enabled {
            let sink = Arc::new(FileSink::from_settings(&settings.file)?);
            builder = builder.sink(sink.clone());
            Some(sink)
        } else {
            None
        };

        if settings.console.enabled {
            builder = builder.sink(Arc::new(ConsoleSink::from_settings(&settings.console)));
        }

        Ok((builder.build(), file))
    }

    /// Log a message with specified level and fields
    pub fn log(&self, level: LogLevel, message: impl Into<String>, fields: LogFields) {
        if level < self.min_level {
            return;
        }
        let mut record = LogRecord::new(level, message, fields);
        record.pid = self.pid;
        record.hostname = self.hostname.clone();
        self.dispatch(&record);
    }

    /// Deliver an already built record as-is
    pub fn log_record(&self, record: &LogRecord) {
        if record.level >= self.min_level {
            self.dispatch(record);
        }
    }

    fn dispatch(&self, record: &LogRecord) {
        let mut json: Option<String> = None;
        let mut human: Option<String> = None;

        for slot in &self.sinks {
            if record.level < slot.sink.min_level() {
                continue;
            }

            let format = slot.sink.format();
            let cache = match format {
                RecordFormat::Json => &mut json,
                RecordFormat::Human => &mut human,
            };
            if cache.is_none() {
                match format.encode(record) {
                    Ok(line) => *cache = Some(line),
                    Err(e) => {
                        self.report_failure(slot, &e.to_string());
                        continue;
                    }
                }
            }
            let line = cache.as_deref().unwrap_or_default();

            match catch_unwind(AssertUnwindSafe(|| slot.sink.write_line(line))) {
                Ok(Ok(())) => {
                    slot.written.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => self.report_failure(slot, &e.to_string()),
                Err(_) => self.report_failure(slot, "sink panicked"),
            }
        }
    }

    fn report_failure(&self, slot: &SinkSlot, error: &str) {
        let failures = slot.failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(sink = slot.sink.name(), failures, error, "log sink write failed");
    }

    /// Log a debug message
    pub fn debug<S: Into<String>>(&self, message: S) {
        self.log(LogLevel::Debug, message, LogFields::new());
    }

    /// Log an info message
    pub fn info<S: Into<String>>(&self, message: S) {
        self.log(LogLevel::Info, message, LogFields::new());
    }

    /// Log an info message with fields
    pub fn info_with_fields<S: Into<String>>(&self, message: S, fields: LogFields) {
        self.log(LogLevel::Info, message, fields);
    }

    /// Log a warning message
    pub fn warn<S: Into<String>>(&self, message: S) {
        self.log(LogLevel::Warn, message, LogFields::new());
    }

    /// Log a warning message with fields
    pub fn warn_with_fields<S: Into<String>>(&self, message: S, fields: LogFields) {
        self.log(LogLevel::Warn, message, fields);
    }

    /// Log an error message
    pub fn error<S: Into<String>>(&self, message: S) {
        self.log(LogLevel::Error, message, LogFields::new());
    }

    /// Log an error message with fields
    pub fn error_with_fields<S: Into<String>>(&self, message: S, fields: LogFields) {
        self.log(LogLevel::Error, message, fields);
    }

    /// Flush every sink; failures are reported like write failures
    pub fn flush(&self) {
        for slot in &self.sinks {
            if let Err(e) = slot.sink.flush() {
                warn!(sink = slot.sink.name(), error = %e, "log sink flush failed");
            }
        }
    }

    /// Delivery counters, in sink registration order
    pub fn sink_stats(&self) -> Vec<SinkStats> {
        self.sinks
            .iter()
            .map(|slot| SinkStats {
                name: slot.sink.name().to_string(),
                written: slot.written.load(Ordering::Relaxed),
                failures: slot.failures.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Number of registered sinks
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        self.flush();
    }
}
