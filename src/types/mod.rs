//! Core data types shared across the gateway

pub mod log_record;

pub use log_record::{FieldValue, LogFields, LogLevel, LogRecord};
