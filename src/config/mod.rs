//! Configuration management for wsgate

pub mod settings;

pub use settings::{
    default_log_path, ConsoleSinkSettings, ConsoleStream, FileSinkSettings, GatewaySettings,
    LoggingSettings, RotationSettings, ServerConfig, ServerSettings,
};
