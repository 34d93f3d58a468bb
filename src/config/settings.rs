//! Configuration structures for wsgate

use crate::logger::RecordFormat;
use crate::types::LogLevel;
use crate::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable prefix used by [`ServerConfig::load`]
pub const ENV_PREFIX: &str = "WSGATE";

/// Suffix appended to the executable path to derive the default log file
pub const LOG_FILE_SUFFIX: &str = ".log";

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listener settings
    pub server: ServerSettings,
    /// WebSocket gateway settings
    pub gateway: GatewaySettings,
    /// Event logger settings
    pub logging: LoggingSettings,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the listener binds to
    pub bind_address: String,
    /// Route accepting form-encoded `msg` posts
    pub message_route: String,
    /// Seconds to wait for open connections to finish closing on shutdown
    pub shutdown_timeout_seconds: u64,
}

/// WebSocket gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Upgrade endpoint path
    pub endpoint: String,
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// Whether binary frames are delivered (otherwise they close the connection)
    pub binary_messages: bool,
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
}

/// Event logger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Records below this level are dropped before reaching any sink
    pub min_level: LogLevel,
    /// Console sink
    pub console: ConsoleSinkSettings,
    /// Rotating file sink
    pub file: FileSinkSettings,
}

/// Which standard stream the console sink writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// Console sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSinkSettings {
    /// Enable the console sink
    pub enabled: bool,
    /// Output stream
    pub stream: ConsoleStream,
    /// Line format
    pub format: RecordFormat,
    /// Minimum level written by this sink
    pub min_level: LogLevel,
}

/// File sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSinkSettings {
    /// Enable the file sink
    pub enabled: bool,
    /// Log file path; defaults to the executable path plus `.log`
    pub path: Option<PathBuf>,
    /// Line format
    pub format: RecordFormat,
    /// Minimum level written by this sink
    pub min_level: LogLevel,
    /// Rotate before a write would grow the file past this many bytes (0 disables)
    pub max_file_size: u64,
    /// Rotation and retention
    pub rotation: RotationSettings,
}

/// Log rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    /// Rotate when the process receives SIGHUP
    pub on_signal: bool,
    /// Number of archived files to keep (0 keeps all)
    pub keep_files: u32,
    /// Maximum age of archived files in hours (0 keeps all)
    pub max_age_hours: u32,
    /// Compress archives after rotation
    pub compression: bool,
    /// Compression algorithm (gzip, lz4)
    pub compression_algorithm: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            message_route: "/msg".to_string(),
            shutdown_timeout_seconds: 5,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            endpoint: "/ws".to_string(),
            max_message_size: 4096,
            binary_messages: true,
            outbound_buffer: 64,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            console: ConsoleSinkSettings::default(),
            file: FileSinkSettings::default(),
        }
    }
}

impl Default for ConsoleSinkSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            stream: ConsoleStream::Stdout,
            format: RecordFormat::Json,
            min_level: LogLevel::Debug,
        }
    }
}

impl Default for FileSinkSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            format: RecordFormat::Json,
            min_level: LogLevel::Debug,
            max_file_size: 100 * 1024 * 1024, // 100MB
            rotation: RotationSettings::default(),
        }
    }
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            on_signal: true,
            keep_files: 0,
            max_age_hours: 0,
            compression: false,
            compression_algorithm: "gzip".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration by layering defaults, an optional TOML file and
    /// `WSGATE__SECTION__KEY` environment variables, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&ServerConfig::default())
            .map_err(|e| GatewayError::Config(format!("Failed to encode defaults: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
            );
        }

        let config: ServerConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|e| GatewayError::Config(format!("Invalid bind address: {}", e)))?;

        if !self.server.message_route.starts_with('/') {
            return Err(GatewayError::Config("Message route must start with '/'".to_string()));
        }
        if self.gateway.endpoint.is_empty() || !self.gateway.endpoint.starts_with('/') {
            return Err(GatewayError::Config("Endpoint must start with '/'".to_string()));
        }
        if self.gateway.endpoint == self.server.message_route {
            return Err(GatewayError::Config(
                "Endpoint and message route must differ".to_string(),
            ));
        }
        if self.gateway.max_message_size == 0 {
            return Err(GatewayError::Config("Max message size must be positive".to_string()));
        }
        if self.gateway.outbound_buffer == 0 {
            return Err(GatewayError::Config("Outbound buffer must be positive".to_string()));
        }
        if !self.logging.console.enabled && !self.logging.file.enabled {
            return Err(GatewayError::Config("At least one sink must be enabled".to_string()));
        }

        let algorithm = self.logging.file.rotation.compression_algorithm.as_str();
        if !matches!(algorithm, "gzip" | "lz4") {
            return Err(GatewayError::Config(format!(
                "Unknown compression algorithm: {}",
                algorithm
            )));
        }
        Ok(())
    }

    /// Parsed bind address; call after [`ServerConfig::validate`]
    pub fn bind_address(&self) -> Result<SocketAddr> {
        self.server
            .bind_address
            .parse()
            .map_err(|e| GatewayError::Config(format!("Invalid bind address: {}", e)))
    }
}

impl FileSinkSettings {
    /// The configured path, or the executable-derived default
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(default_log_path)
    }
}

/// `<current executable path>.log`, falling back to `wsgate.log` in the
/// working directory when the executable cannot be resolved.
pub fn default_log_path() -> PathBuf {
    match std::env::current_exe() {
        Ok(exe) => {
            let mut path = exe.into_os_string();
            path.push(LOG_FILE_SUFFIX);
            PathBuf::from(path)
        }
        Err(e) => {
            eprintln!("current_exe() failed, logging to ./wsgate.log: {}", e);
            PathBuf::from(format!("wsgate{}", LOG_FILE_SUFFIX))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_observed_deployment() {
        let config = ServerConfig::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.gateway.endpoint, "/ws");
        assert_eq!(config.gateway.max_message_size, 4096);
        assert!(config.gateway.binary_messages);
        assert_eq!(config.logging.min_level, LogLevel::Debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.gateway.endpoint = "ws".to_string();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.gateway.max_message_size = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.logging.console.enabled = false;
        config.logging.file.enabled = false;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.server.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.logging.file.rotation.compression_algorithm = "zstd".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
max_message_size = 1024
binary_messages = false

[logging.file]
path = "/tmp/wsgate-test.log"
"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.gateway.max_message_size, 1024);
        assert!(!config.gateway.binary_messages);
        assert_eq!(config.gateway.endpoint, "/ws");
        assert_eq!(
            config.logging.file.resolved_path(),
            PathBuf::from("/tmp/wsgate-test.log")
        );
    }

    #[test]
    fn load_layers_file_over_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("layered.toml");
        std::fs::write(&path, "[server]\nbind_address = \"127.0.0.1:9000\"\n").unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:9000");
        assert_eq!(config.gateway.endpoint, "/ws");
    }

    #[test]
    fn load_layers_env_over_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env.toml");
        std::fs::write(
            &path,
            "[gateway]\nmax_message_size = 2048\n\n[logging.file.rotation]\nkeep_files = 3\n",
        )
        .unwrap();

        std::env::set_var("WSGATE__GATEWAY__MAX_MESSAGE_SIZE", "8192");
        std::env::set_var("WSGATE__LOGGING__FILE__ROTATION__KEEP_FILES", "7");
        let loaded = ServerConfig::load(Some(&path));
        std::env::remove_var("WSGATE__GATEWAY__MAX_MESSAGE_SIZE");
        std::env::remove_var("WSGATE__LOGGING__FILE__ROTATION__KEEP_FILES");

        let config = loaded.unwrap();
        assert_eq!(config.gateway.max_message_size, 8192);
        assert_eq!(config.logging.file.rotation.keep_files, 7);
        assert_eq!(config.gateway.endpoint, "/ws");
    }

    #[test]
    fn default_log_path_uses_executable() {
        let path = default_log_path();
        assert!(path.to_string_lossy().ends_with(LOG_FILE_SUFFIX));
        let exe = std::env::current_exe().unwrap();
        assert!(path.to_string_lossy().starts_with(&*exe.to_string_lossy()));
    }
}
