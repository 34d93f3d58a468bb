//! # wsgate - WebSocket Gateway with Structured Event Logging
//!
//! wsgate accepts WebSocket connections, hands every inbound frame to
//! registered handlers, and records what happens through a structured,
//! multi-sink event logger whose file output can be rotated at runtime.
//!
//! ## Features
//!
//! - **Tee'd logging**: one record fans out to console, file and in-memory sinks
//! - **Live rotation**: SIGHUP archives the log file and reopens it without losing records
//! - **Connection gateway**: per-connection ordered dispatch, size and type policies
//! - **Exactly-once lifecycle**: connect and disconnect callbacks fire once per connection
//!
//! ## Quick Start
//!
//! ### Logger
//! ```no_run
//! use std::sync::Arc;
//! use wsgate::logger::{ConsoleSink, EventLogger};
//! use wsgate::types::{LogFields, LogLevel};
//!
//! let logger = EventLogger::builder()
//!     .sink(Arc::new(ConsoleSink::stdout()))
//!     .build();
//!
//! logger.log(
//!     LogLevel::Info,
//!     "Failed to fetch URL.404",
//!     LogFields::new().with("url", "http://example.com").with("attempt", 10),
//! );
//! ```
//!
//! ### Gateway
//! ```no_run
//! use wsgate::config::ServerConfig;
//! use wsgate::server::GatewayServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::load(None)?;
//!     let server = GatewayServer::new(config)?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod logger;
pub mod server;
pub mod types;

/// Common error types used throughout wsgate
pub mod error {
    use std::fmt;

    /// wsgate error types
    #[derive(Debug)]
    pub enum GatewayError {
        /// I/O operation failed
        Io(std::io::Error),
        /// Serialization/deserialization failed
        Serde(serde_json::Error),
        /// Configuration error
        Config(String),
        /// A sink could not accept a record
        Sink(String),
        /// Log rotation failed
        Rotation(String),
        /// Server error
        Server(String),
    }

    impl fmt::Display for GatewayError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                GatewayError::Io(e) => write!(f, "I/O error: {}", e),
                GatewayError::Serde(e) => write!(f, "Serialization error: {}", e),
                GatewayError::Config(e) => write!(f, "Configuration error: {}", e),
                GatewayError::Sink(e) => write!(f, "Sink error: {}", e),
                GatewayError::Rotation(e) => write!(f, "Rotation error: {}", e),
                GatewayError::Server(e) => write!(f, "Server error: {}", e),
            }
        }
    }

    impl std::error::Error for GatewayError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            match self {
                GatewayError::Io(e) => Some(e),
                GatewayError::Serde(e) => Some(e),
                _ => None,
            }
        }
    }

    impl From<std::io::Error> for GatewayError {
        fn from(err: std::io::Error) -> Self {
            GatewayError::Io(err)
        }
    }

    impl From<serde_json::Error> for GatewayError {
        fn from(err: serde_json::Error) -> Self {
            GatewayError::Serde(err)
        }
    }

    /// Result type alias for wsgate operations
    pub type Result<T> = std::result::Result<T, GatewayError>;
}

pub use error::{GatewayError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::logger::{ConsoleSink, EventLogger, FileSink, MemorySink, Sink};
    pub use crate::server::{
        CloseReason, Connection, ConnectionGateway, ConnectionId, ConnectionState,
        GatewayServer, RotationController,
    };
    pub use crate::types::{FieldValue, LogFields, LogLevel, LogRecord};
    pub use crate::{GatewayError, Result};
}
