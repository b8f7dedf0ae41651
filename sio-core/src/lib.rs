//! sio-core - Foundation types, error handling, configuration, and logging.
//!
//! This crate provides the shared foundation used by the client crate:
//! - Client configuration (handshake, reconnection, heartbeat, acknowledgements)
//! - A single error type covering every failure category
//! - Structured logging with tracing
//! - Protocol constants

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;

// Re-export commonly used items at the crate root
pub use config::ClientConfig;
pub use error::{SioError, SioResult};
pub use logging::{init_console_logging, init_from_config, LogGuard};
