//! Error types for the Flowgate engine.

use thiserror::Error;

/// Main error type for Flowgate operations.
#[derive(Error, Debug)]
pub enum FlowGateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered settings could not be assembled
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// A component that spawns background tasks was built outside a tokio runtime
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Flowgate operations.
pub type Result<T> = std::result::Result<T, FlowGateError>;
