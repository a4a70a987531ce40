//! Error types for service observability

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or driving instrumentation
#[derive(Error, Debug)]
pub enum Error {
    /// Metrics sink error (e.g. duplicate instrument registration)
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No free port in the probe range
    #[error("No available ports found in {start}..{start}+{attempts}")]
    PortExhausted { start: u16, attempts: u16 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Query Builder Errors
    // =========================================================================
    /// Identifier rejected by the query builder
    #[error(
        "Invalid identifier '{0}'. Must start with letter or underscore and contain only letters, numbers, and underscores."
    )]
    InvalidIdentifier(String),

    /// SQL dialect not supported by the query builder
    #[error("Unsupported dialect: {0}")]
    UnsupportedDialect(String),

    /// Required input was empty
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
