//! Error handling for bioview-rs
//!
//! This module defines the crate error type and a Result alias used by the
//! hardware boundary, configuration loading and the worker lifecycle.

use thiserror::Error;

/// Main error type for bioview-rs operations
#[derive(Error, Debug)]
pub enum BioviewError {
    /// Errors reported by a radio backend (stream, tuning, sensors)
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Errors related to configuration loading/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection-fatal errors (clock lock, channel mismatch, missing device)
    #[error("Connection error on {device}: {message}")]
    Connection { device: String, message: String },

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// Errors raised while demodulating a single source
    #[error("Processing error: {0}")]
    Processing(String),

    /// Operation not valid in the current connection state
    #[error("Invalid state: {0}")]
    State(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<BioviewError>,
    },
}

impl BioviewError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        BioviewError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Build a connection-fatal error for a named device
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        BioviewError::Connection {
            device: device.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for BioviewError {
    fn from(err: serde_json::Error) -> Self {
        BioviewError::Serialization(err.to_string())
    }
}

/// Result type alias for bioview-rs operations
pub type Result<T> = std::result::Result<T, BioviewError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
