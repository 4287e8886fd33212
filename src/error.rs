//! Error types for the step-execution engine
//!
//! Engine operations (persistence, discovery, configuration) return
//! [`EngineError`]. Collaborator code such as step bodies, pause conditions
//! and evidence sinks keeps using `anyhow::Result`; those errors are carried
//! through untouched and never folded into this enum.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A lock file exists but its content cannot be decoded
    #[error("Corrupt lock file {}: {reason}", path.display())]
    LockCorrupt { path: PathBuf, reason: String },

    /// No lock file exists for the requested name
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A test case registered an invalid or duplicate step
    #[error("Invalid step registration: {0}")]
    InvalidStep(String),

    /// Lock discovery pattern could not be built
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Report generation failed
    #[error("Report error: {0}")]
    Report(String),
}

impl EngineError {
    /// Create a serialization error
    pub fn serialization<E: fmt::Display>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }

    /// Create a corrupt-lock error for the file at `path`
    pub fn corrupt<E: fmt::Display>(path: impl Into<PathBuf>, reason: E) -> Self {
        Self::LockCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a not found error
    pub fn not_found<E: fmt::Display>(name: E) -> Self {
        Self::LockNotFound(name.to_string())
    }

    /// Create a configuration error
    pub fn config<E: fmt::Display>(msg: E) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an invalid step error
    pub fn invalid_step<E: fmt::Display>(msg: E) -> Self {
        Self::InvalidStep(msg.to_string())
    }

    /// Create a report error
    pub fn report<E: fmt::Display>(msg: E) -> Self {
        Self::Report(msg.to_string())
    }

    /// Check if this error means a lock file could not be decoded
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::LockCorrupt { .. })
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::LockNotFound(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err)
    }
}

impl From<glob::PatternError> for EngineError {
    fn from(err: glob::PatternError) -> Self {
        Self::InvalidPattern(err.to_string())
    }
}

impl From<csv::Error> for EngineError {
    fn from(err: csv::Error) -> Self {
        Self::report(err)
    }
}
