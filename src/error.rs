//! Error handling for rowflow
//!
//! This module defines the engine error type and a Result alias for use
//! throughout the crate. Blocking conditions (full/empty channels), pushes
//! into a closed channel and lookups of unknown keys are *not* errors and
//! never surface here.

use thiserror::Error;

/// Main error type for rowflow operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// A catalog-style registry already holds this key
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// No free port left in the configured range for a host
    #[error("No free port on host {host} in range starting at {start} (size {size})")]
    PortRangeExhausted { host: String, start: u16, size: u16 },

    /// A hop or lookup referenced a step that does not exist
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// The pipeline definition cannot be executed
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// A step failed while initialising or processing rows
    #[error("Step '{step}' failed: {message}")]
    Step { step: String, message: String },

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Thread spawn or join failures
    #[error("Thread error: {0}")]
    Thread(String),

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
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a step failure
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Step {
            step: step.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Result type alias for rowflow operations
pub type Result<T> = std::result::Result<T, EngineError>;

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

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| EngineError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| EngineError::Io(e).with_context(f()))
    }
}
