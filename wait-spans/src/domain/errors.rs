//! Structured error types for wait-spans
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these ever cross the scheduler's notification path: producer-side
//! failures are counted and logged by [`crate::diagnostics`] instead.

use thiserror::Error;

/// Failures of the stack-capture facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The facade never reached `Initialized`; permanent for the process
    #[error("Stack capture is not available in this process")]
    NotAvailable,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Native stack walker returned error {0}")]
    Native(i32),
}

/// Misuse of the mount-event registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Provided callback has already been registered")]
    DuplicateCallback,

    #[error("Provided callback has not been registered")]
    UnknownCallback,

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Reasons a publish attempt was rejected
///
/// Both are expected under load or during shutdown and only ever counted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Event channel is full, record dropped")]
    Full,

    #[error("Event channel is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Channel capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("Marker table capacity must be a non-zero power of two, got {0}")]
    InvalidMarkerCapacity(usize),

    #[error("Maximum stack depth must be greater than zero")]
    InvalidDepth,

    #[error("Invalid deny pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum WaitSpanError {
    #[error("Another wait-span emitter is already active in this process")]
    AlreadyActive,

    #[error("Mount events are not supported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Failed to spawn wait-span worker: {0}")]
    Spawn(#[source] std::io::Error),
}
