//! Domain model for wait-spans
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{BlockingSite, LogicalThreadId, MethodId, OwnerPath, Timestamp};

pub use errors::{CaptureError, ChannelError, ConfigError, RegistryError, WaitSpanError};
