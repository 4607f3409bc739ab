//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep raw stack identifiers, logical thread ids and
//! monotonic timestamps from being mixed up in the producer path, where
//! everything is ultimately a `u64`.

use std::fmt;

/// Opaque method identifier captured from a call stack
///
/// The value is the instruction pointer (return address) of one frame. It
/// stays a valid handle for the whole process lifetime: once the code it
/// points into is gone (or was never part of the executable) resolution
/// simply reports "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MethodId(pub u64);

impl MethodId {
    /// Identifier used for unused slots in capture buffers
    pub const NONE: MethodId = MethodId(0);

    /// Returns true if this identifier can possibly be resolved
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Logical thread ID
///
/// Process-unique identifier of a schedulable unit of execution. This is NOT
/// the kernel TID: ids are handed out sequentially and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalThreadId(pub u64);

impl fmt::Display for LogicalThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LT#{}", self.0)
    }
}

/// Timestamp in nanoseconds on the monotonic scheduler clock
///
/// Only differences between two timestamps of the same clock are meaningful;
/// converting to wall-clock time goes through a span's clock anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Nanoseconds elapsed since `earlier`, zero if `earlier` is later
    #[must_use]
    pub fn saturating_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Convert to milliseconds (f64)
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.as_millis())
    }
}

/// Owning path of a resolved function
///
/// For `std::sync::mutex::Mutex<T>::lock` this is `std::sync::mutex::Mutex<T>`,
/// the closest thing a Rust symbol has to a declaring class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerPath(String);

impl OwnerPath {
    /// Create a new owner path (panics if empty)
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        assert!(!path.is_empty(), "Owner path cannot be empty");
        Self(path)
    }

    /// Get the owner path as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved blocking site: the frame a wait span is named after
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockingSite {
    pub owner: OwnerPath,
    pub method: String,
}

impl BlockingSite {
    /// Fully qualified label, e.g. `my_app::db::Pool::checkout`
    #[must_use]
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BlockingSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner, self.method)
    }
}
