//! Configuration surface consumed by the wait-span pipeline
//!
//! Values only: the embedding application decides where they come from. A
//! JSON document (string or file) is supported for convenience; every field is
//! optional and falls back to the defaults below.
//!
//! ```json
//! {
//!   "min_span_duration_nanos": 5000000,
//!   "channel_capacity": 1024,
//!   "max_stack_depth": 32,
//!   "marker_capacity": 16384,
//!   "deny_patterns": ["<?my_runtime::.*", ".*park.*"]
//! }
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::domain::ConfigError;
use crate::markers::DEFAULT_MARKER_CAPACITY;
use crate::resolver::DenyList;

/// Default number of preallocated record slots
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default number of frames captured per blocking interval
pub const DEFAULT_MAX_STACK_DEPTH: usize = 32;

/// Deny patterns for frames that never make a useful blocking site.
///
/// Matched against `owner::method` in order, first match wins. The optional
/// leading `<` covers trait-impl paths such as
/// `<wait_spans::scheduler::MountOnDrop as core::ops::drop::Drop>::drop`.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    // Stack walker internals
    r"backtrace::.*",
    // Our own delivery path: scheduler hook, registry, emitter, channel
    r"<?wait_spans::.*",
    // Synchronization primitive and OS internals
    r"<?std::sys::.*",
    r"<?std::sync::.*",
    r"<?parking_lot(_core)?::.*",
    r"<?crossbeam(_\w+)?::.*",
    // Unwind guards, drop glue and closure shims between callback and caller
    r"<?(std|core)::panic.*",
    r"<?core::ptr::drop_in_place.*",
    r"<?core::ops::function::.*",
    r"<?alloc::boxed::Box<.*> as core::ops::function::.*",
    // Future completion and executor internals
    r"<?futures(_\w+)?::.*",
    r"<?tokio::runtime::.*",
    r".*park.*",
];

/// Wait-span pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Blocking intervals shorter than this never produce a record
    #[serde(rename = "min_span_duration_nanos", with = "duration_nanos")]
    pub min_span_duration: Duration,

    /// Number of record slots, must be a power of two
    pub channel_capacity: usize,

    /// Maximum number of frames captured per record
    pub max_stack_depth: usize,

    /// Logical threads that can be blocked at once, must be a power of two
    pub marker_capacity: usize,

    /// Extra frames to skip at the top of each captured stack
    pub skip_frames: usize,

    /// Ordered deny list applied when naming blocking sites
    pub deny_patterns: Vec<String>,

    /// How long the consumer sleeps once the channel is drained
    #[serde(rename = "idle_sleep_nanos", with = "duration_nanos")]
    pub idle_sleep: Duration,

    /// Empty polls the consumer spins through before sleeping
    pub spin_tries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_span_duration: Duration::ZERO,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            marker_capacity: DEFAULT_MARKER_CAPACITY,
            skip_frames: 0,
            deny_patterns: DEFAULT_DENY_PATTERNS.iter().map(|p| (*p).to_string()).collect(),
            idle_sleep: Duration::from_millis(1),
            spin_tries: 1,
        }
    }
}

impl Config {
    /// Parse a JSON configuration document
    ///
    /// # Errors
    /// Returns an error if the document is not valid JSON, has unknown fields,
    /// or fails [`Config::validate`]
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or [`Config::from_json_str`] fails
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    #[must_use]
    pub fn with_min_span_duration(mut self, duration: Duration) -> Self {
        self.min_span_duration = duration;
        self
    }

    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_max_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth;
        self
    }

    #[must_use]
    pub fn with_marker_capacity(mut self, capacity: usize) -> Self {
        self.marker_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_skip_frames(mut self, skip: usize) -> Self {
        self.skip_frames = skip;
        self
    }

    #[must_use]
    pub fn with_deny_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    /// Minimum span duration in scheduler-clock nanoseconds
    #[must_use]
    pub fn min_span_duration_nanos(&self) -> u64 {
        u64::try_from(self.min_span_duration.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Check every value the pipeline relies on
    ///
    /// # Errors
    /// Returns the first invalid setting found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.channel_capacity.is_power_of_two() {
            return Err(ConfigError::InvalidCapacity(self.channel_capacity));
        }
        if self.max_stack_depth == 0 {
            return Err(ConfigError::InvalidDepth);
        }
        if !self.marker_capacity.is_power_of_two() {
            return Err(ConfigError::InvalidMarkerCapacity(self.marker_capacity));
        }
        DenyList::compile(&self.deny_patterns)?;
        Ok(())
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
