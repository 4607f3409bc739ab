//! Failure counters for the wait-span pipeline
//!
//! The producer path runs inside the scheduler's park/unpark notification and
//! may neither lock nor propagate errors, so every failure there is reduced to
//! a relaxed counter increment. The first occurrence of each kind is logged;
//! later ones are only counted.

use log::warn;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::domain::{CaptureError, ChannelError};

/// Producer- and consumer-side failure kinds that are logged at most once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ChannelFull,
    ChannelClosed,
    CaptureFailed,
    CallbackPanicked,
    MarkerTableFull,
}

const KIND_COUNT: usize = 5;

impl FailureKind {
    fn index(self) -> usize {
        self as usize
    }
}

/// Atomic counters plus one warn-once latch per [`FailureKind`]
pub struct Diagnostics {
    dropped_full: AtomicU64,
    dropped_closed: AtomicU64,
    capture_failures: AtomicU64,
    callback_panics: AtomicU64,
    markers_dropped: AtomicU64,
    published: AtomicU64,
    spans_emitted: AtomicU64,
    records_suppressed: AtomicU64,
    records_discarded: AtomicU64,
    warned: [AtomicBool; KIND_COUNT],
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Records dropped because every slot was occupied
    pub dropped_full: u64,
    /// Records dropped because shutdown had begun
    pub dropped_closed: u64,
    pub capture_failures: u64,
    pub callback_panics: u64,
    /// Blocking intervals lost because the marker table had no free slot
    pub markers_dropped: u64,
    pub published: u64,
    pub spans_emitted: u64,
    /// Records whose stack had no frame outside the deny list
    pub records_suppressed: u64,
    /// Records drained with processing switched off
    pub records_discarded: u64,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dropped_full: AtomicU64::new(0),
            dropped_closed: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            callback_panics: AtomicU64::new(0),
            markers_dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
            spans_emitted: AtomicU64::new(0),
            records_suppressed: AtomicU64::new(0),
            records_discarded: AtomicU64::new(0),
            warned: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    /// Returns true exactly once per kind for the lifetime of this instance
    fn first_occurrence(&self, kind: FailureKind) -> bool {
        !self.warned[kind.index()].swap(true, Ordering::Relaxed)
    }

    pub fn record_publish_failure(&self, error: ChannelError) {
        let kind = match error {
            ChannelError::Full => {
                self.dropped_full.fetch_add(1, Ordering::Relaxed);
                FailureKind::ChannelFull
            }
            ChannelError::Closed => {
                self.dropped_closed.fetch_add(1, Ordering::Relaxed);
                FailureKind::ChannelClosed
            }
        };
        if self.first_occurrence(kind) {
            warn!("{error}; further occurrences are only counted");
        }
    }

    pub fn record_capture_failure(&self, error: &CaptureError) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
        if self.first_occurrence(FailureKind::CaptureFailed) {
            warn!("Failed to capture blocking stack: {error}; further occurrences are only counted");
        }
    }

    pub fn record_callback_panic(&self, message: &str) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
        if self.first_occurrence(FailureKind::CallbackPanicked) {
            warn!("Mount callback panicked: {message}; further panics are only counted");
        }
    }

    pub fn record_marker_dropped(&self) {
        self.markers_dropped.fetch_add(1, Ordering::Relaxed);
        if self.first_occurrence(FailureKind::MarkerTableFull) {
            warn!("Blocking marker table is full, interval dropped; further occurrences are only counted");
        }
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.spans_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed(&self) {
        self.records_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.records_discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            markers_dropped: self.markers_dropped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            spans_emitted: self.spans_emitted.load(Ordering::Relaxed),
            records_suppressed: self.records_suppressed.load(Ordering::Relaxed),
            records_discarded: self.records_discarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract a printable message from a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
