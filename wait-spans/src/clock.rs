//! Span-anchored clock
//!
//! Blocking intervals are measured with a monotonic clock, but spans carry
//! wall-clock timestamps. Converting each monotonic timestamp with its own
//! `SystemTime::now()` would let NTP steps reorder a wait span against its
//! parent. Instead every parent span gets one anchor, a pair of
//! (epoch time, monotonic time) taken together, and all of its wait spans are
//! placed relative to that pair.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use crate::domain::Timestamp;

/// Default number of span anchors retained before the table is reset
pub const DEFAULT_MAX_ANCHORS: usize = 4096;

/// Epoch and monotonic readings taken at the same instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockAnchor {
    pub epoch: SystemTime,
    pub mono: Timestamp,
}

impl ClockAnchor {
    /// Epoch time of a monotonic timestamp relative to this anchor
    ///
    /// Monotonic in `t`: a later timestamp never maps to an earlier epoch.
    #[must_use]
    pub fn to_epoch(&self, t: Timestamp) -> SystemTime {
        if t >= self.mono {
            self.epoch + Duration::from_nanos(t.0 - self.mono.0)
        } else {
            let back = Duration::from_nanos(self.mono.0 - t.0);
            self.epoch.checked_sub(back).unwrap_or(SystemTime::UNIX_EPOCH)
        }
    }
}

/// Monotonic scheduler clock plus per-span epoch anchors
pub struct SpanAnchoredClock {
    origin: Instant,
    anchors: Mutex<HashMap<u64, ClockAnchor>>,
    max_anchors: usize,
}

impl SpanAnchoredClock {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_anchors(DEFAULT_MAX_ANCHORS)
    }

    #[must_use]
    pub fn with_max_anchors(max_anchors: usize) -> Self {
        Self { origin: Instant::now(), anchors: Mutex::new(HashMap::new()), max_anchors: max_anchors.max(1) }
    }

    /// Monotonic nanoseconds since this clock was created; lock-free
    pub fn nanos(&self) -> Timestamp {
        let elapsed = self.origin.elapsed().as_nanos();
        Timestamp(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    /// A fresh anchor for the current instant
    pub fn anchor_now(&self) -> ClockAnchor {
        ClockAnchor { epoch: SystemTime::now(), mono: self.nanos() }
    }

    /// Pin the anchor of a span at its start
    ///
    /// Keeps an existing anchor: an anchor never changes while retained.
    pub fn on_span_start(&self, key: u64) {
        self.anchor_for(key);
    }

    /// The anchor of a span, established now if the span has none yet
    pub fn anchor_for(&self, key: u64) -> ClockAnchor {
        let mut anchors = self.anchors.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(anchor) = anchors.get(&key) {
            return *anchor;
        }
        if anchors.len() >= self.max_anchors {
            anchors.clear();
        }
        let anchor = self.anchor_now();
        anchors.insert(key, anchor);
        anchor
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for SpanAnchoredClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos_is_monotonic() {
        let clock = SpanAnchoredClock::new();
        let a = clock.nanos();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.nanos();
        assert!(b.saturating_since(a) >= 2_000_000);
    }

    #[test]
    fn test_to_epoch_preserves_deltas() {
        let epoch = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let anchor = ClockAnchor { epoch, mono: Timestamp(5_000) };

        assert_eq!(anchor.to_epoch(Timestamp(5_000)), epoch);
        assert_eq!(anchor.to_epoch(Timestamp(7_500)), epoch + Duration::from_nanos(2_500));
        assert_eq!(anchor.to_epoch(Timestamp(1_000)), epoch - Duration::from_nanos(4_000));
    }

    #[test]
    fn test_to_epoch_is_monotonic() {
        let anchor = ClockAnchor { epoch: SystemTime::now(), mono: Timestamp(1_000_000) };
        let mut last = anchor.to_epoch(Timestamp(0));
        for t in (0..3_000_000u64).step_by(250_000) {
            let epoch = anchor.to_epoch(Timestamp(t));
            assert!(epoch >= last);
            last = epoch;
        }
    }

    #[test]
    fn test_anchor_is_stable_per_span() {
        let clock = SpanAnchoredClock::new();
        clock.on_span_start(42);
        let first = clock.anchor_for(42);
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(clock.anchor_for(42), first);
        assert_ne!(clock.anchor_for(43), first);
    }

    #[test]
    fn test_anchor_table_is_bounded() {
        let clock = SpanAnchoredClock::with_max_anchors(4);
        for key in 0..4 {
            clock.on_span_start(key);
        }
        assert_eq!(clock.anchor_count(), 4);
        clock.on_span_start(99);
        assert_eq!(clock.anchor_count(), 1);
    }
}
