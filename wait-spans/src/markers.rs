//! # Blocking Markers
//!
//! "Blocking since T" per logical thread, shared by every carrier thread. A
//! scheduler may unmount a logical thread on one carrier and mount it on
//! another, and one carrier may host many logical threads, so the marker is
//! keyed by [`LogicalThreadId`] rather than held in a thread-local.
//!
//! Open addressing over a fixed table of atomic slots, searched linearly from
//! the thread's home slot through a bounded window:
//!
//! ```text
//!   key == EMPTY       never used; ends a search
//!   key == TOMBSTONE   marker taken; reusable, does not end a search
//!   key == id + 2      marker of logical thread `id`, `since` is valid
//! ```
//!
//! A slot never returns to `EMPTY`, so a search that reaches one has seen
//! every slot the key could occupy. Both operations for one logical thread
//! are ordered by the scheduler (a thread resumes only after it parked);
//! distinct threads only contend on the claiming CAS.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::{ConfigError, LogicalThreadId, Timestamp};

/// Default number of marker slots
pub const DEFAULT_MARKER_CAPACITY: usize = 16384;

/// Slots searched from a thread's home slot before giving up
const SEARCH_WINDOW: usize = 64;

const EMPTY: u64 = 0;
const TOMBSTONE: u64 = 1;

/// Multiplier for Fibonacci hashing, 2^64 / golden ratio
const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;

struct MarkerSlot {
    key: AtomicU64,
    since: AtomicU64,
}

/// Lock-free, allocation-free map from logical thread to blocking start
pub struct BlockingMarkers {
    slots: Box<[MarkerSlot]>,
    mask: usize,
    window: usize,
}

/// Outcome of [`BlockingMarkers::mark`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marked {
    /// A new marker was stored
    Set,
    /// The thread already had a marker; the earlier one is kept
    Kept,
    /// No free slot in the thread's window; nothing was stored
    Full,
}

impl BlockingMarkers {
    /// Table with `capacity` slots
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidMarkerCapacity`] unless `capacity` is a
    /// non-zero power of two
    pub fn with_capacity(capacity: usize) -> Result<Self, ConfigError> {
        if !capacity.is_power_of_two() {
            return Err(ConfigError::InvalidMarkerCapacity(capacity));
        }
        let slots = (0..capacity)
            .map(|_| MarkerSlot { key: AtomicU64::new(EMPTY), since: AtomicU64::new(0) })
            .collect();
        Ok(Self { slots, mask: capacity - 1, window: capacity.min(SEARCH_WINDOW) })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Ids whose encoding would collide with the reserved keys are not tracked
    fn key(thread: LogicalThreadId) -> Option<u64> {
        thread.0.checked_add(2)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn home(&self, key: u64) -> usize {
        (key.wrapping_mul(GOLDEN) >> 32) as usize & self.mask
    }

    fn window(&self, key: u64) -> impl Iterator<Item = &MarkerSlot> + '_ {
        let home = self.home(key);
        (0..self.window).map(move |i| &self.slots[(home + i) & self.mask])
    }

    fn find(&self, key: u64) -> Option<&MarkerSlot> {
        self.window(key)
            .map(|slot| (slot, slot.key.load(Ordering::Acquire)))
            .take_while(|(_, current)| *current != EMPTY)
            .find(|(_, current)| *current == key)
            .map(|(slot, _)| slot)
    }

    /// Record that `thread` started blocking at `since`
    ///
    /// A thread that is already marked keeps its first marker.
    pub fn mark(&self, thread: LogicalThreadId, since: Timestamp) -> Marked {
        let Some(key) = Self::key(thread) else {
            return Marked::Full;
        };
        if self.find(key).is_some() {
            return Marked::Kept;
        }
        for slot in self.window(key) {
            let mut current = slot.key.load(Ordering::Relaxed);
            while current == EMPTY || current == TOMBSTONE {
                match slot.key.compare_exchange_weak(current, key, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => {
                        slot.since.store(since.0, Ordering::Release);
                        return Marked::Set;
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        Marked::Full
    }

    /// Remove and return the marker of `thread`, if it has one
    pub fn take(&self, thread: LogicalThreadId) -> Option<Timestamp> {
        let key = Self::key(thread)?;
        let slot = self.find(key)?;
        let since = slot.since.load(Ordering::Acquire);
        slot.key.store(TOMBSTONE, Ordering::Release);
        Some(Timestamp(since))
    }

    /// Number of logical threads currently marked
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.key.load(Ordering::Relaxed) > TOMBSTONE).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
