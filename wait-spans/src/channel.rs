//! # Event Channel
//!
//! Bounded, preallocated multi-producer/single-consumer ring of reusable
//! slots. Producers run inside scheduler notifications, so publishing never
//! blocks, locks or allocates: a producer claims a slot with one CAS on the
//! tail, fills it in place and releases it with a store to the slot's
//! sequence number. A full ring rejects the record immediately.
//!
//! ```text
//!   slot.seq == pos          free, writable by the producer claiming `pos`
//!   slot.seq == pos + 1      published, readable by the consumer at `pos`
//!   slot.seq == pos + cap    consumed, writable again one lap later
//! ```
//!
//! Shutdown closes the channel, waits for producers already inside
//! [`EventChannel::try_publish`] to finish, and leaves everything published
//! so far for the consumer's final drain.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::domain::{ChannelError, ConfigError, MethodId, Timestamp};

/// One blocking interval, overwritten in place on every publish
#[derive(Debug)]
pub struct BlockingIntervalRecord<C> {
    /// Captured stack, innermost first; only `frame_count` entries are valid
    pub frames: Box<[MethodId]>,
    pub frame_count: usize,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Trace context active when the thread resumed
    pub parent: Option<C>,
}

impl<C> BlockingIntervalRecord<C> {
    #[must_use]
    pub fn with_depth(max_depth: usize) -> Self {
        Self {
            frames: vec![MethodId::NONE; max_depth].into_boxed_slice(),
            frame_count: 0,
            start: Timestamp::default(),
            end: Timestamp::default(),
            parent: None,
        }
    }

    pub fn frames(&self) -> &[MethodId] {
        &self.frames[..self.frame_count.min(self.frames.len())]
    }

    pub fn duration_nanos(&self) -> u64 {
        self.end.saturating_since(self.start)
    }
}

struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<T>,
}

/// Producer side of the ring, shared by every publishing thread
pub struct EventChannel<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    tail: AtomicUsize,
    closed: AtomicBool,
    active_producers: AtomicUsize,
}

// Slots are only touched by the producer that claimed them or by the single
// consumer after the producer's release store.
unsafe impl<T: Send> Sync for EventChannel<T> {}
unsafe impl<T: Send> Send for EventChannel<T> {}

/// Single consumer of an [`EventChannel`]; not cloneable
pub struct Consumer<T> {
    channel: Arc<EventChannel<T>>,
    head: usize,
}

/// Create a channel with `capacity` slots built by `factory`
///
/// # Errors
/// Returns [`ConfigError::InvalidCapacity`] unless `capacity` is a non-zero
/// power of two
pub fn bounded<T>(
    capacity: usize,
    mut factory: impl FnMut() -> T,
) -> Result<(Arc<EventChannel<T>>, Consumer<T>), ConfigError> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(ConfigError::InvalidCapacity(capacity));
    }
    let slots = (0..capacity)
        .map(|i| Slot { seq: AtomicUsize::new(i), value: UnsafeCell::new(factory()) })
        .collect();
    let channel = Arc::new(EventChannel {
        slots,
        mask: capacity - 1,
        tail: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
        active_producers: AtomicUsize::new(0),
    });
    let consumer = Consumer { channel: Arc::clone(&channel), head: 0 };
    Ok((channel, consumer))
}

/// Decrements the in-flight producer count on every exit path
struct ProducerGuard<'a>(&'a AtomicUsize);

impl Drop for ProducerGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Publishes a claimed slot even if `fill` unwinds
struct PublishGuard<'a> {
    seq: &'a AtomicUsize,
    value: usize,
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.seq.store(self.value, Ordering::Release);
    }
}

impl<T> EventChannel<T> {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Claim the next free slot, fill it in place and publish it
    ///
    /// Never blocks. `fill` receives the slot's previous contents and must
    /// overwrite every field it relies on.
    ///
    /// # Errors
    /// - [`ChannelError::Full`] if every slot is still waiting for the consumer
    /// - [`ChannelError::Closed`] once shutdown has begun
    pub fn try_publish(&self, fill: impl FnOnce(&mut T)) -> Result<(), ChannelError> {
        self.active_producers.fetch_add(1, Ordering::SeqCst);
        let _producer = ProducerGuard(&self.active_producers);
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }

        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            #[allow(clippy::cast_possible_wrap)]
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let _publish = PublishGuard { seq: &slot.seq, value: pos.wrapping_add(1) };
                        // SAFETY: the CAS gave this producer exclusive access
                        // to the slot until the release store in PublishGuard
                        fill(unsafe { &mut *slot.value.get() });
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(ChannelError::Full);
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Reject new records and wait for in-flight producers to finish
    ///
    /// Idempotent. Records published before this returns stay readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        while self.active_producers.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
    }
}

impl<T> Consumer<T> {
    pub fn channel(&self) -> &Arc<EventChannel<T>> {
        &self.channel
    }

    /// Hand the next published record to `handle`, if any
    pub fn poll(&mut self, handle: impl FnOnce(&mut T)) -> bool {
        let slot = &self.channel.slots[self.head & self.channel.mask];
        if slot.seq.load(Ordering::Acquire) != self.head.wrapping_add(1) {
            return false;
        }
        // SAFETY: the producer's release store handed the slot to the single
        // consumer; producers cannot claim it until the store below
        handle(unsafe { &mut *slot.value.get() });
        slot.seq.store(self.head.wrapping_add(self.channel.capacity()), Ordering::Release);
        self.head = self.head.wrapping_add(1);
        true
    }

    /// Consume everything currently published, in publish order
    pub fn drain(&mut self, mut handle: impl FnMut(&mut T)) -> usize {
        let mut drained = 0;
        while self.poll(&mut handle) {
            drained += 1;
        }
        drained
    }
}
