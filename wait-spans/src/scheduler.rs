//! Scheduler hook: logical-thread identity and the park/unpark bracket
//!
//! Runtimes (or plain code) announce a blocking section by wrapping it in
//! [`blocking`]. The section is reported as an unmount when it starts and a
//! mount when it ends, exactly the notifications a green-thread scheduler
//! would raise when it parks and resumes a task.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::LogicalThreadId;
use crate::registry::MountRegistry;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<u64> = const { Cell::new(0) };
}

impl LogicalThreadId {
    /// Identity of the calling thread, assigned on first use
    pub fn current() -> Self {
        CURRENT.with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            LogicalThreadId(id.get())
        })
    }
}

/// Delivers the mount half of a blocking bracket when dropped
pub(crate) struct MountOnDrop<'a> {
    registry: &'a MountRegistry,
    thread: LogicalThreadId,
}

impl<'a> MountOnDrop<'a> {
    pub(crate) fn new(registry: &'a MountRegistry, thread: LogicalThreadId) -> Self {
        Self { registry, thread }
    }
}

impl Drop for MountOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.deliver_mount(self.thread);
    }
}

/// Run `f` as a blocking section on the process-wide registry
///
/// ```no_run
/// # let shared = std::sync::Mutex::new(());
/// let guard = wait_spans::scheduler::blocking(|| shared.lock());
/// ```
pub fn blocking<R>(f: impl FnOnce() -> R) -> R {
    MountRegistry::global().blocking(f)
}
