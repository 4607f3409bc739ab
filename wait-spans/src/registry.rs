//! # Mount-Event Registry
//!
//! Holds the set of subscribers to mount/unmount notifications. The delivery
//! path runs on every park/unpark of every logical thread, so it reads an
//! immutable snapshot through [`ArcSwap`] and never takes a lock. Writers
//! (`register`/`unregister`) are rare and serialized by a mutex; each one
//! builds a brand-new snapshot and swaps it in.
//!
//! The registry holds [`Weak`] references: the component that registered a
//! callback owns it. A callback dropped without unregistering is skipped on
//! delivery and pruned by the next write or by [`MountRegistry::prune`].

use arc_swap::ArcSwap;
use log::{debug, info};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use crate::capture::StackCapture;
use crate::diagnostics::{panic_message, Diagnostics};
use crate::domain::{LogicalThreadId, RegistryError};
use crate::scheduler::MountOnDrop;

/// Receiver of scheduler mount/unmount notifications
///
/// Both methods run inline on the thread that is about to block (unmount) or
/// has just resumed (mount). They must not block or take locks.
pub trait MountCallback: Send + Sync {
    fn on_mount(&self, thread: LogicalThreadId);
    fn on_unmount(&self, thread: LogicalThreadId);
}

type Snapshot = Vec<Weak<dyn MountCallback>>;

/// Copy-on-write callback registry on top of the capture facade's
/// mount-event toggle
pub struct MountRegistry {
    capture: Arc<StackCapture>,
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    diagnostics: Diagnostics,
}

static GLOBAL: OnceLock<Arc<MountRegistry>> = OnceLock::new();

/// Callback identity: the data pointer, ignoring vtable metadata
fn identity(cb: &Weak<dyn MountCallback>) -> *const () {
    cb.as_ptr().cast::<()>()
}

impl MountRegistry {
    #[must_use]
    pub fn new(capture: Arc<StackCapture>) -> Self {
        Self {
            capture,
            snapshot: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(()),
            diagnostics: Diagnostics::new(),
        }
    }

    /// The process-wide registry on top of [`StackCapture::global`]
    pub fn global() -> Arc<MountRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MountRegistry::new(StackCapture::global()))))
    }

    /// The facade this registry toggles mount events on
    pub fn capture(&self) -> &Arc<StackCapture> {
        &self.capture
    }

    /// Callback panic counters
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Number of live callbacks in the current snapshot
    pub fn len(&self) -> usize {
        self.snapshot.load().iter().filter(|cb| cb.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe a callback; enables native mount events on the first one
    ///
    /// # Errors
    /// - [`RegistryError::DuplicateCallback`] if this exact callback object is
    ///   already registered
    /// - [`RegistryError::Capture`] if mount events cannot be enabled
    pub fn register<C: MountCallback + 'static>(&self, cb: &Arc<C>) -> Result<(), RegistryError> {
        let cb: Arc<dyn MountCallback> = cb.clone();
        let weak = Arc::downgrade(&cb);
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot.load();
        let mut next: Snapshot =
            current.iter().filter(|existing| existing.strong_count() > 0).cloned().collect();
        if next.iter().any(|existing| identity(existing) == identity(&weak)) {
            return Err(RegistryError::DuplicateCallback);
        }

        if next.is_empty() {
            self.capture.enable_mount_events()?;
            info!("Mount events enabled");
        }
        next.push(weak);
        debug!("Registered mount callback, {} subscribed", next.len());
        self.store(next);
        Ok(())
    }

    /// Unsubscribe a callback; disables native mount events after the last one
    ///
    /// Callbacks dropped without unregistering are pruned either way.
    ///
    /// # Errors
    /// Returns [`RegistryError::UnknownCallback`] if the callback is not
    /// registered
    pub fn unregister<C: MountCallback + 'static>(&self, cb: &Arc<C>) -> Result<(), RegistryError> {
        let cb: Arc<dyn MountCallback> = cb.clone();
        let weak = Arc::downgrade(&cb);
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot.load();
        let found = current.iter().any(|existing| identity(existing) == identity(&weak));
        let next: Snapshot = current
            .iter()
            .filter(|existing| existing.strong_count() > 0 && identity(existing) != identity(&weak))
            .cloned()
            .collect();

        if next.len() != current.len() {
            debug!("Unsubscribed {} mount callbacks, {} subscribed", current.len() - next.len(), next.len());
            self.store(next);
        }
        if found {
            Ok(())
        } else {
            Err(RegistryError::UnknownCallback)
        }
    }

    /// Drop callbacks released without unregistering
    ///
    /// Disables native mount events once no subscriber is left. Returns the
    /// number of callbacks removed.
    pub fn prune(&self) -> usize {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load();
        let next: Snapshot =
            current.iter().filter(|existing| existing.strong_count() > 0).cloned().collect();
        let pruned = current.len() - next.len();
        if pruned > 0 {
            debug!("Pruned {pruned} dropped mount callbacks, {} subscribed", next.len());
            self.store(next);
        }
        pruned
    }

    /// Swap in a new snapshot; the writer lock must be held
    fn store(&self, next: Snapshot) {
        let now_empty = next.is_empty();
        self.snapshot.store(Arc::new(next));
        if now_empty && self.capture.mount_events_enabled() {
            self.capture.disable_mount_events();
            info!("Mount events disabled");
        }
    }

    /// Deliver a mount notification to every subscriber
    pub fn deliver_mount(&self, thread: LogicalThreadId) {
        self.deliver(|cb| cb.on_mount(thread));
    }

    /// Deliver an unmount notification to every subscriber
    pub fn deliver_unmount(&self, thread: LogicalThreadId) {
        self.deliver(|cb| cb.on_unmount(thread));
    }

    fn deliver(&self, notify: impl Fn(&dyn MountCallback)) {
        let snapshot = self.snapshot.load();
        for weak in snapshot.iter() {
            let Some(cb) = weak.upgrade() else { continue };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| notify(cb.as_ref()))) {
                self.diagnostics.record_callback_panic(panic_message(payload.as_ref()));
            }
        }
    }

    /// Run a blocking operation as one unmount/mount pair
    ///
    /// This is the scheduler hook: unmount is delivered before `f` runs and
    /// mount after it returns or unwinds. With mount events disabled it costs
    /// one atomic load.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        if !self.capture.mount_events_enabled() {
            return f();
        }
        let thread = LogicalThreadId::current();
        self.deliver_unmount(thread);
        let _mount = MountOnDrop::new(self, thread);
        f()
    }

    /// Drop every subscriber and release the facade's native resources
    pub fn teardown(&self) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.snapshot.store(Arc::new(Vec::new()));
        self.capture.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::{facade, FakeWalker};
    use crate::capture::CaptureState;
    use crate::domain::CaptureError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Counting {
        mounts: AtomicUsize,
        unmounts: AtomicUsize,
    }

    impl MountCallback for Counting {
        fn on_mount(&self, _thread: LogicalThreadId) {
            self.mounts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_unmount(&self, _thread: LogicalThreadId) {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl MountCallback for Panicking {
        fn on_mount(&self, _thread: LogicalThreadId) {
            panic!("mount exploded");
        }
        fn on_unmount(&self, _thread: LogicalThreadId) {
            panic!("unmount exploded");
        }
    }

    fn registry() -> (MountRegistry, Arc<FakeWalker>) {
        let (capture, walker) = facade(FakeWalker::default());
        (MountRegistry::new(capture), walker)
    }

    #[test]
    fn test_register_twice_is_duplicate() {
        let (registry, _) = registry();
        let cb = Arc::new(Counting::default());
        registry.register(&cb).unwrap();
        assert_eq!(registry.register(&cb), Err(RegistryError::DuplicateCallback));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_identical_callbacks_are_distinct() {
        let (registry, _) = registry();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        registry.register(&a).unwrap();
        registry.register(&b).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unregister_unknown() {
        let (registry, _) = registry();
        let cb = Arc::new(Counting::default());
        assert_eq!(registry.unregister(&cb), Err(RegistryError::UnknownCallback));
    }

    #[test]
    fn test_mount_events_follow_subscriber_count() {
        let (registry, walker) = registry();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());

        registry.register(&a).unwrap();
        assert!(walker.mount_events.load(Ordering::SeqCst));
        assert!(registry.capture().mount_events_enabled());
        registry.register(&b).unwrap();

        registry.unregister(&a).unwrap();
        assert!(registry.capture().mount_events_enabled());
        registry.unregister(&b).unwrap();
        assert!(!walker.mount_events.load(Ordering::SeqCst));
        assert!(!registry.capture().mount_events_enabled());
    }

    #[test]
    fn test_register_fails_when_capture_unavailable() {
        let (capture, _) = facade(FakeWalker { fail_load: true, ..FakeWalker::default() });
        let registry = MountRegistry::new(capture);
        let cb = Arc::new(Counting::default());
        assert_eq!(
            registry.register(&cb),
            Err(RegistryError::Capture(CaptureError::NotAvailable))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_delivery_reaches_every_subscriber() {
        let (registry, _) = registry();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        registry.register(&a).unwrap();
        registry.register(&b).unwrap();

        registry.deliver_unmount(LogicalThreadId(1));
        registry.deliver_mount(LogicalThreadId(1));

        for cb in [&a, &b] {
            assert_eq!(cb.unmounts.load(Ordering::SeqCst), 1);
            assert_eq!(cb.mounts.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let (registry, _) = registry();
        let bad = Arc::new(Panicking);
        let good = Arc::new(Counting::default());
        registry.register(&bad).unwrap();
        registry.register(&good).unwrap();

        registry.deliver_unmount(LogicalThreadId(7));
        registry.deliver_mount(LogicalThreadId(7));

        assert_eq!(good.unmounts.load(Ordering::SeqCst), 1);
        assert_eq!(good.mounts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.diagnostics().snapshot().callback_panics, 2);
    }

    #[test]
    fn test_dropped_callback_is_skipped_and_pruned() {
        let (registry, _) = registry();
        let gone = Arc::new(Counting::default());
        let kept = Arc::new(Counting::default());
        registry.register(&gone).unwrap();
        registry.register(&kept).unwrap();
        drop(gone);

        registry.deliver_mount(LogicalThreadId(1));
        assert_eq!(kept.mounts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);

        registry.unregister(&kept).unwrap();
        assert!(!registry.capture().mount_events_enabled());
    }

    #[test]
    fn test_pruning_last_dropped_callback_disables_mount_events() {
        let (registry, walker) = registry();
        let gone = Arc::new(Counting::default());
        registry.register(&gone).unwrap();
        drop(gone);
        assert!(registry.capture().mount_events_enabled());

        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.prune(), 0);
        assert!(!walker.mount_events.load(Ordering::SeqCst));
        assert!(!registry.capture().mount_events_enabled());
        assert_eq!(registry.blocking(|| 3), 3);
    }

    #[test]
    fn test_failed_unregister_still_prunes() {
        let (registry, walker) = registry();
        let gone = Arc::new(Counting::default());
        registry.register(&gone).unwrap();
        drop(gone);

        let stranger = Arc::new(Counting::default());
        assert_eq!(registry.unregister(&stranger), Err(RegistryError::UnknownCallback));
        assert!(!walker.mount_events.load(Ordering::SeqCst));
        assert!(!registry.capture().mount_events_enabled());
    }

    #[test]
    fn test_delivery_runs_alongside_register_and_unregister() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);
        let stable = Arc::new(Counting::default());
        registry.register(&stable).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let deliverer = {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rounds = 0usize;
                loop {
                    registry.deliver_unmount(LogicalThreadId(1));
                    registry.deliver_mount(LogicalThreadId(1));
                    rounds += 1;
                    if stop.load(Ordering::SeqCst) {
                        return rounds;
                    }
                }
            })
        };
        let churners: Vec<_> = (0..2)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let cb = Arc::new(Counting::default());
                        registry.register(&cb).unwrap();
                        registry.unregister(&cb).unwrap();
                    }
                })
            })
            .collect();
        for churner in churners {
            churner.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        let rounds = deliverer.join().unwrap();

        assert_eq!(stable.unmounts.load(Ordering::SeqCst), rounds);
        assert_eq!(stable.mounts.load(Ordering::SeqCst), rounds);
        assert_eq!(registry.len(), 1);
        assert!(registry.capture().mount_events_enabled());
        assert_eq!(registry.diagnostics().snapshot().callback_panics, 0);
    }

    #[test]
    fn test_blocking_delivers_pair_around_closure() {
        let (registry, _) = registry();
        let cb = Arc::new(Counting::default());
        registry.register(&cb).unwrap();

        let seen = registry.blocking(|| {
            (cb.unmounts.load(Ordering::SeqCst), cb.mounts.load(Ordering::SeqCst))
        });
        assert_eq!(seen, (1, 0));
        assert_eq!(cb.mounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_without_subscribers_is_passthrough() {
        let (registry, walker) = registry();
        assert_eq!(registry.blocking(|| 42), 42);
        // The hook must not initialize the facade on its own
        assert_eq!(walker.load_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_teardown_clears_and_disables() {
        let (registry, walker) = registry();
        let cb = Arc::new(Counting::default());
        registry.register(&cb).unwrap();

        registry.teardown();
        assert!(registry.is_empty());
        assert!(!walker.mount_events.load(Ordering::SeqCst));
        assert_eq!(registry.capture().state(), CaptureState::Loaded);

        registry.deliver_mount(LogicalThreadId(1));
        assert_eq!(cb.mounts.load(Ordering::SeqCst), 0);
    }
}
