//! # Wait-Span Emitter
//!
//! Wires the pipeline together:
//!
//! ```text
//! scheduler hook ──▶ MountRegistry ──▶ MountTracker (per-thread marker)
//!                                           │ try_publish (lock-free)
//!                                           ▼
//!                                      EventChannel
//!                                           │ drain
//!                                           ▼
//!                    wait-span-worker: resolve site ─▶ anchor clock ─▶ emit span
//! ```
//!
//! Producer side ([`MountTracker`]): an unmount stores "blocking since T" for
//! the logical thread in [`BlockingMarkers`]; the matching mount, on whichever
//! carrier it is delivered, clears it and, if the interval is long enough and
//! a sampled span is active, publishes the interval with the captured stack. Nothing on this side blocks, locks or surfaces errors.
//!
//! Consumer side: one dedicated thread drains records in publish order,
//! resolves the blocking site and emits a span parented to the captured
//! context, anchored to that parent's clock.
//!
//! At most one emitter may be active per process.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::capture::StackCapture;
use crate::channel::{self, BlockingIntervalRecord, Consumer, EventChannel};
use crate::clock::SpanAnchoredClock;
use crate::config::Config;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::domain::{LogicalThreadId, Timestamp, WaitSpanError};
use crate::markers::{BlockingMarkers, Marked};
use crate::registry::{MountCallback, MountRegistry};
use crate::resolver::{BlockingSiteResolver, DenyList};
use crate::trace_context::TraceBackend;

const WORKER_THREAD_NAME: &str = "wait-span-worker";

type Record<B> = BlockingIntervalRecord<<B as TraceBackend>::Context>;

// =============================================================================
// PROCESS-WIDE SINGLETON
// =============================================================================

static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Held while an emitter is active; releases the slot on drop
struct ActiveGuard;

impl ActiveGuard {
    fn acquire() -> Result<Self, WaitSpanError> {
        ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ActiveGuard)
            .map_err(|_| WaitSpanError::AlreadyActive)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::Release);
    }
}

// =============================================================================
// PRODUCER SIDE
// =============================================================================

/// Mount callback recording blocking intervals into the event channel
pub struct MountTracker<B: TraceBackend> {
    backend: Arc<B>,
    capture: Arc<StackCapture>,
    clock: Arc<SpanAnchoredClock>,
    markers: BlockingMarkers,
    channel: Arc<EventChannel<Record<B>>>,
    diagnostics: Arc<Diagnostics>,
    min_duration_nanos: u64,
    skip_frames: usize,
    max_depth: usize,
}

impl<B: TraceBackend> MountTracker<B> {
    fn publish(&self, start: Timestamp, end: Timestamp, parent: B::Context) {
        let result = self.channel.try_publish(|record| {
            record.start = start;
            record.end = end;
            record.parent = Some(parent);
            record.frame_count =
                match self.capture.capture_stack(self.skip_frames, self.max_depth, &mut record.frames) {
                    Ok(count) => count,
                    Err(e) => {
                        self.diagnostics.record_capture_failure(&e);
                        0
                    }
                };
        });
        match result {
            Ok(()) => self.diagnostics.record_published(),
            Err(e) => self.diagnostics.record_publish_failure(e),
        }
    }
}

impl<B: TraceBackend> MountCallback for MountTracker<B> {
    fn on_unmount(&self, thread: LogicalThreadId) {
        // A second unmount without a mount in between keeps the first marker
        if self.markers.mark(thread, self.clock.nanos()) == Marked::Full {
            self.diagnostics.record_marker_dropped();
        }
    }

    fn on_mount(&self, thread: LogicalThreadId) {
        let Some(start) = self.markers.take(thread) else {
            return;
        };
        let end = self.clock.nanos();
        if end.saturating_since(start) < self.min_duration_nanos {
            return;
        }
        let Some(parent) = self.backend.current_context() else {
            return;
        };
        self.publish(start, end, parent);
    }
}

// =============================================================================
// CONSUMER SIDE
// =============================================================================

/// Turns drained records into spans; owned by the worker thread
struct RecordProcessor<B: TraceBackend> {
    resolver: BlockingSiteResolver,
    backend: Arc<B>,
    clock: Arc<SpanAnchoredClock>,
    diagnostics: Arc<Diagnostics>,
    processing: bool,
}

impl<B: TraceBackend> RecordProcessor<B> {
    fn process(&mut self, record: &mut Record<B>) {
        // Release the parent context with the slot, not one lap later
        let Some(parent) = record.parent.take() else {
            return;
        };
        if !self.processing {
            self.diagnostics.record_discarded();
            return;
        }
        let Some(site) = self.resolver.resolve(record.frames()) else {
            self.diagnostics.record_suppressed();
            return;
        };

        let anchor = self.clock.anchor_for(self.backend.anchor_key(&parent));
        let start = anchor.to_epoch(record.start);
        let end = anchor.to_epoch(record.end);
        self.backend.emit_span(site.label(), &parent, start, end);
        self.diagnostics.record_emitted();
    }
}

/// Consumer idle strategy: a few empty polls, then sleep until woken or timed out
#[derive(Debug, Clone, Copy)]
struct IdlePolicy {
    spin_tries: u32,
    sleep: Duration,
}

fn run_worker<B: TraceBackend>(
    mut consumer: Consumer<Record<B>>,
    mut processor: RecordProcessor<B>,
    stop: &Receiver<()>,
    idle: IdlePolicy,
) {
    debug!("Wait-span worker started");
    let mut empty_polls = 0u32;
    loop {
        if consumer.drain(|record| processor.process(record)) > 0 {
            empty_polls = 0;
            continue;
        }
        if empty_polls < idle.spin_tries {
            empty_polls += 1;
            std::hint::spin_loop();
            continue;
        }
        match stop.recv_timeout(idle.sleep) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // The channel is closed before the stop signal, so this sees every record
    let remaining = consumer.drain(|record| processor.process(record));
    debug!("Wait-span worker stopped after draining {remaining} remaining records");
}

// =============================================================================
// EMITTER
// =============================================================================

/// Configures and starts a [`WaitSpanEmitter`]
pub struct WaitSpanEmitterBuilder<B> {
    backend: B,
    config: Config,
    registry: Option<Arc<MountRegistry>>,
    clock: Option<Arc<SpanAnchoredClock>>,
    processing: bool,
}

impl<B: TraceBackend> WaitSpanEmitterBuilder<B> {
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Subscribe to this registry instead of [`MountRegistry::global`]
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<MountRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share a clock whose span anchors are pinned elsewhere, e.g. by a
    /// [`WaitSpanProcessor`](crate::processor::WaitSpanProcessor)
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<SpanAnchoredClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// With processing off, records are drained and dropped unresolved
    #[must_use]
    pub fn with_processing(mut self, processing: bool) -> Self {
        self.processing = processing;
        self
    }

    /// Initialize stack capture, start the worker and subscribe
    ///
    /// # Errors
    /// - [`WaitSpanError::AlreadyActive`] if another emitter is active
    /// - [`WaitSpanError::Config`] if the configuration is invalid
    /// - [`WaitSpanError::Capture`] if stack capture is not available
    /// - [`WaitSpanError::Unsupported`] if mount events cannot be delivered
    /// - [`WaitSpanError::Spawn`] if the worker thread cannot be started
    /// - [`WaitSpanError::Registry`] if subscribing fails
    pub fn start(self) -> Result<WaitSpanEmitter<B>, WaitSpanError> {
        let active = ActiveGuard::acquire()?;
        let config = self.config;
        config.validate()?;

        let registry = self.registry.unwrap_or_else(MountRegistry::global);
        let capture = Arc::clone(registry.capture());
        // Initialize now so the producer path never runs the expensive init
        capture.ensure_initialized()?;
        if let Some(reason) = capture.check_mount_event_support()? {
            return Err(WaitSpanError::Unsupported(reason));
        }

        let deny = DenyList::compile(&config.deny_patterns)?;
        let markers = BlockingMarkers::with_capacity(config.marker_capacity)?;
        let max_depth = config.max_stack_depth;
        let (channel, consumer) =
            channel::bounded(config.channel_capacity, || Record::<B>::with_depth(max_depth))?;

        let backend = Arc::new(self.backend);
        let clock = self.clock.unwrap_or_default();
        let diagnostics = Arc::new(Diagnostics::new());

        let processor = RecordProcessor {
            resolver: BlockingSiteResolver::new(Arc::clone(&capture), deny),
            backend: Arc::clone(&backend),
            clock: Arc::clone(&clock),
            diagnostics: Arc::clone(&diagnostics),
            processing: self.processing,
        };
        let idle = IdlePolicy { spin_tries: config.spin_tries, sleep: config.idle_sleep };
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_worker(consumer, processor, &stop_rx, idle))
            .map_err(WaitSpanError::Spawn)?;

        let tracker = Arc::new(MountTracker {
            backend,
            capture,
            clock: Arc::clone(&clock),
            markers,
            channel: Arc::clone(&channel),
            diagnostics: Arc::clone(&diagnostics),
            min_duration_nanos: config.min_span_duration_nanos(),
            skip_frames: config.skip_frames,
            max_depth,
        });

        let mut emitter = WaitSpanEmitter {
            registry,
            tracker,
            channel,
            clock,
            diagnostics,
            stop: Some(stop_tx),
            worker: Some(worker),
            registered: false,
            active: Some(active),
        };
        // On failure the emitter's Drop stops the worker and releases the slot
        emitter.registry.register(&emitter.tracker)?;
        emitter.registered = true;

        info!(
            "Wait-span emitter started (capacity {}, depth {}, min duration {:?}, processing {})",
            config.channel_capacity,
            max_depth,
            config.min_span_duration,
            if self.processing { "on" } else { "off" }
        );
        Ok(emitter)
    }
}

/// Active wait-span pipeline; shuts down on drop
pub struct WaitSpanEmitter<B: TraceBackend> {
    registry: Arc<MountRegistry>,
    tracker: Arc<MountTracker<B>>,
    channel: Arc<EventChannel<Record<B>>>,
    clock: Arc<SpanAnchoredClock>,
    diagnostics: Arc<Diagnostics>,
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    registered: bool,
    active: Option<ActiveGuard>,
}

impl<B: TraceBackend> WaitSpanEmitter<B> {
    pub fn builder(backend: B) -> WaitSpanEmitterBuilder<B> {
        WaitSpanEmitterBuilder {
            backend,
            config: Config::default(),
            registry: None,
            clock: None,
            processing: true,
        }
    }

    /// Start on the process-wide registry
    ///
    /// # Errors
    /// See [`WaitSpanEmitterBuilder::start`]
    pub fn start(backend: B, config: Config) -> Result<Self, WaitSpanError> {
        Self::builder(backend).with_config(config).start()
    }

    /// Clock used for blocking intervals; span processors report span starts
    /// here via [`SpanAnchoredClock::on_span_start`]
    pub fn clock(&self) -> &Arc<SpanAnchoredClock> {
        &self.clock
    }

    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            callback_panics: self.registry.diagnostics().snapshot().callback_panics,
            ..self.diagnostics.snapshot()
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Stop producing, drain what was already published, stop the worker
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if self.active.is_none() {
            return;
        }
        if self.registered {
            if let Err(e) = self.registry.unregister(&self.tracker) {
                warn!("Failed to unsubscribe wait-span tracker: {e}");
            }
            self.registered = false;
        }

        self.channel.close();
        if let Some(stop) = self.stop.take() {
            // The worker may already be gone; disconnecting also stops it
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Wait-span worker panicked");
            }
        }

        let snapshot = self.diagnostics();
        info!(
            "Wait-span emitter stopped: {} spans emitted, {} suppressed, {} dropped",
            snapshot.spans_emitted,
            snapshot.records_suppressed,
            snapshot.dropped_full + snapshot.dropped_closed
        );
        self.active = None;
    }
}

impl<B: TraceBackend> Drop for WaitSpanEmitter<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
