//! # Wait Spans - Blocking-Interval Trace Spans
//!
//! Wait Spans turns the time a logical thread spends parked on a lock, a
//! channel or blocking I/O into trace spans. Each span is named after the call
//! site that blocked and parented to the sampled span that was active when the
//! thread resumed, so a trace shows *where* a request waited, not only that it
//! was slow.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Application / Runtime Scheduler                 │
//! │            scheduler::blocking(|| mutex.lock()) ...             │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ unmount / mount
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  MountRegistry (lock-free snapshot)  ──▶  MountTracker          │
//! │                                        per-thread marker,       │
//! │                                        stack capture            │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ try_publish (never blocks)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               EventChannel (preallocated MPSC ring)             │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ drain (wait-span-worker thread)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  BlockingSiteResolver ──▶ SpanAnchoredClock ──▶ TraceBackend    │
//! │  (deny list + memo)      (epoch anchoring)    (OpenTelemetry)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`capture`]: lazily initialized stack-capture facade and its lifecycle
//!   state machine; [`capture::native`] walks the stack with `backtrace`
//! - [`symbolization`]: DWARF and symbol-table lookups for captured addresses
//! - [`registry`]: copy-on-write mount-callback registry
//! - [`scheduler`]: logical-thread identity and the blocking-section hook
//! - [`channel`]: lock-free bounded event channel
//! - [`resolver`]: blocking-site deny list and resolver
//! - [`clock`]: monotonic clock with per-span epoch anchors
//! - [`trace_context`]: tracing-system seam and the OpenTelemetry adapter
//! - [`markers`]: per-logical-thread "blocking since" table
//! - [`emitter`]: the wait-span pipeline itself
//! - [`processor`]: OpenTelemetry span processor pinning anchors at span start
//! - [`diagnostics`], [`config`], [`domain`]: counters, settings and types
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use wait_spans::{scheduler, Config, OtelBackend, WaitSpanEmitter};
//!
//! # fn main() -> Result<(), wait_spans::WaitSpanError> {
//! let config = Config::default().with_min_span_duration(Duration::from_millis(1));
//! let mut emitter = WaitSpanEmitter::start(OtelBackend::global("wait-spans"), config)?;
//!
//! let shared = std::sync::Mutex::new(0u64);
//! let mut guard = scheduler::blocking(|| shared.lock()).unwrap_or_else(|e| e.into_inner());
//! *guard += 1;
//! drop(guard);
//!
//! emitter.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Degraded Mode
//!
//! Nothing here may crash or stall the host. If stack capture cannot be
//! initialized the emitter refuses to start; once running, dropped records,
//! capture failures and panicking callbacks are counted in
//! [`DiagnosticsSnapshot`] and logged once per kind.
//!
//! ## Platform Requirements
//!
//! - Linux (the executable's mapping is read from `/proc/self/maps`)
//! - Debug info in the binary for source locations (`debug = true`); the ELF
//!   symbol table alone is enough for names

pub mod capture;
pub mod channel;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod domain;
pub mod emitter;
pub mod markers;
pub mod processor;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod symbolization;
pub mod trace_context;

pub use capture::{CaptureState, NativeStackWalker, StackCapture, UnwindWalker};
pub use channel::BlockingIntervalRecord;
pub use clock::{ClockAnchor, SpanAnchoredClock};
pub use config::Config;
pub use diagnostics::DiagnosticsSnapshot;
pub use domain::{
    BlockingSite, CaptureError, ChannelError, ConfigError, LogicalThreadId, MethodId, OwnerPath,
    RegistryError, Timestamp, WaitSpanError,
};
pub use emitter::{WaitSpanEmitter, WaitSpanEmitterBuilder};
pub use markers::BlockingMarkers;
pub use processor::WaitSpanProcessor;
pub use registry::{MountCallback, MountRegistry};
pub use resolver::{BlockingSiteResolver, DenyList};
pub use trace_context::{OtelBackend, TraceBackend};
