//! OpenTelemetry span-processor adapter
//!
//! Registered on an `SdkTracerProvider`, [`WaitSpanProcessor`] pins each
//! sampled span's clock anchor when the span starts, so wait spans are placed
//! against the parent's own start rather than against the moment the worker
//! first saw the parent. It also owns the emitter: shutting the processor down
//! stops the emitter and drains it.
//!
//! The emitter's tracer usually comes from the provider the processor is
//! registered on, so the processor is created first and the emitter attached
//! once the provider exists:
//!
//! ```no_run
//! use opentelemetry::trace::TracerProvider as _;
//! use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider, SpanProcessor as _};
//! use std::sync::Arc;
//! use wait_spans::{OtelBackend, WaitSpanEmitter, WaitSpanProcessor};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let processor: WaitSpanProcessor<OtelBackend<SdkTracer>> = WaitSpanProcessor::new();
//! let provider = SdkTracerProvider::builder().with_span_processor(processor.clone()).build();
//!
//! let emitter = WaitSpanEmitter::builder(OtelBackend::new(provider.tracer("wait-spans")))
//!     .with_clock(Arc::clone(processor.clock()))
//!     .start()?;
//! processor.attach(emitter);
//!
//! // Drain while the provider still records spans
//! processor.shutdown()?;
//! provider.shutdown()?;
//! # Ok(())
//! # }
//! ```

use log::warn;
use opentelemetry::trace::Span as _;
use opentelemetry::Context;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::SpanAnchoredClock;
use crate::diagnostics::DiagnosticsSnapshot;
use crate::emitter::WaitSpanEmitter;
use crate::trace_context::{span_key, TraceBackend};

struct Attached<B: TraceBackend> {
    emitter: Option<WaitSpanEmitter<B>>,
    /// Counters of the last emitter, kept once it is shut down and released
    last: Option<DiagnosticsSnapshot>,
}

struct Shared<B: TraceBackend> {
    clock: Arc<SpanAnchoredClock>,
    attached: Mutex<Attached<B>>,
}

/// Span processor pinning clock anchors at span start; cheap to clone
pub struct WaitSpanProcessor<B: TraceBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: TraceBackend> WaitSpanProcessor<B> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SpanAnchoredClock::new()))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<SpanAnchoredClock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                attached: Mutex::new(Attached { emitter: None, last: None }),
            }),
        }
    }

    /// Clock to hand to [`WaitSpanEmitterBuilder::with_clock`](crate::WaitSpanEmitterBuilder::with_clock)
    pub fn clock(&self) -> &Arc<SpanAnchoredClock> {
        &self.shared.clock
    }

    fn attached(&self) -> MutexGuard<'_, Attached<B>> {
        self.shared.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of `emitter`; it is shut down with this processor
    pub fn attach(&self, emitter: WaitSpanEmitter<B>) {
        if !Arc::ptr_eq(emitter.clock(), &self.shared.clock) {
            warn!("Attached wait-span emitter does not share the processor's clock; span starts will not anchor its spans");
        }
        let previous = self.attached().emitter.replace(emitter);
        // Shut a replaced emitter down outside the lock
        drop(previous);
    }

    /// Counters of the attached emitter, or of the last one shut down
    pub fn diagnostics(&self) -> Option<DiagnosticsSnapshot> {
        let attached = self.attached();
        attached.emitter.as_ref().map(WaitSpanEmitter::diagnostics).or(attached.last)
    }
}

impl<B: TraceBackend> Default for WaitSpanProcessor<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: TraceBackend> Clone for WaitSpanProcessor<B> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<B: TraceBackend> fmt::Debug for WaitSpanProcessor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitSpanProcessor").finish_non_exhaustive()
    }
}

impl<B: TraceBackend> SpanProcessor for WaitSpanProcessor<B> {
    fn on_start(&self, span: &mut Span, _cx: &Context) {
        let sc = span.span_context();
        if sc.is_sampled() {
            self.shared.clock.on_span_start(span_key(sc.span_id()));
        }
    }

    fn on_end(&self, _span: SpanData) {}

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    /// Stop and drain the attached emitter, then release it
    ///
    /// Drained records are emitted through the emitter's tracer, so run this
    /// before the provider that tracer belongs to is shut down.
    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        let emitter = self.attached().emitter.take();
        if let Some(mut emitter) = emitter {
            emitter.shutdown();
            self.attached().last = Some(emitter.diagnostics());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::{facade, FakeWalker};
    use crate::emitter::testing::serial;
    use crate::registry::MountRegistry;
    use crate::trace_context::testing::FakeBackend;
    use opentelemetry::trace::{Span as _, Tracer, TracerProvider as _};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};

    type FakeProcessor = WaitSpanProcessor<Arc<FakeBackend>>;

    #[test]
    fn test_span_start_pins_anchor() {
        let exporter = InMemorySpanExporter::default();
        let processor = FakeProcessor::new();
        let provider = SdkTracerProvider::builder()
            .with_span_processor(processor.clone())
            .with_simple_exporter(exporter.clone())
            .build();

        let mut span = provider.tracer("processor-test").start("request");
        let span_id = span.span_context().span_id();
        std::thread::sleep(Duration::from_millis(5));
        span.end();

        assert_eq!(processor.clock().anchor_count(), 1);
        let anchor = processor.clock().anchor_for(span_key(span_id));
        let finished = exporter.get_finished_spans().unwrap();
        assert_eq!(finished.len(), 1);
        assert!(anchor.epoch >= finished[0].start_time);
        assert!(anchor.epoch < finished[0].end_time);
    }

    #[test]
    fn test_shutdown_without_emitter_is_ok() {
        let processor = FakeProcessor::default();
        assert!(processor.shutdown().is_ok());
        assert!(processor.diagnostics().is_none());
    }

    #[test]
    fn test_provider_shutdown_stops_attached_emitter() {
        let _serial = serial();
        let (capture, walker) = facade(FakeWalker::default());
        let registry = Arc::new(MountRegistry::new(capture));

        let processor = FakeProcessor::new();
        let emitter = WaitSpanEmitter::builder(Arc::new(FakeBackend::default()))
            .with_registry(Arc::clone(&registry))
            .with_clock(Arc::clone(processor.clock()))
            .start()
            .unwrap();
        processor.attach(emitter);
        assert_eq!(registry.len(), 1);

        let provider = SdkTracerProvider::builder().with_span_processor(processor.clone()).build();
        provider.shutdown().unwrap();

        assert!(registry.is_empty());
        assert!(!walker.mount_events.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(processor.diagnostics(), Some(DiagnosticsSnapshot::default()));
    }
}
