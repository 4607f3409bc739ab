//! Trace-context provider seam
//!
//! The emitter needs three things from a tracing system: the context active on
//! the current thread (only if it is a valid, sampled span), a stable key per
//! parent span for clock anchoring, and a way to record a finished span with
//! explicit timestamps. [`OtelBackend`] provides them for OpenTelemetry.

use opentelemetry::trace::{Span, SpanId, TraceContextExt, Tracer};
use opentelemetry::Context;
use std::sync::Arc;
use std::time::SystemTime;

/// Tracing system the wait spans are emitted into
pub trait TraceBackend: Send + Sync + 'static {
    /// Parent handle carried from the producer to the consumer thread
    type Context: Clone + Send + 'static;

    /// The active context, if it belongs to a valid and sampled span
    ///
    /// Called on the producer path: must not block.
    fn current_context(&self) -> Option<Self::Context>;

    /// Stable key identifying the parent span of `cx`
    fn anchor_key(&self, cx: &Self::Context) -> u64;

    /// Record a finished span named `name` as a child of `parent`
    fn emit_span(&self, name: String, parent: &Self::Context, start: SystemTime, end: SystemTime);
}

/// Anchor key of an OpenTelemetry span
pub(crate) fn span_key(span_id: SpanId) -> u64 {
    u64::from_be_bytes(span_id.to_bytes())
}

/// [`TraceBackend`] over any OpenTelemetry tracer
pub struct OtelBackend<T> {
    tracer: T,
}

impl<T: Tracer> OtelBackend<T> {
    pub fn new(tracer: T) -> Self {
        Self { tracer }
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }
}

impl OtelBackend<opentelemetry::global::BoxedTracer> {
    /// Backend over the globally installed tracer provider
    pub fn global(instrumentation_scope: &'static str) -> Self {
        Self::new(opentelemetry::global::tracer(instrumentation_scope))
    }
}

impl<T> TraceBackend for OtelBackend<T>
where
    T: Tracer + Send + Sync + 'static,
{
    type Context = Context;

    fn current_context(&self) -> Option<Context> {
        let cx = Context::current();
        let sampled = {
            let span = cx.span();
            let sc = span.span_context();
            sc.is_valid() && sc.is_sampled()
        };
        sampled.then_some(cx)
    }

    fn anchor_key(&self, cx: &Context) -> u64 {
        span_key(cx.span().span_context().span_id())
    }

    fn emit_span(&self, name: String, parent: &Context, start: SystemTime, end: SystemTime) {
        let mut span = self
            .tracer
            .span_builder(name)
            .with_start_time(start)
            .start_with_context(&self.tracer, parent);
        span.end_with_timestamp(end);
    }
}

/// Shared backends, e.g. one also used by a span processor
impl<B: TraceBackend> TraceBackend for Arc<B> {
    type Context = B::Context;

    fn current_context(&self) -> Option<B::Context> {
        self.as_ref().current_context()
    }

    fn anchor_key(&self, cx: &B::Context) -> u64 {
        self.as_ref().anchor_key(cx)
    }

    fn emit_span(&self, name: String, parent: &B::Context, start: SystemTime, end: SystemTime) {
        self.as_ref().emit_span(name, parent, start, end);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic backend for emitter tests

    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EmittedSpan {
        pub name: String,
        pub parent: u64,
        pub start: SystemTime,
        pub end: SystemTime,
    }

    /// Context is a plain span key; 0 means "no sampled span active"
    #[derive(Default)]
    pub struct FakeBackend {
        pub active: AtomicU64,
        pub emitted: Mutex<Vec<EmittedSpan>>,
    }

    impl FakeBackend {
        pub fn set_active(&self, key: u64) {
            self.active.store(key, Ordering::SeqCst);
        }

        pub fn emitted(&self) -> Vec<EmittedSpan> {
            self.emitted.lock().unwrap().clone()
        }
    }

    impl TraceBackend for FakeBackend {
        type Context = u64;

        fn current_context(&self) -> Option<u64> {
            Some(self.active.load(Ordering::SeqCst)).filter(|key| *key != 0)
        }

        fn anchor_key(&self, cx: &u64) -> u64 {
            *cx
        }

        fn emit_span(&self, name: String, parent: &u64, start: SystemTime, end: SystemTime) {
            self.emitted.lock().unwrap().push(EmittedSpan { name, parent: *parent, start, end });
        }
    }
}
