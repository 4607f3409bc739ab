//! End to end: a contended lock inside a sampled span becomes one wait span
#![cfg(target_os = "linux")]

use opentelemetry::trace::{Tracer, TracerProvider as _};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracer, SdkTracerProvider, SpanProcessor as _};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use wait_spans::{
    Config, MountRegistry, OtelBackend, StackCapture, UnwindWalker, WaitSpanEmitter, WaitSpanProcessor,
};

const HOLD: Duration = Duration::from_millis(200);

#[inline(never)]
fn acquire_contended<'a>(registry: &MountRegistry, lock: &'a Mutex<()>) -> MutexGuard<'a, ()> {
    registry.blocking(|| lock.lock()).unwrap()
}

#[test]
fn test_contended_lock_emits_one_wait_span() {
    let _ = env_logger::builder().is_test(true).try_init();

    let exporter = InMemorySpanExporter::default();
    let processor: WaitSpanProcessor<OtelBackend<SdkTracer>> = WaitSpanProcessor::new();
    let provider = SdkTracerProvider::builder()
        .with_span_processor(processor.clone())
        .with_simple_exporter(exporter.clone())
        .build();
    let tracer = provider.tracer("lock-contention");

    let capture = Arc::new(StackCapture::new(Box::new(UnwindWalker::new())));
    let registry = Arc::new(MountRegistry::new(capture));
    let emitter = WaitSpanEmitter::builder(OtelBackend::new(tracer.clone()))
        .with_registry(Arc::clone(&registry))
        .with_clock(Arc::clone(processor.clock()))
        .with_config(Config::default().with_min_span_duration(Duration::from_millis(50)))
        .start()
        .unwrap();
    processor.attach(emitter);

    let lock = Arc::new(Mutex::new(()));
    let held = lock.lock().unwrap();
    let (ready_tx, ready_rx) = mpsc::channel();

    let blocked = {
        let lock = Arc::clone(&lock);
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            tracer.in_span("request", |_cx| {
                ready_tx.send(()).unwrap();
                drop(acquire_contended(&registry, &lock));
            });
        })
    };

    ready_rx.recv().unwrap();
    thread::sleep(HOLD);
    drop(held);
    blocked.join().unwrap();

    processor.shutdown().unwrap();
    let _ = provider.force_flush();

    let spans = exporter.get_finished_spans().unwrap();
    let request = spans.iter().find(|s| s.name == "request").unwrap();
    let waits: Vec<_> = spans.iter().filter(|s| s.name != "request").collect();
    assert_eq!(waits.len(), 1, "{:?}", spans.iter().map(|s| &s.name).collect::<Vec<_>>());

    let wait = waits[0];
    assert!(wait.name.ends_with("::acquire_contended"), "{}", wait.name);
    assert_eq!(wait.parent_span_id, request.span_context.span_id());
    assert_eq!(wait.span_context.trace_id(), request.span_context.trace_id());

    // Anchored at the request's start, so no clock step can place it earlier
    assert!(wait.start_time >= request.start_time);

    let duration = wait.end_time.duration_since(wait.start_time).unwrap();
    assert!(duration >= HOLD - Duration::from_millis(20), "{duration:?}");
    assert!(duration < HOLD * 5, "{duration:?}");

    assert_eq!(processor.diagnostics().map(|d| d.spans_emitted), Some(1));
    provider.shutdown().unwrap();
}
