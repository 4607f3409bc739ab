//! Stack capture and symbolization against this test binary
#![cfg(target_os = "linux")]

use wait_spans::{CaptureState, MethodId, StackCapture, UnwindWalker};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[inline(never)]
fn capture_here(capture: &StackCapture, buffer: &mut [MethodId]) -> usize {
    capture.capture_stack(0, buffer.len(), buffer).unwrap()
}

fn labels(capture: &StackCapture, frames: &[MethodId]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|id| capture.resolve_site(*id).unwrap())
        .map(|site| site.label())
        .collect()
}

#[test]
fn test_captures_and_resolves_own_frames() {
    init_logging();
    let capture = StackCapture::new(Box::new(UnwindWalker::new()));
    let mut buffer = [MethodId::NONE; 32];

    let count = capture_here(&capture, &mut buffer);
    assert_eq!(capture.state(), CaptureState::Initialized);
    assert!(count > 0);

    let labels = labels(&capture, &buffer[..count]);
    let own = labels.iter().position(|l| l.ends_with("::capture_here"));
    let caller = labels.iter().position(|l| l.ends_with("::test_captures_and_resolves_own_frames"));
    assert!(own.is_some(), "capture_here missing from {labels:?}");
    assert!(caller.is_some(), "test function missing from {labels:?}");
    // Innermost first
    assert!(own < caller);
}

#[test]
fn test_max_frames_bounds_capture() {
    init_logging();
    let capture = StackCapture::new(Box::new(UnwindWalker::new()));
    let mut buffer = [MethodId::NONE; 8];
    let count = capture.capture_stack(0, 3, &mut buffer).unwrap();
    assert!(count <= 3);
    assert!(buffer[3..].iter().all(|id| *id == MethodId::NONE));
}

#[test]
fn test_method_name_with_location() {
    init_logging();
    let capture = StackCapture::new(Box::new(UnwindWalker::new()));
    let mut buffer = [MethodId::NONE; 32];
    let count = capture_here(&capture, &mut buffer);

    let id = buffer[..count]
        .iter()
        .copied()
        .find(|id| {
            capture.resolve_method_name(*id, false).unwrap().as_deref() == Some("capture_here")
        })
        .unwrap();
    let owner = capture.resolve_owner(id).unwrap().unwrap();
    assert_eq!(owner.as_str(), "capture");

    let with_signature = capture.resolve_method_name(id, true).unwrap().unwrap();
    assert!(with_signature.starts_with("capture_here (capture.rs:"), "{with_signature}");
}

#[test]
fn test_foreign_identifiers_resolve_to_unknown() {
    init_logging();
    let capture = StackCapture::new(Box::new(UnwindWalker::new()));
    assert_eq!(capture.resolve_owner(MethodId::NONE).unwrap(), None);
    assert_eq!(capture.resolve_method_name(MethodId(1), true).unwrap(), None);
    assert_eq!(capture.resolve_site(MethodId(u64::MAX)).unwrap(), None);
}

#[test]
fn test_mount_events_supported() {
    init_logging();
    let capture = StackCapture::new(Box::new(UnwindWalker::new()));
    assert_eq!(capture.check_mount_event_support().unwrap(), None);

    capture.teardown();
    assert_eq!(capture.state(), CaptureState::Loaded);
}
