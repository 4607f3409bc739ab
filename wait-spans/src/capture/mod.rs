//! # Stack-Capture Facade
//!
//! Lazily-initialized gateway to the native stack-walking capability. Every
//! capture or resolution call first makes sure the facade reached
//! [`CaptureState::Initialized`]; the expensive load/init work happens at most
//! once per process under a single lock.
//!
//! ## Lifecycle
//!
//! ```text
//!              load ok            init ok
//!  NotLoaded ──────────▶ Loaded ──────────▶ Initialized
//!      │                   ▲  │                  │
//!      │ load err          │  │ init err         │ teardown err
//!      ▼                   │  ▼                  ▼
//!  LoadFailed              │  InitializationFailed   DestroyFailed
//!                          │                         │
//!                          └──── teardown ok ────────┘ (from Initialized)
//! ```
//!
//! `LoadFailed`, `InitializationFailed` and `DestroyFailed` are terminal: the
//! failure is logged once and every later call fails fast with
//! [`CaptureError::NotAvailable`] without retrying.
//!
//! The producer path only ever performs one atomic load of the state once the
//! facade is initialized, which is why [`crate::emitter::WaitSpanEmitter`]
//! forces initialization before it subscribes.

pub mod native;

use log::{error, info};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::domain::{BlockingSite, CaptureError, MethodId, OwnerPath};
pub use native::{NativeStackWalker, NativeSymbol, UnwindWalker};

/// Frames reserved for the facade's own entry point and the walker trampoline
const RESERVED_SKIP_FRAMES: usize = 2;

/// Facade lifecycle, a single process-wide value per facade instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    NotLoaded = 0,
    LoadFailed = 1,
    Loaded = 2,
    Initialized = 3,
    InitializationFailed = 4,
    DestroyFailed = 5,
}

impl CaptureState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CaptureState::NotLoaded,
            1 => CaptureState::LoadFailed,
            2 => CaptureState::Loaded,
            3 => CaptureState::Initialized,
            4 => CaptureState::InitializationFailed,
            _ => CaptureState::DestroyFailed,
        }
    }

    /// Returns true for states the facade never leaves
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CaptureState::LoadFailed
                | CaptureState::InitializationFailed
                | CaptureState::DestroyFailed
        )
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Gateway to stack capture, symbol resolution and mount-event switching
pub struct StackCapture {
    native: Box<dyn NativeStackWalker>,
    state: AtomicU8,
    /// Guards every state transition (init and teardown)
    lifecycle: Mutex<()>,
    mount_events: AtomicBool,
}

static GLOBAL: OnceLock<Arc<StackCapture>> = OnceLock::new();

impl StackCapture {
    /// Create a facade around a native walker, in state `NotLoaded`
    #[must_use]
    pub fn new(native: Box<dyn NativeStackWalker>) -> Self {
        Self {
            native,
            state: AtomicU8::new(CaptureState::NotLoaded as u8),
            lifecycle: Mutex::new(()),
            mount_events: AtomicBool::new(false),
        }
    }

    /// The process-wide facade backed by [`UnwindWalker`]
    pub fn global() -> Arc<StackCapture> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(StackCapture::new(Box::new(UnwindWalker::new())))))
    }

    /// Current lifecycle state
    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CaptureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Drive the lifecycle to `Initialized` if it has not failed yet
    ///
    /// # Errors
    /// Returns [`CaptureError::NotAvailable`] if the facade is (or just became)
    /// unusable
    pub fn ensure_initialized(&self) -> Result<(), CaptureError> {
        match self.state() {
            CaptureState::Initialized => return Ok(()),
            CaptureState::NotLoaded | CaptureState::Loaded => self.initialize(),
            _ => {}
        }
        if self.state() == CaptureState::Initialized {
            Ok(())
        } else {
            Err(CaptureError::NotAvailable)
        }
    }

    fn initialize(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);

        if self.state() == CaptureState::NotLoaded {
            match self.native.load() {
                Ok(()) => self.set_state(CaptureState::Loaded),
                Err(e) => {
                    error!("Failed to load native stack walker: {e:#}");
                    self.set_state(CaptureState::LoadFailed);
                    return;
                }
            }
        }

        if self.state() == CaptureState::Loaded {
            match self.native.init() {
                Ok(()) => {
                    info!("Stack capture initialized");
                    self.set_state(CaptureState::Initialized);
                }
                Err(e) => {
                    error!("Failed to initialize native stack walker: {e:#}");
                    self.set_state(CaptureState::InitializationFailed);
                }
            }
        }
    }

    /// Capture the calling thread's stack, innermost frame first
    ///
    /// `skip_frames` counts frames above the caller; the facade's own entry
    /// point and the walker trampoline are always skipped on top of that.
    /// Returns the number of identifiers written to `buffer`.
    ///
    /// # Errors
    /// - [`CaptureError::InvalidArgument`] if `max_frames` is zero or larger
    ///   than `buffer`
    /// - [`CaptureError::NotAvailable`] if the facade cannot be initialized
    /// - [`CaptureError::Native`] if the walker reports an error code
    pub fn capture_stack(
        &self,
        skip_frames: usize,
        max_frames: usize,
        buffer: &mut [MethodId],
    ) -> Result<usize, CaptureError> {
        if max_frames == 0 {
            return Err(CaptureError::InvalidArgument("max_frames must be greater than zero"));
        }
        if buffer.len() < max_frames {
            return Err(CaptureError::InvalidArgument("buffer is smaller than max_frames"));
        }
        self.ensure_initialized()?;

        let count = self.native.walk(skip_frames + RESERVED_SKIP_FRAMES, max_frames, buffer);
        usize::try_from(count).map_err(|_| CaptureError::Native(count))
    }

    /// Resolve the owning path ("declaring class") of a method identifier
    ///
    /// Stale or foreign identifiers yield `Ok(None)`.
    ///
    /// # Errors
    /// Returns [`CaptureError::NotAvailable`] if the facade cannot be initialized
    pub fn resolve_owner(&self, id: MethodId) -> Result<Option<OwnerPath>, CaptureError> {
        Ok(self.resolve_site(id)?.map(|site| site.owner))
    }

    /// Resolve the method name of an identifier
    ///
    /// With `with_signature` the source location is appended, e.g.
    /// `checkout (pool.rs:42)`. Stale or foreign identifiers yield `Ok(None)`.
    ///
    /// # Errors
    /// Returns [`CaptureError::NotAvailable`] if the facade cannot be initialized
    pub fn resolve_method_name(
        &self,
        id: MethodId,
        with_signature: bool,
    ) -> Result<Option<String>, CaptureError> {
        self.ensure_initialized()?;
        let Some(symbol) = self.native.resolve(id) else {
            return Ok(None);
        };
        let Some((_, method)) = split_function_path(&symbol.function) else {
            return Ok(None);
        };
        Ok(Some(match (&symbol.location, with_signature) {
            (Some(location), true) => format!("{method} ({location})"),
            _ => method.to_string(),
        }))
    }

    /// Resolve owner and method with a single native lookup
    ///
    /// # Errors
    /// Returns [`CaptureError::NotAvailable`] if the facade cannot be initialized
    pub fn resolve_site(&self, id: MethodId) -> Result<Option<BlockingSite>, CaptureError> {
        self.ensure_initialized()?;
        Ok(self.native.resolve(id).and_then(|symbol| {
            let (owner, method) = split_function_path(&symbol.function)?;
            Some(BlockingSite { owner: OwnerPath::new(owner), method: method.to_string() })
        }))
    }

    /// `Ok(None)` if mount/unmount events can be delivered, else the reason
    ///
    /// # Errors
    /// Returns [`CaptureError::NotAvailable`] if the facade cannot be initialized
    pub fn check_mount_event_support(&self) -> Result<Option<String>, CaptureError> {
        self.ensure_initialized()?;
        Ok(self.native.mount_event_support())
    }

    /// Whether the scheduler hook should deliver mount/unmount notifications
    pub fn mount_events_enabled(&self) -> bool {
        self.mount_events.load(Ordering::Acquire)
    }

    pub(crate) fn enable_mount_events(&self) -> Result<(), CaptureError> {
        self.ensure_initialized()?;
        match self.native.set_mount_events(true) {
            0 => {
                self.mount_events.store(true, Ordering::Release);
                Ok(())
            }
            code => Err(CaptureError::Native(code)),
        }
    }

    pub(crate) fn disable_mount_events(&self) {
        self.mount_events.store(false, Ordering::Release);
        if self.state() == CaptureState::Initialized {
            let code = self.native.set_mount_events(false);
            if code != 0 {
                error!("Failed to disable mount events, native error {code}");
            }
        }
    }

    /// Release native resources
    ///
    /// Only acts in `Initialized`. Success returns the facade to `Loaded`; a
    /// failure is logged and leaves it in the terminal `DestroyFailed`.
    pub fn teardown(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() != CaptureState::Initialized {
            return;
        }

        self.disable_mount_events();
        match self.native.destroy() {
            Ok(()) => {
                info!("Stack capture torn down");
                self.set_state(CaptureState::Loaded);
            }
            Err(e) => {
                error!("Failed to shut down native stack walker: {e:#}");
                self.set_state(CaptureState::DestroyFailed);
            }
        }
    }
}

/// Split a demangled function path into owner and method
///
/// Splits at the last `::` outside angle brackets, so
/// `<alloc::vec::Vec<T> as core::ops::drop::Drop>::drop` gives
/// `(<alloc::vec::Vec<T> as core::ops::drop::Drop>, drop)`. Free-standing
/// names without a path have no owner.
#[must_use]
pub fn split_function_path(function: &str) -> Option<(&str, &str)> {
    let bytes = function.as_bytes();
    let mut depth = 0usize;
    let mut split = None;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'<' | b'(' | b'[' => depth += 1,
            // "->" in fn pointer types is not a closing bracket
            b'>' if i > 0 && bytes[i - 1] == b'-' => {}
            b'>' | b')' | b']' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                split = Some(i);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    let idx = split?;
    let (owner, method) = (&function[..idx], &function[idx + 2..]);
    if owner.is_empty() || method.is_empty() {
        None
    } else {
        Some((owner, method))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable native walker for facade, registry and emitter tests

    use super::*;
    use anyhow::{bail, Result};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub struct FakeWalker {
        pub fail_load: bool,
        pub fail_init: bool,
        pub fail_destroy: bool,
        pub unsupported: Option<String>,
        /// Frames handed out by `walk`, innermost first
        pub stack: Vec<MethodId>,
        pub symbols: HashMap<u64, NativeSymbol>,
        pub load_calls: AtomicUsize,
        pub init_calls: AtomicUsize,
        pub resolve_calls: AtomicUsize,
        pub mount_events: AtomicBool,
        pub last_skip: AtomicUsize,
    }

    impl FakeWalker {
        pub fn with_symbols(symbols: &[(u64, &str)]) -> Self {
            Self {
                symbols: symbols
                    .iter()
                    .map(|(id, name)| {
                        (*id, NativeSymbol { function: (*name).to_string(), location: None })
                    })
                    .collect(),
                stack: symbols.iter().map(|(id, _)| MethodId(*id)).collect(),
                ..Self::default()
            }
        }
    }

    impl NativeStackWalker for FakeWalker {
        fn load(&self) -> Result<()> {
            self.load_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_load {
                bail!("no native library for this platform");
            }
            Ok(())
        }

        fn init(&self) -> Result<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                bail!("agent refused to start");
            }
            Ok(())
        }

        fn destroy(&self) -> Result<()> {
            if self.fail_destroy {
                bail!("agent refused to stop");
            }
            Ok(())
        }

        fn walk(&self, skip_frames: usize, max_frames: usize, buffer: &mut [MethodId]) -> i32 {
            self.last_skip.store(skip_frames, Ordering::SeqCst);
            let n = self.stack.len().min(max_frames);
            buffer[..n].copy_from_slice(&self.stack[..n]);
            i32::try_from(n).unwrap()
        }

        fn resolve(&self, id: MethodId) -> Option<NativeSymbol> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            self.symbols.get(&id.0).cloned()
        }

        fn mount_event_support(&self) -> Option<String> {
            self.unsupported.clone()
        }

        fn set_mount_events(&self, enabled: bool) -> i32 {
            self.mount_events.store(enabled, Ordering::SeqCst);
            0
        }
    }

    /// Keeps a handle on the fake after moving it into a facade
    pub struct SharedWalker(pub Arc<FakeWalker>);

    impl NativeStackWalker for SharedWalker {
        fn load(&self) -> Result<()> {
            self.0.load()
        }
        fn init(&self) -> Result<()> {
            self.0.init()
        }
        fn destroy(&self) -> Result<()> {
            self.0.destroy()
        }
        fn walk(&self, skip_frames: usize, max_frames: usize, buffer: &mut [MethodId]) -> i32 {
            self.0.walk(skip_frames, max_frames, buffer)
        }
        fn resolve(&self, id: MethodId) -> Option<NativeSymbol> {
            self.0.resolve(id)
        }
        fn mount_event_support(&self) -> Option<String> {
            self.0.mount_event_support()
        }
        fn set_mount_events(&self, enabled: bool) -> i32 {
            self.0.set_mount_events(enabled)
        }
    }

    pub fn facade(walker: FakeWalker) -> (Arc<StackCapture>, Arc<FakeWalker>) {
        let walker = Arc::new(walker);
        let capture = Arc::new(StackCapture::new(Box::new(SharedWalker(Arc::clone(&walker)))));
        (capture, walker)
    }
}
