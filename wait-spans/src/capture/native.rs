//! Native stack-walking capability behind the capture facade
//!
//! [`NativeStackWalker`] is the seam between the facade's lifecycle handling
//! and whatever actually walks and symbolizes stacks. [`UnwindWalker`] is the
//! in-process implementation: frame-pointer/unwind-table walking through the
//! `backtrace` crate and symbolization of the running executable through
//! [`crate::symbolization`].

// trace_unsynchronized() requires unsafe
#![allow(unsafe_code)]

use anyhow::{bail, Context, Result};
use log::info;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::domain::MethodId;
use crate::symbolization::{current_executable_range, MemoryRange, Symbolizer};

/// Walker returned a frame count that does not fit the status code
pub const ERR_TOO_MANY_FRAMES: i32 = -2;

/// The native walker is unusable in its current state
pub const ERR_NOT_READY: i32 = -1;

/// A resolved method identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSymbol {
    /// Demangled path of the function containing the address
    pub function: String,
    /// `file:line`, when debug info has it
    pub location: Option<String>,
}

/// Low-level stack walking and symbol lookup
///
/// Methods mirror the native entry points of an agent library: lifecycle
/// calls return errors, hot-path calls return status codes so that the
/// producer path never builds an error value.
pub trait NativeStackWalker: Send + Sync {
    /// Make the capability available to the process (expensive, done once)
    ///
    /// # Errors
    /// Returns an error if the capability cannot be loaded on this platform
    fn load(&self) -> Result<()>;

    /// Prepare the loaded capability for capture and resolution
    ///
    /// # Errors
    /// Returns an error if initialization fails
    fn init(&self) -> Result<()>;

    /// Release everything acquired by [`NativeStackWalker::init`]
    ///
    /// # Errors
    /// Returns an error if native resources could not be released
    fn destroy(&self) -> Result<()>;

    /// Walk the calling thread's stack into `buffer`
    ///
    /// Skips `skip_frames` innermost frames and stores at most `max_frames`
    /// identifiers. Returns the number of stored frames, or a negative error
    /// code. Must not block, lock, or allocate.
    fn walk(&self, skip_frames: usize, max_frames: usize, buffer: &mut [MethodId]) -> i32;

    /// Resolve an identifier; `None` for unknown or stale identifiers
    fn resolve(&self, id: MethodId) -> Option<NativeSymbol>;

    /// `None` if mount/unmount notifications can be delivered, else the reason
    fn mount_event_support(&self) -> Option<String>;

    /// Switch mount/unmount notification delivery; returns 0 or an error code
    fn set_mount_events(&self, enabled: bool) -> i32;
}

/// Executable image prepared for symbolization
struct LoadedImage {
    exe: PathBuf,
    range: MemoryRange,
}

struct Symbols {
    range: MemoryRange,
    bias: u64,
    symbolizer: Symbolizer,
}

/// In-process walker: `backtrace` for unwinding, DWARF for names
pub struct UnwindWalker {
    image: Mutex<Option<LoadedImage>>,
    symbols: Mutex<Option<Symbols>>,
}

impl UnwindWalker {
    #[must_use]
    pub fn new() -> Self {
        Self { image: Mutex::new(None), symbols: Mutex::new(None) }
    }
}

impl Default for UnwindWalker {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeStackWalker for UnwindWalker {
    fn load(&self) -> Result<()> {
        if !cfg!(target_os = "linux") {
            bail!("In-process stack walking does not work on {}", std::env::consts::OS);
        }
        let (exe, range) = current_executable_range()?;
        info!("Loaded stack walker for {} at 0x{:x}", exe.display(), range.start);
        *self.image.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(LoadedImage { exe, range });
        Ok(())
    }

    fn init(&self) -> Result<()> {
        let guard = self.image.lock().unwrap_or_else(PoisonError::into_inner);
        let image = guard.as_ref().context("Stack walker has not been loaded")?;

        let symbolizer = Symbolizer::new(&image.exe)
            .with_context(|| format!("Failed to load symbols of {}", image.exe.display()))?;
        let bias = image.range.start.saturating_sub(symbolizer.image_base() & !0xfff);

        *self.symbols.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Symbols { range: image.range, bias, symbolizer });
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.symbols.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    fn walk(&self, skip_frames: usize, max_frames: usize, buffer: &mut [MethodId]) -> i32 {
        let limit = max_frames.min(buffer.len());
        if limit == 0 {
            return 0;
        }

        let mut skipped = 0usize;
        let mut count = 0usize;
        // SAFETY: on the Linux targets `load` accepts, unwinding goes through
        // libgcc/libunwind which is safe to run on many threads at once. The
        // closure only writes into the caller's buffer: no allocation, no locks.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if skipped < skip_frames {
                    skipped += 1;
                    return true;
                }
                buffer[count] = MethodId(frame.ip() as usize as u64);
                count += 1;
                count < limit
            });
        }

        i32::try_from(count).unwrap_or(ERR_TOO_MANY_FRAMES)
    }

    fn resolve(&self, id: MethodId) -> Option<NativeSymbol> {
        let guard = self.symbols.lock().unwrap_or_else(PoisonError::into_inner);
        let symbols = guard.as_ref()?;

        // Foreign or unloaded code: not ours to name
        if !id.is_valid() || !symbols.range.contains(id.0) {
            return None;
        }

        // Return addresses point after the call, step back into it
        let file_addr = id.0.checked_sub(symbols.bias)?.checked_sub(1)?;
        let resolved = symbols.symbolizer.resolve(file_addr)?;
        let outermost = resolved.outermost()?;

        Some(NativeSymbol {
            function: outermost.function.clone(),
            location: outermost.location.as_ref().and_then(crate::symbolization::SourceLocation::short),
        })
    }

    fn mount_event_support(&self) -> Option<String> {
        if cfg!(target_os = "linux") {
            None
        } else {
            Some(format!("stack walking is unavailable on {}", std::env::consts::OS))
        }
    }

    fn set_mount_events(&self, _enabled: bool) -> i32 {
        // Delivery is driven by the in-process scheduler hook, nothing to arm
        if self.symbols.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            0
        } else {
            ERR_NOT_READY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_without_load_still_captures() {
        // Walking needs no symbols; only resolution does
        let walker = UnwindWalker::new();
        let mut buf = [MethodId::NONE; 8];
        let count = walker.walk(0, 8, &mut buf);
        assert!(count > 0);
        assert!(buf[..usize::try_from(count).unwrap()].iter().all(|id| id.is_valid()));
    }

    #[test]
    fn test_walk_respects_max_frames() {
        let walker = UnwindWalker::new();
        let mut buf = [MethodId::NONE; 8];
        assert_eq!(walker.walk(0, 2, &mut buf), 2);
        assert_eq!(buf[2], MethodId::NONE);
        assert_eq!(walker.walk(0, 0, &mut buf), 0);
    }

    #[test]
    fn test_resolve_before_init_is_unknown() {
        let walker = UnwindWalker::new();
        assert!(walker.resolve(MethodId(0x1234)).is_none());
        assert_eq!(walker.set_mount_events(true), ERR_NOT_READY);
    }

    #[test]
    fn test_init_without_load_fails() {
        let walker = UnwindWalker::new();
        assert!(walker.init().is_err());
    }
}
