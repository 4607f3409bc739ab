//! Memory mapping utilities for the current process
//!
//! Parses `/proc/self/maps` to find where the running executable is mapped.
//! Captured instruction pointers are runtime addresses; the executable's
//! mapping is needed both to translate them back to file addresses (PIE) and
//! to tell our own code apart from foreign or unloaded code.

use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

/// Memory range of a loaded binary in the process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Find the memory range of `binary_path` in the contents of a maps file
///
/// All mappings of the binary are merged, returning the range from the
/// minimum start address to the maximum end address.
#[must_use]
pub fn find_binary_range(maps: &str, binary_path: &str) -> Option<MemoryRange> {
    let mut range: Option<MemoryRange> = None;

    for line in maps.lines() {
        // "start-end perms offset dev inode pathname"
        let mut parts = line.split_whitespace();
        let Some(addresses) = parts.next() else {
            continue;
        };
        if parts.nth(4) != Some(binary_path) {
            continue;
        }
        let Some((start, end)) = addresses.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };

        range = Some(match range {
            Some(r) => MemoryRange { start: r.start.min(start), end: r.end.max(end) },
            None => MemoryRange { start, end },
        });
    }

    range
}

/// Locate the running executable and its mapped address range
///
/// # Errors
/// Returns an error if the executable path cannot be determined, the maps
/// file cannot be read, or the executable does not appear in it
pub fn current_executable_range() -> Result<(PathBuf, MemoryRange)> {
    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    let exe = fs::canonicalize(&exe).unwrap_or(exe);
    let range = executable_range_in("/proc/self/maps", &exe)?;
    Ok((exe, range))
}

fn executable_range_in(maps_path: &str, exe: &Path) -> Result<MemoryRange> {
    let maps = fs::read_to_string(maps_path).context(format!("Failed to read {maps_path}"))?;
    let exe_str = exe.to_string_lossy();

    let range = find_binary_range(&maps, &exe_str)
        .with_context(|| format!("Could not find memory range for {exe_str}"))?;
    debug!(
        "Executable memory range: 0x{:x} - 0x{:x} (size: {} KB)",
        range.start,
        range.end,
        (range.end - range.start) / 1024
    );
    Ok(range)
}
