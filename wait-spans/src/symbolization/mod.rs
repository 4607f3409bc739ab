//! # Symbol Resolution for Captured Stacks
//!
//! Stack capture records raw instruction pointers. Naming a blocking site
//! needs the function those addresses belong to, which this module resolves
//! from the running executable's own debug information.
//!
//! ## Address Translation Flow
//!
//! ```text
//! 1. Producer captures return addresses
//!    [0x55f3a2b4c780, 0x55f3a2b4d120, ...]
//!
//! 2. /proc/self/maps gives the executable's mapping
//!    0x55f3a2b4c000 - 0x55f3a2b5f000
//!
//! 3. Addresses outside the mapping are foreign (shared libraries,
//!    unloaded code) and resolve to "unknown"
//!
//! 4. file address = runtime address - load bias - 1
//!    (the -1 moves a return address back into its call instruction)
//!
//! 5. DWARF (addr2line) -> outermost function, symbol table as fallback
//!    0x780 -> my_app::db::Pool::checkout
//! ```
//!
//! ## Module Structure
//!
//! - **`symbolizer`**: DWARF + symbol table lookups with a per-address cache
//! - **`memory_maps`**: `/proc/self/maps` parsing for the executable's range
//!
//! ## Limitations
//!
//! - **Linux only**: relies on `/proc/self/maps` and ELF
//! - **Requires symbols**: keep `debug = true` (or at least an unstripped
//!   symbol table) in the profile that builds the application

pub mod memory_maps;
pub mod symbolizer;

pub use memory_maps::{current_executable_range, find_binary_range, MemoryRange};
pub use symbolizer::{InlinedFrame, ResolvedFrame, SourceLocation, Symbolizer};
