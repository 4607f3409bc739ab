use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianArcSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Symbolizer for resolving file addresses to functions and source locations
///
/// DWARF is tried first; the ELF symbol table fills in when DWARF has no
/// qualified name (stripped or line-tables-only builds). Results, including
/// misses, are cached per address because the same blocking sites recur.
pub struct Symbolizer {
    ctx: Context<EndianArcSlice<RunTimeEndian>>,
    /// Text symbols sorted by address
    symbols: Vec<TextSymbol>,
    /// Lowest virtual address of any loadable segment
    image_base: u64,
    /// Cache of resolved frames by address
    cache: RefCell<HashMap<u64, Option<ResolvedFrame>>>,
}

struct TextSymbol {
    addr: u64,
    size: u64,
    name: String,
}

impl Symbolizer {
    /// Create a new symbolizer for the given binary
    ///
    /// # Errors
    /// Returns an error if the binary file cannot be read or parsed, or if its
    /// DWARF sections are malformed
    pub fn new<P: AsRef<Path>>(binary_path: P) -> Result<Self> {
        let binary_data = fs::read(binary_path.as_ref()).context("Failed to read binary file")?;

        let obj_file = object::File::parse(&*binary_data).context("Failed to parse object file")?;

        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianArcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianArcSlice::new(Arc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?;

        let mut symbols: Vec<TextSymbol> = obj_file
            .symbols()
            .filter(|sym| sym.kind() == SymbolKind::Text && sym.address() != 0)
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                Some(TextSymbol { addr: sym.address(), size: sym.size(), name: name.to_string() })
            })
            .collect();
        symbols.sort_by_key(|sym| sym.addr);

        let image_base = obj_file.segments().map(|seg| seg.address()).min().unwrap_or(0);

        Ok(Self { ctx, symbols, image_base, cache: RefCell::new(HashMap::new()) })
    }

    /// Lowest virtual address of the binary's loadable segments
    ///
    /// Zero for position-independent executables; subtracting it from the
    /// mapping start yields the load bias.
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    /// Resolve a file address to the function containing it
    ///
    /// Returns `None` if neither DWARF nor the symbol table knows the address.
    pub fn resolve(&self, addr: u64) -> Option<ResolvedFrame> {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let mut frames = Vec::new();

        if let Ok(mut frame_iter) = self.ctx.find_frames(addr).skip_all_loads() {
            while let Ok(Some(frame)) = frame_iter.next() {
                let Some(function) =
                    frame.function.and_then(|f| f.demangle().ok().map(|s| s.to_string()))
                else {
                    continue;
                };

                let location = frame.location.map(|loc| SourceLocation {
                    file: loc.file.map(std::string::ToString::to_string),
                    line: loc.line,
                    column: loc.column,
                });

                frames.push(InlinedFrame { function, location });
            }
        }

        // DWARF may only carry the short name ("lock") of the physical function
        let needs_symbol = frames.last().map_or(true, |f| !f.function.contains("::"));
        if needs_symbol {
            if let Some(name) = self.symbol_name(addr) {
                match frames.last_mut() {
                    Some(outermost) => outermost.function = name,
                    None => frames.push(InlinedFrame { function: name, location: None }),
                }
            }
        }

        let resolved = if frames.is_empty() { None } else { Some(ResolvedFrame { addr, frames }) };

        self.cache.borrow_mut().insert(addr, resolved.clone());

        resolved
    }

    fn symbol_name(&self, addr: u64) -> Option<String> {
        let idx = self.symbols.partition_point(|sym| sym.addr <= addr);
        let sym = self.symbols.get(idx.checked_sub(1)?)?;
        if sym.size != 0 && addr >= sym.addr + sym.size {
            return None;
        }
        Some(Self::demangle_symbol(&sym.name))
    }

    /// Demangle a Rust symbol name
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

/// A resolved address (may contain multiple inlined frames)
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub addr: u64,
    /// Innermost first; the last entry is the function physically containing `addr`
    pub frames: Vec<InlinedFrame>,
}

impl ResolvedFrame {
    /// The function physically containing the address
    #[must_use]
    pub fn outermost(&self) -> Option<&InlinedFrame> {
        self.frames.last()
    }
}

/// An inlined frame within a resolved frame
#[derive(Debug, Clone)]
pub struct InlinedFrame {
    pub function: String,
    pub location: Option<SourceLocation>,
}

/// Source code location
#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl SourceLocation {
    /// `file:line` with the directory stripped, if a file is known
    #[must_use]
    pub fn short(&self) -> Option<String> {
        let file = self.file.as_deref()?;
        let short = Path::new(file).file_name().and_then(|s| s.to_str()).unwrap_or(file);
        Some(match self.line {
            Some(line) => format!("{short}:{line}"),
            None => short.to_string(),
        })
    }
}
