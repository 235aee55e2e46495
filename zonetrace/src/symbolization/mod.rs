//! # Symbol Resolution for Callstack Queries
//!
//! Callstacks travel as raw return addresses. When the collector wants to
//! show one, it sends a `CallstackFrame` query and the worker answers with
//! function, file and line for every (possibly inlined) frame at that address.
//!
//! ## PIE adjustment
//!
//! DWARF line tables use file-relative addresses, while captured addresses
//! include the executable's randomized load base:
//!
//! ```text
//! Runtime Address = Base Address + File Offset
//! File Offset     = Runtime Address - Base Address
//! ```
//!
//! The base comes from our own `/proc/self/maps` entry for the executable.
//! Addresses outside that range (shared libraries) go to the platform
//! unwinder's resolver instead.
//!
//! ## Resolvers
//!
//! - [`ExecutableResolver`]: DWARF from the running binary via `addr2line`,
//!   `gimli` and `object`, with per-address caching
//! - [`BacktraceResolver`]: `backtrace::resolve`, used for shared libraries
//!   and when the executable carries no debug info
//!
//! Both are built lazily on the worker thread the first time a query needs
//! one, so processes that never get a callstack query never parse DWARF.

pub mod memory_maps;
pub mod symbolizer;

use log::{info, warn};

pub use memory_maps::{parse_maps_content, parse_memory_maps, MemoryRange};
pub use symbolizer::{InlinedFrame, ResolvedFrame, Symbolizer};

use crate::domain::Pid;
use crate::wire::SymbolFrame;

/// Address → source frames, innermost first
pub trait SymbolResolver {
    fn resolve(&mut self, address: u64) -> Vec<SymbolFrame>;
}

/// Builds the resolver on first use
pub type ResolverFactory = Box<dyn FnOnce() -> Box<dyn SymbolResolver> + Send>;

/// Resolver over the platform unwinder's symbol tables
#[derive(Debug, Default)]
pub struct BacktraceResolver;

impl SymbolResolver for BacktraceResolver {
    fn resolve(&mut self, address: u64) -> Vec<SymbolFrame> {
        let mut frames = Vec::new();
        let Ok(addr) = usize::try_from(address) else {
            return unresolved(address);
        };
        backtrace::resolve(addr as *mut std::ffi::c_void, |symbol| {
            frames.push(SymbolFrame {
                name: symbol.name().map_or_else(|| format!("0x{address:x}"), |n| format!("{n:#}")),
                file: symbol.filename().map(|p| p.display().to_string()).unwrap_or_default(),
                line: symbol.lineno().unwrap_or(0),
            });
        });
        if frames.is_empty() {
            unresolved(address)
        } else {
            frames
        }
    }
}

fn unresolved(address: u64) -> Vec<SymbolFrame> {
    vec![SymbolFrame { name: format!("0x{address:x}"), file: String::new(), line: 0 }]
}

/// DWARF resolver for the running executable
pub struct ExecutableResolver {
    symbolizer: Symbolizer,
    range: Option<MemoryRange>,
    fallback: BacktraceResolver,
}

impl ExecutableResolver {
    /// # Errors
    /// Fails when the executable cannot be located, read or parsed.
    pub fn for_current_exe() -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let exe = std::env::current_exe().context("Failed to locate current executable")?;
        crate::preflight::check_debug_symbols(&exe)?;
        let symbolizer = Symbolizer::new(&exe)?;
        let range = if symbolizer.is_position_independent() {
            let path = exe.to_string_lossy();
            match parse_memory_maps(Pid::current(), &path) {
                Ok(range) => Some(range),
                Err(e) => {
                    warn!("Failed to get memory range: {e}. Symbol resolution may not work.");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self::new(symbolizer, range))
    }

    #[must_use]
    pub fn new(symbolizer: Symbolizer, range: Option<MemoryRange>) -> Self {
        Self { symbolizer, range, fallback: BacktraceResolver }
    }

    fn file_offset(&self, address: u64) -> Option<u64> {
        match self.range {
            Some(range) => range.to_file_offset(address),
            None if self.symbolizer.is_position_independent() => None,
            None => Some(address),
        }
    }
}

impl SymbolResolver for ExecutableResolver {
    fn resolve(&mut self, address: u64) -> Vec<SymbolFrame> {
        let Some(offset) = self.file_offset(address) else {
            return self.fallback.resolve(address);
        };
        let resolved = self.symbolizer.resolve(offset);
        if resolved.frames.iter().all(|f| f.function == symbolizer::UNKNOWN) {
            return self.fallback.resolve(address);
        }
        resolved
            .frames
            .into_iter()
            .map(|f| SymbolFrame { name: f.function, file: f.file.unwrap_or_default(), line: f.line.unwrap_or(0) })
            .collect()
    }
}

/// Factory used when the application does not install its own
#[must_use]
pub fn default_resolver_factory() -> ResolverFactory {
    Box::new(|| match ExecutableResolver::for_current_exe() {
        Ok(resolver) => {
            info!("Resolving callstacks from executable debug info");
            Box::new(resolver)
        }
        Err(e) => {
            warn!("Executable symbolizer unavailable ({e:#}), falling back to unwinder symbols");
            Box::new(BacktraceResolver)
        }
    })
}
