use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectSection};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// DWARF-backed resolver for one binary
///
/// Caches every address it has resolved; callstacks repeat the same return
/// addresses over and over. Not `Send`: build it on the thread that uses it.
pub struct Symbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    cache: RefCell<HashMap<u64, ResolvedFrame>>,
    position_independent: bool,
}

impl Symbolizer {
    /// Load DWARF sections from `binary_path`
    ///
    /// # Errors
    /// Returns an error if the binary cannot be read or parsed, or if DWARF debug info is missing
    pub fn new<P: AsRef<Path>>(binary_path: P) -> Result<Self> {
        let binary_data = fs::read(binary_path.as_ref())
            .with_context(|| format!("Failed to read {}", binary_path.as_ref().display()))?;

        let obj_file = object::File::parse(&*binary_data).context("Failed to parse object file")?;

        let position_independent = obj_file.kind() == object::ObjectKind::Dynamic;
        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?;

        Ok(Self { ctx, cache: RefCell::new(HashMap::new()), position_independent })
    }

    /// Resolve a file-relative address, innermost inlined frame first
    pub fn resolve(&self, addr: u64) -> ResolvedFrame {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let mut frames = Vec::new();
        if let Ok(mut frame_iter) = self.ctx.find_frames(addr).skip_all_loads() {
            while let Ok(Some(frame)) = frame_iter.next() {
                let function = frame
                    .function
                    .and_then(|f| f.demangle().ok().map(|s| s.to_string()))
                    .unwrap_or_else(|| UNKNOWN.to_string());

                let (file, line) = frame
                    .location
                    .map(|loc| (loc.file.map(str::to_string), loc.line))
                    .unwrap_or_default();

                frames.push(InlinedFrame { function, file, line });
            }
        }

        let resolved = ResolvedFrame {
            addr,
            frames: if frames.is_empty() {
                vec![InlinedFrame { function: UNKNOWN.to_string(), file: None, line: None }]
            } else {
                frames
            },
        };

        self.cache.borrow_mut().insert(addr, resolved.clone());
        resolved
    }

    /// Demangle a Rust symbol name without the hash suffix
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }

    /// PIE binaries need runtime addresses rebased before lookup
    #[must_use]
    pub fn is_position_independent(&self) -> bool {
        self.position_independent
    }

    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.borrow().len()
    }
}

pub(crate) const UNKNOWN: &str = "<unknown>";

/// All frames for one code address (more than one when inlined)
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub addr: u64,
    pub frames: Vec<InlinedFrame>,
}

#[derive(Debug, Clone)]
pub struct InlinedFrame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl ResolvedFrame {
    /// Multi-line rendering: `#N 0xADDR function` then `at file:line`
    #[must_use]
    pub fn format(&self, frame_num: usize) -> String {
        use std::fmt::Write as _;

        let mut output = String::new();
        for (idx, inlined) in self.frames.iter().enumerate() {
            let prefix = if idx == 0 { format!("#{frame_num:<2}") } else { "   ".to_string() };
            let _ = write!(output, "{} 0x{:016x} {}", prefix, self.addr, inlined.function);
            if let Some(file) = &inlined.file {
                let _ = write!(output, "\n                      at {file}");
                if let Some(line) = inlined.line {
                    let _ = write!(output, ":{line}");
                }
            }
            if idx + 1 < self.frames.len() {
                output.push('\n');
            }
        }
        output
    }
}
