//! Memory map parsing for PIE address adjustment
//!
//! Return addresses captured at runtime include the load base of the
//! executable; DWARF works with file-relative addresses. `/proc/<pid>/maps`
//! tells us where the binary landed.

use anyhow::{Context, Result};
use log::info;
use std::fs;

use crate::domain::Pid;

/// Address range covered by every mapping of one binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Runtime address → file-relative address, when it belongs to this range
    #[must_use]
    pub fn to_file_offset(&self, addr: u64) -> Option<u64> {
        self.contains(addr).then(|| addr - self.start)
    }
}

/// Find the range of `binary_path` in the maps of process `pid`
///
/// # Errors
/// Returns an error if the maps file cannot be read or the binary is not mapped
pub fn parse_memory_maps(pid: Pid, binary_path: &str) -> Result<MemoryRange> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let maps = fs::read_to_string(&maps_path).with_context(|| format!("Failed to read {maps_path}"))?;
    let range = parse_maps_content(&maps, binary_path)?;
    info!(
        "Executable memory range: 0x{:x} - 0x{:x} (size: {} KB)",
        range.start,
        range.end,
        (range.end - range.start) / 1024
    );
    Ok(range)
}

/// Same as [`parse_memory_maps`] over already-read maps text
///
/// # Errors
/// Returns an error on malformed ranges or when no line names the binary
pub fn parse_maps_content(maps: &str, binary_path: &str) -> Result<MemoryRange> {
    let mut range: Option<MemoryRange> = None;

    // "start-end perms offset dev inode pathname"
    for line in maps.lines() {
        let mut parts = line.split_whitespace();
        let Some(addresses) = parts.next() else { continue };
        if parts.nth(4) != Some(binary_path) {
            continue;
        }
        let Some((start, end)) = addresses.split_once('-') else { continue };
        let start = u64::from_str_radix(start, 16).context("Failed to parse range start")?;
        let end = u64::from_str_radix(end, 16).context("Failed to parse range end")?;

        range = Some(match range {
            Some(r) => MemoryRange { start: r.start.min(start), end: r.end.max(end) },
            None => MemoryRange { start, end },
        });
    }

    range.ok_or_else(|| anyhow::anyhow!("Could not find memory range for {binary_path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a20000 r--p 00000000 fd:01 393 /usr/bin/app
55d0c0a20000-55d0c0b00000 r-xp 00020000 fd:01 393 /usr/bin/app
55d0c0b00000-55d0c0b10000 rw-p 00100000 fd:01 393 /usr/bin/app
55d0c1000000-55d0c1021000 rw-p 00000000 00:00 0   [heap]
7f1e2a000000-7f1e2a200000 r-xp 00000000 fd:01 812 /usr/lib/libc.so.6
";

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
        assert_eq!(range.to_file_offset(0x1780), Some(0x780));
        assert_eq!(range.to_file_offset(0x3000), None);
    }

    #[test]
    fn test_parse_spans_all_mappings_of_binary() {
        let range = parse_maps_content(MAPS, "/usr/bin/app").unwrap();
        assert_eq!(range, MemoryRange { start: 0x55d0_c0a0_0000, end: 0x55d0_c0b1_0000 });
    }

    #[test]
    fn test_parse_ignores_other_paths() {
        assert!(parse_maps_content(MAPS, "/usr/bin/ap").is_err());
        let libc = parse_maps_content(MAPS, "/usr/lib/libc.so.6").unwrap();
        assert_eq!(libc.start, 0x7f1e_2a00_0000);
    }

    #[test]
    fn test_parse_own_process() {
        let exe = std::env::current_exe().unwrap();
        // Not every sandbox exposes /proc; only check consistency when it does
        if let Ok(range) = parse_memory_maps(Pid::current(), exe.to_str().unwrap()) {
            assert!(range.start < range.end);
        }
    }
}
