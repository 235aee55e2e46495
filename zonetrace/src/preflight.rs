//! Pre-flight checks
//!
//! Catch setup problems early with actionable messages instead of failing
//! halfway through a session.

use anyhow::{bail, Context, Result};
use log::warn;
use object::{Object, ObjectSection};
use std::path::Path;

/// Warn when a binary cannot give useful callstack answers
///
/// # Errors
/// Only when the file cannot be read; an unparsable binary is left to later stages.
pub fn check_debug_symbols(binary: &Path) -> Result<()> {
    let file_data =
        std::fs::read(binary).with_context(|| format!("Failed to read binary: {}", binary.display()))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        return Ok(());
    };

    let has_debug_info = obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);
    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);

    if !has_debug_info && !has_symtab {
        warn!("binary stripped, callstacks will show addresses only");
    } else if !has_debug_info {
        warn!("no DWARF debug info, callstack source locations unavailable");
    }

    Ok(())
}

/// Make sure a trace file can be created before spending a session on it
///
/// # Errors
/// When the parent directory is missing or the path names a directory.
pub fn check_export_target(path: &Path) -> Result<()> {
    if path.is_dir() {
        bail!(
            "Not a file: {}\n\n\
             --export must name the trace file to write, not a directory.",
            path.display()
        );
    }
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    if !parent.is_dir() {
        bail!(
            "Directory not found: {}\n\n\
             Create it first or choose another --export path.",
            parent.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_an_error() {
        let err = check_debug_symbols(Path::new("/nonexistent/path/to/binary")).unwrap_err();
        assert!(err.to_string().contains("Failed to read binary"));
    }

    #[test]
    fn test_non_object_file_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"not an elf").unwrap();
        assert!(check_debug_symbols(&path).is_ok());
    }

    #[test]
    fn test_export_target() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_export_target(&dir.path().join("trace.json")).is_ok());
        assert!(check_export_target(Path::new("trace.json")).is_ok());

        let err = check_export_target(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Not a file"));

        let err = check_export_target(&dir.path().join("missing/trace.json")).unwrap_err();
        assert!(err.to_string().contains("Directory not found"));
    }
}
