//! Atomic recording file writes

use std::io::{self, Write};
use std::path::Path;

use tempfile::Builder;

use crate::{RecorderError, Result};

const TEMP_PREFIX: &str = ".trafficrec-";

/// Write `contents` to `path` atomically
///
/// The data goes to a temporary file in the same directory, is synced, and
/// is then moved into place. The final path is never clobbered: if it
/// already exists the write fails and the existing file is left alone.
///
/// # Errors
///
/// Returns `WriteFailure` if any step fails
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<u64> {
    write_inner(path, contents).map_err(|source| RecorderError::WriteFailure {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(contents.len() as u64)
}

fn write_inner(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut temp = Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist_noclobber(path).map_err(|e| e.error)?;

    Ok(())
}

/// Check that files can be created in `dir`
///
/// # Errors
///
/// Returns the I/O error from creating a scratch file
pub fn check_writable(dir: &Path) -> io::Result<()> {
    let scratch = Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".check")
        .tempfile_in(dir)?;
    scratch.close()
}
