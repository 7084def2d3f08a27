//! Flag-file signaling shared with the supervised subprocess.
//!
//! The control plane and the `bmad-assist` loop it supervises communicate
//! through zero-byte marker files inside the project's `.bmad-assist/`
//! directory: `stop.flag` requests a graceful stop, `pause.flag` requests a
//! pause. Presence of the file is the request; the subprocess polls for them.
//! File names and locations are a fixed wire contract and must not change.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the per-project control directory.
pub const CONTROL_DIR: &str = ".bmad-assist";

/// Marker file requesting a graceful stop.
pub const STOP_FLAG: &str = "stop.flag";

/// Marker file requesting a pause.
pub const PAUSE_FLAG: &str = "pause.flag";

/// Returns the control directory for a project root.
pub fn control_dir(root: &Path) -> PathBuf {
    root.join(CONTROL_DIR)
}

/// Returns the `stop.flag` path for a project root.
pub fn stop_flag(root: &Path) -> PathBuf {
    control_dir(root).join(STOP_FLAG)
}

/// Returns the `pause.flag` path for a project root.
pub fn pause_flag(root: &Path) -> PathBuf {
    control_dir(root).join(PAUSE_FLAG)
}

/// Creates the control directory if it does not exist.
pub fn ensure_control_dir(root: &Path) -> io::Result<()> {
    fs::create_dir_all(control_dir(root))
}

/// Creates a zero-byte flag file, creating the control directory as needed.
///
/// Idempotent: touching an existing flag truncates it back to zero bytes.
pub fn touch(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, b"")
}

/// Removes a flag file if present. Returns whether a file was removed.
pub fn remove_if_present(path: &Path) -> io::Result<bool> {
    if path.exists() {
        fs::remove_file(path)?;
        Ok(true)
    } else {
        Ok(false)
    }
}
