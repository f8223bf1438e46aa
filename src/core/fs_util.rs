//! Utility functions for filesystem operations used by the transfer pipelines.
//!
//! Provides helpers to create parent directories for incoming output files
//! and to measure available disk space before accepting a large transfer.

use std::io;
use std::path::Path;

/// Creates every missing parent directory of `path`.
///
/// Used when an output file's local destination names directories that do
/// not exist yet.
///
/// # Errors
///
/// Returns an `io::Error` if directory creation fails.
pub fn create_parent_dirs(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Returns the number of bytes available to unprivileged users on the
/// filesystem containing `path`, or `None` when it cannot be determined.
#[cfg(unix)]
pub fn available_disk_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

/// Fallback for non-unix targets: the check is skipped.
#[cfg(not(unix))]
pub fn available_disk_bytes(_path: &Path) -> Option<u64> {
    None
}

/// True if the filesystem containing `path` has at least `needed` bytes free
/// beyond the configured `threshold`. Unknown availability passes the check.
pub fn has_disk_space_for(path: &Path, needed: u64, threshold: u64) -> bool {
    match available_disk_bytes(path) {
        Some(available) => available > needed.saturating_add(threshold),
        None => true,
    }
}
