//! Destination preallocation: reserve the full file before any bytes move.
//!
//! The collector derives its transfer plan from the destination file's
//! length, so the file must exist at exactly the agreed size up front.
//! Positional writes then land inside already-reserved space and cannot
//! fail for lack of disk mid-transfer.

use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::error::TransferError;

/// Creates `path` (replacing any existing file) and reserves exactly
/// `size` bytes, then re-stats to verify. No partial file survives a
/// failure; a post-allocation size mismatch is fatal.
pub fn create(path: &Path, size: u64) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    if let Err(err) = reserve(&file, size) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(err).with_context(|| format!("allocate {size} bytes for {}", path.display()));
    }
    drop(file);

    let actual = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if actual != size {
        let _ = fs::remove_file(path);
        return Err(TransferError::SizeMismatch {
            path: path.to_path_buf(),
            expected: size,
            actual,
        }
        .into());
    }

    info!(size, path = %path.display(), "destination preallocated");
    Ok(())
}

#[cfg(target_os = "linux")]
fn reserve(file: &File, size: u64) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    let fd = file.as_raw_fd();
    // posix_fallocate returns the error code instead of setting errno
    let rc = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
    if rc != 0 {
        return Err(std::io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn reserve(file: &File, size: u64) -> std::io::Result<()> {
    file.set_len(size)
}
