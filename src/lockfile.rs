//! Advisory lock files shared between the control plane and worker processes.
//!
//! Every process that touches a shared record (the conduit file, the worker
//! manifest, a channel's worker directory) takes the matching lock first.
//! Acquisition is always bounded: callers either get the lock within the
//! timeout or receive an error they can report.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Delay between non-blocking acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a single non-blocking acquisition attempt.
pub enum LockOutcome {
    Acquired(LockGuard),
    /// Another holder has the lock right now.
    Contended,
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: fs::File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

/// Try to take the lock at `path` without blocking.
///
/// Distinguishes contention from real IO/permission errors so callers can
/// skip or retry on the former and surface the latter.
pub fn try_lock(path: &Path) -> Result<LockOutcome> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

    if flock_nonblocking(&file).with_context(|| format!("flock failed on {}", path.display()))? {
        Ok(LockOutcome::Acquired(LockGuard {
            file,
            path: path.to_path_buf(),
        }))
    } else {
        Ok(LockOutcome::Contended)
    }
}

/// Take the lock from async code, yielding to the runtime between attempts.
pub async fn lock(path: &Path, timeout: Duration) -> Result<LockGuard> {
    let deadline = Instant::now() + timeout;
    loop {
        if let LockOutcome::Acquired(guard) = try_lock(path)? {
            return Ok(guard);
        }
        if Instant::now() >= deadline {
            bail!(
                "Timed out after {}ms waiting for lock {}",
                timeout.as_millis(),
                path.display()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
fn flock_nonblocking(file: &fs::File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(unix)]
fn unlock(file: &fs::File) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

// Advisory locking is a no-op where flock is unavailable.
#[cfg(not(unix))]
fn flock_nonblocking(_file: &fs::File) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn unlock(_file: &fs::File) {}
