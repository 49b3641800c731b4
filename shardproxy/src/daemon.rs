//! Daemonization (§10.2): `fork`/`setsid` via `libc`, matching the teacher
//! stack's direct use of `libc` for low-level process control, plus a pid
//! file write so an init system or `kill $(cat pid)` can manage the process.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Forks the process, detaches the child from its controlling terminal via
/// `setsid`, and exits the parent. Must be called before any threads are
/// spawned (the event loop, stats HTTP thread, hotset pollers) — `fork()`
/// in a multi-threaded process only carries the calling thread into the
/// child, which is the one a daemonizing proxy should avoid entirely.
pub fn daemonize() -> Result<()> {
    // SAFETY: `fork` is called before any other thread exists in this
    // process (enforced by calling `daemonize` first thing in `main`), so
    // there is no risk of forking while another thread holds a lock.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        bail!("fork() failed: {}", std::io::Error::last_os_error());
    }
    if pid > 0 {
        // Parent: its job is done.
        std::process::exit(0);
    }

    // SAFETY: child process, no other threads; setsid() detaches from the
    // controlling terminal and starts a new session.
    if unsafe { libc::setsid() } < 0 {
        bail!("setsid() failed: {}", std::io::Error::last_os_error());
    }

    Ok(())
}

/// Writes the current process id to `path`, truncating any existing file.
pub fn write_pid_file(path: &Path) -> Result<()> {
    let pid = std::process::id();
    fs::write(path, format!("{pid}\n")).with_context(|| format!("writing pid file {}", path.display()))?;
    Ok(())
}
