//! Controlling-terminal handoff for pipelines that inherit a terminal stdin.
//!
//! Every pipeline runs in its own process group. A background group that
//! reads the terminal is stopped by SIGTTIN, so while such a pipeline runs
//! it is made the terminal's foreground group, and the engine's group gets
//! the terminal back once every stage has been reaped.

use std::io;

use tracing::{debug, warn};

use crate::cancel::send_signal;

/// Holds the terminal for a pipeline's process group; restores the previous
/// foreground group on drop.
#[derive(Debug)]
pub struct ForegroundGuard {
    fd: libc::c_int,
    previous: libc::pid_t,
}

impl ForegroundGuard {
    /// Give the terminal on `fd` to process group `pgid`, if `fd` is a
    /// terminal this process controls. Returns `None` (and changes nothing)
    /// otherwise.
    pub fn acquire(fd: libc::c_int, pgid: u32) -> Option<Self> {
        if unsafe { libc::isatty(fd) } != 1 {
            return None;
        }
        let target = libc::pid_t::try_from(pgid).ok()?;
        let foreground = unsafe { libc::tcgetpgrp(fd) };
        if foreground < 0 {
            debug!(fd, error = %io::Error::last_os_error(), "stdin is not our controlling terminal");
            return None;
        }
        // Only the foreground group may lend the terminal out.
        let previous = unsafe { libc::getpgrp() };
        if foreground != previous {
            debug!(fd, foreground, "engine is not in the foreground; terminal left alone");
            return None;
        }

        if let Err(e) = set_foreground(fd, target) {
            warn!(fd, pgid, error = %e, "could not hand the terminal to the pipeline");
            return None;
        }
        // A stage that touched the terminal before the handoff was stopped
        // by SIGTTIN; let it retry as the foreground group.
        if let Err(e) = send_signal(pgid, libc::SIGCONT) {
            if e.raw_os_error() != Some(libc::ESRCH) {
                warn!(pgid, error = %e, "failed to resume pipeline group");
            }
        }
        debug!(fd, pgid, previous, "terminal handed to pipeline");
        Some(Self { fd, previous })
    }
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        if let Err(e) = set_foreground(self.fd, self.previous) {
            warn!(fd = self.fd, error = %e, "could not take the terminal back");
        }
    }
}

/// Ignores a signal for as long as it lives.
struct SignalIgnoreGuard {
    signal: libc::c_int,
    previous: libc::sighandler_t,
}

impl SignalIgnoreGuard {
    fn ignore(signal: libc::c_int) -> io::Result<Self> {
        let previous = unsafe { libc::signal(signal, libc::SIG_IGN) };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { signal, previous })
    }
}

impl Drop for SignalIgnoreGuard {
    fn drop(&mut self) {
        unsafe {
            libc::signal(self.signal, self.previous);
        }
    }
}

fn set_foreground(fd: libc::c_int, pgid: libc::pid_t) -> io::Result<()> {
    if pgid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid process group id",
        ));
    }

    // Taking the terminal back happens from a background group.
    let _sigttou = SignalIgnoreGuard::ignore(libc::SIGTTOU)?;
    loop {
        let rc = unsafe { libc::tcsetpgrp(fd, pgid) };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}
