//! Cancellation controller: the registry of running children plus the
//! cooperative interrupt flag.
//!
//! The flag is a single atomic word so it can be raised from a context that
//! must not take locks (a real signal handler); raising it also writes one
//! byte to a self-pipe that the collector polls. Delivering the signal needs
//! the registry lock and therefore only happens from ordinary code that
//! polls the flag, or from [`Controller::request_interrupt`], which never
//! blocks on the lock.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use os_pipe::{PipeReader, PipeWriter};
use tracing::{debug, warn};

/// A registered child: the segment it runs and the process group it is in.
#[derive(Debug)]
struct Entry {
    segment: String,
    pgid: u32,
}

/// Self-pipe that lets [`Controller::raise`] wake a collector parked in
/// `poll` without taking any lock.
#[derive(Debug)]
struct Wake {
    reader: PipeReader,
    writer: PipeWriter,
}

impl Wake {
    fn new() -> io::Result<Self> {
        let (reader, writer) = os_pipe::pipe()?;
        set_nonblocking(reader.as_raw_fd())?;
        set_nonblocking(writer.as_raw_fd())?;
        Ok(Self { reader, writer })
    }

    /// Async-signal-safe: a single `write(2)`. A full pipe already means a
    /// wake-up is pending, so errors are ignored.
    fn notify(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.writer.as_raw_fd(), (&raw const byte).cast(), 1);
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe {
                libc::read(self.reader.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if rc <= 0 {
                break;
            }
        }
    }
}

/// Process-wide (or per-watch-session) registry of running children.
#[derive(Debug)]
pub struct Controller {
    /// pid -> entry, for every spawned child that has not been reaped.
    running: Mutex<HashMap<u32, Entry>>,
    /// Raised by an interrupt request, cleared when a delivery pass consumes it.
    pending: AtomicBool,
    /// Set whenever a delivery pass actually signalled at least one child.
    delivered: AtomicBool,
    wake: Option<Wake>,
}

impl Default for Controller {
    fn default() -> Self {
        let wake = Wake::new()
            .inspect_err(|e| warn!(error = %e, "no interrupt wake pipe; collectors rely on timeouts"))
            .ok();
        Self {
            running: Mutex::default(),
            pending: AtomicBool::new(false),
            delivered: AtomicBool::new(false),
            wake,
        }
    }
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly spawned child running in process group `pgid`.
    ///
    /// If an interrupt was already delivered during this invocation, the
    /// child is signalled right away: a request that raced with the launch
    /// must reach the later stages too.
    pub fn register(&self, pid: u32, pgid: u32, segment: &str) {
        let mut running = self.lock();
        running.insert(
            pid,
            Entry {
                segment: segment.to_string(),
                pgid,
            },
        );
        debug!(pid, pgid, segment, "registered child");

        if self.delivered.load(Ordering::SeqCst) {
            match send_signal(pgid, libc::SIGINT) {
                Ok(()) => debug!(pid, pgid, "late stage interrupted on registration"),
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "failed to signal late stage"),
            }
        }
    }

    /// Number of children currently tracked.
    pub fn running(&self) -> usize {
        self.lock().len()
    }

    /// Block until `child` exits, then reap it and drop it from the registry.
    ///
    /// The exit is observed without reaping first, and the reap happens under
    /// the registry lock, so a kill pass can never signal a pid that has
    /// already been released to the OS for reuse.
    pub fn wait(&self, child: &mut Child) -> io::Result<ExitStatus> {
        let pid = child.id();
        wait_exited(pid)?;

        let mut running = self.lock();
        let status = child.wait();
        running.remove(&pid);
        drop(running);

        debug!(pid, ?status, "reaped child");
        status
    }

    /// Async-signal-safe half of an interrupt request: raises the flag and
    /// wakes any collector blocked in `poll`, which then delivers it. Safe
    /// to call from a real signal handler.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::SeqCst);
        if let Some(wake) = &self.wake {
            wake.notify();
        }
    }

    /// Request a cooperative interrupt of everything currently running.
    ///
    /// Raises the flag, then makes a best-effort delivery pass if the
    /// registry lock is free. If the lock is busy, or nothing has been
    /// registered yet, the flag stays raised for the next collector poll.
    ///
    /// Thread-safe but not async-signal-safe (it may log and touch the
    /// registry lock); signal handlers call [`Controller::raise`].
    pub fn request_interrupt(&self) {
        self.raise();

        let running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if running.is_empty() {
            return;
        }
        if self.pending.swap(false, Ordering::SeqCst) {
            self.deliver(&running, libc::SIGINT);
        }
    }

    /// Consume a pending request, signalling every registered child.
    /// Returns true if a request was pending. Repeated requests collapse
    /// into one pass.
    pub fn poll_interrupt(&self) -> bool {
        if !self.pending.swap(false, Ordering::SeqCst) {
            return false;
        }
        let running = self.lock();
        self.deliver(&running, libc::SIGINT);
        true
    }

    /// Whether a request is raised but not yet consumed.
    pub fn interrupt_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Read end of the wake pipe, for a collector's poll set.
    pub fn wake_fd(&self) -> Option<RawFd> {
        self.wake.as_ref().map(|wake| wake.reader.as_raw_fd())
    }

    /// Discard queued wake-ups after the wake fd polled readable.
    pub fn clear_wake(&self) {
        if let Some(wake) = &self.wake {
            wake.drain();
        }
    }

    /// Forget stale requests and delivery records before a new invocation.
    pub fn reset(&self) {
        self.pending.store(false, Ordering::SeqCst);
        self.delivered.store(false, Ordering::SeqCst);
        self.clear_wake();
    }

    /// True (once) if an interrupt reached any child since the last reset.
    pub fn take_delivered(&self) -> bool {
        self.delivered.swap(false, Ordering::SeqCst)
    }

    /// Send `signal` to the process group of every registered child. Returns
    /// how many groups were signalled.
    pub fn signal_all(&self, signal: libc::c_int) -> usize {
        let running = self.lock();
        self.deliver(&running, signal)
    }

    /// Empty the registry, returning the pids that were still listed.
    pub fn drain(&self) -> Vec<u32> {
        self.lock().drain().map(|(pid, _)| pid).collect()
    }

    fn deliver(&self, running: &HashMap<u32, Entry>, signal: libc::c_int) -> usize {
        // Stages of one pipeline share a group; signal each group once.
        let groups: BTreeSet<u32> = running.values().map(|entry| entry.pgid).collect();
        let mut sent = 0;
        for pgid in groups {
            match send_signal(pgid, signal) {
                Ok(()) => {
                    sent += 1;
                    if signal == libc::SIGINT {
                        // A stopped group (e.g. SIGTTIN) only acts on the
                        // interrupt once it runs again.
                        let _ = send_signal(pgid, libc::SIGCONT);
                    }
                    let segments: Vec<&str> = running
                        .values()
                        .filter(|entry| entry.pgid == pgid)
                        .map(|entry| entry.segment.as_str())
                        .collect();
                    debug!(pgid, ?segments, signal, "signalled process group");
                }
                // Exited but not yet reaped; nothing to do.
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                Err(e) => warn!(pgid, signal, error = %e, "failed to signal process group"),
            }
        }
        if sent > 0 && signal == libc::SIGINT {
            self.delivered.store(true, Ordering::SeqCst);
        }
        sent
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Entry>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Signal process group `pgid`, which also reaches anything the
/// interpreter forked.
pub(crate) fn send_signal(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pgid out of range"))?;
    if pgid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid process group id"));
    }

    loop {
        let rc = unsafe { libc::kill(-pgid, signal) };
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

/// Wait for `pid` to terminate without reaping it (`WNOWAIT`).
fn wait_exited(pid: u32) -> io::Result<()> {
    let id = libc::id_t::from(pid);

    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(libc::P_PID, id, &mut info, libc::WEXITED | libc::WNOWAIT)
        };
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    fn sleeper() -> Child {
        Command::new("sleep").arg("30").process_group(0).spawn().unwrap()
    }

    #[test]
    fn wait_deregisters_child() {
        let controller = Controller::new();
        let mut child = Command::new("true").process_group(0).spawn().unwrap();
        controller.register(child.id(), child.id(), "true");
        assert_eq!(controller.running(), 1);

        let status = controller.wait(&mut child).unwrap();

        assert!(status.success());
        assert_eq!(controller.running(), 0);
    }

    #[test]
    fn repeated_requests_collapse_to_one_pass() {
        let controller = Controller::new();
        controller.raise();
        controller.raise();
        assert!(controller.poll_interrupt());
        assert!(!controller.poll_interrupt());
    }

    #[test]
    fn request_without_children_stays_pending() {
        let controller = Controller::new();
        controller.request_interrupt();
        assert!(controller.interrupt_pending());
        assert!(!controller.take_delivered());
        controller.reset();
        assert!(!controller.interrupt_pending());
    }

    #[test]
    fn raise_makes_the_wake_fd_readable() {
        let controller = Controller::new();
        let fd = controller.wake_fd().unwrap();
        controller.raise();

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 1000) };
        assert_eq!(rc, 1);

        controller.clear_wake();
        pfd.revents = 0;
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(rc, 0);
    }

    #[test]
    fn request_interrupts_registered_child() {
        let controller = Controller::new();
        let mut child = sleeper();
        controller.register(child.id(), child.id(), "sleep 30");

        controller.request_interrupt();
        let status = controller.wait(&mut child).unwrap();

        assert_eq!(crate::status::exit_code(status), 130);
        assert!(controller.take_delivered());
        assert!(!controller.interrupt_pending());
        assert_eq!(controller.running(), 0);
    }

    #[test]
    fn stage_registered_after_delivery_is_interrupted() {
        let controller = Controller::new();
        let mut first = sleeper();
        controller.register(first.id(), first.id(), "sleep 30");
        controller.request_interrupt();
        assert!(!controller.interrupt_pending());

        let mut late = sleeper();
        controller.register(late.id(), late.id(), "sleep 30");

        assert_eq!(crate::status::exit_code(controller.wait(&mut first).unwrap()), 130);
        assert_eq!(crate::status::exit_code(controller.wait(&mut late).unwrap()), 130);
        assert_eq!(controller.running(), 0);
    }

    #[test]
    fn drain_empties_registry() {
        let controller = Controller::new();
        controller.register(4_000_000, 4_000_000, "ghost");
        assert_eq!(controller.drain(), vec![4_000_000]);
        assert_eq!(controller.running(), 0);
    }
}
