//! Output collector: drains the stdout and stderr capture channels with a
//! single `poll(2)` reactor until both reach end-of-stream.

use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::time::Duration;

use os_pipe::PipeReader;
use tracing::{debug, trace};

use crate::cancel::Controller;

const BUF_SIZE: usize = 4096;

/// How the readiness wait blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// No timeout: wake only on data, hang-up, or a signal.
    Blocking,
    /// Wake at least this often to re-check for cancellation.
    Polling(Duration),
}

impl WaitMode {
    fn timeout_ms(self) -> libc::c_int {
        match self {
            WaitMode::Blocking => -1,
            WaitMode::Polling(every) => {
                libc::c_int::try_from(every.as_millis().max(1)).unwrap_or(libc::c_int::MAX)
            }
        }
    }
}

/// Raw bytes captured from one invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Per-channel reactor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    /// Watching for readiness.
    Open,
    /// Hang-up seen; keep reading until a zero-length read.
    Draining,
    /// End-of-stream reached and the read end closed.
    Closed,
}

struct Channel {
    reader: Option<PipeReader>,
    state: ChannelState,
    bytes: Vec<u8>,
}

impl Channel {
    fn new(reader: PipeReader) -> Self {
        Self {
            reader: Some(reader),
            state: ChannelState::Open,
            bytes: Vec::new(),
        }
    }

    fn raw_fd(&self) -> libc::c_int {
        match (&self.reader, self.state) {
            (Some(reader), ChannelState::Open | ChannelState::Draining) => reader.as_raw_fd(),
            // Negative descriptors are ignored by poll.
            _ => -1,
        }
    }

    /// One read after a readiness notification.
    fn on_ready(&mut self, revents: libc::c_short, buf: &mut [u8]) -> io::Result<()> {
        if revents & (libc::POLLHUP | libc::POLLERR) != 0 && self.state == ChannelState::Open {
            self.state = ChannelState::Draining;
        }

        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };
        match reader.read(buf) {
            Ok(0) => self.close(),
            Ok(n) => self.bytes.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                self.close();
                return Err(e);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.reader = None;
        self.state = ChannelState::Closed;
    }

    fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }
}

/// Drain both capture channels to end-of-stream.
///
/// Before every wait the collector consumes any pending interrupt request and
/// signals the registered children; signalling never blocks, so the loop
/// keeps draining while the children shut down. The controller's wake fd is
/// part of the poll set, so a request raised from a signal handler ends a
/// blocking wait.
pub fn collect(
    stdout: PipeReader,
    stderr: PipeReader,
    mode: WaitMode,
    controller: &Controller,
) -> io::Result<Captured> {
    let mut channels = [Channel::new(stdout), Channel::new(stderr)];
    let mut buf = [0u8; BUF_SIZE];
    let timeout = mode.timeout_ms();
    let wake_fd = controller.wake_fd().unwrap_or(-1);

    while !channels.iter().all(Channel::is_closed) {
        if controller.poll_interrupt() {
            debug!("interrupt delivered while collecting");
        }

        let mut fds = [
            pollfd(channels[0].raw_fd()),
            pollfd(channels[1].raw_fd()),
            pollfd(wake_fd),
        ];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            trace!("collector poll timed out");
            continue;
        }

        if fds[2].revents != 0 {
            // An interrupt was raised; the next turn delivers it.
            controller.clear_wake();
        }
        for (channel, fd) in channels.iter_mut().zip(&fds) {
            if fd.fd < 0 || fd.revents == 0 {
                continue;
            }
            if fd.revents & libc::POLLNVAL != 0 {
                channel.close();
                continue;
            }
            channel.on_ready(fd.revents, &mut buf)?;
        }
    }

    let [stdout, stderr] = channels;
    debug!(
        stdout_bytes = stdout.bytes.len(),
        stderr_bytes = stderr.bytes.len(),
        "capture channels closed"
    );
    Ok(Captured {
        stdout: stdout.bytes,
        stderr: stderr.bytes,
    })
}

fn pollfd(fd: libc::c_int) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}
