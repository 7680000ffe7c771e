//! Pipeline builder: decides which channel each segment reads from and
//! writes to, and allocates those channels.
//!
//! ```text
//!   stdin ─▶ seg 0 ─relay 0─▶ seg 1 ─relay 1─▶ … ─▶ seg N-1 ─▶ stdout capture
//!              │                 │                    │
//!              └─────────────────┴────────────────────┴──────▶ stderr capture
//! ```

use std::io;
use std::process::Stdio;

use os_pipe::{PipeReader, PipeWriter};

use crate::error::{ExecError, Result};

/// Where the first segment's standard input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstInput {
    /// The engine's own standard input, unmodified.
    Inherit,
    /// An empty stream (detached watch tasks must not compete for stdin).
    Null,
}

/// Input side of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    First(FirstInput),
    /// Read side of relay channel `i`.
    Relay(usize),
}

/// Output side of one segment. Error output always goes to the shared
/// stderr capture channel and is not part of the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// Write side of relay channel `i`.
    Relay(usize),
    /// Write side of the stdout capture channel.
    Capture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub input: Source,
    pub output: Sink,
}

/// Routing for `segments` stages: stage `i` reads relay `i-1` (or the first
/// input) and writes relay `i` (or the stdout capture for the last stage).
pub fn plan(segments: usize, first: FirstInput) -> Vec<Route> {
    (0..segments)
        .map(|i| Route {
            input: if i == 0 {
                Source::First(first)
            } else {
                Source::Relay(i - 1)
            },
            output: if i + 1 < segments {
                Sink::Relay(i)
            } else {
                Sink::Capture
            },
        })
        .collect()
}

struct Relay {
    reader: Option<PipeReader>,
    writer: Option<PipeWriter>,
}

/// The standard streams one child is started with.
pub struct StageIo {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

/// Every channel of one invocation: `N-1` relays and the two captures.
///
/// Handles are owned, so anything allocated before a failure is closed
/// when the partially built value is dropped.
pub struct Channels {
    relays: Vec<Relay>,
    stdout_reader: PipeReader,
    stdout_writer: Option<PipeWriter>,
    stderr_reader: PipeReader,
    stderr_writer: PipeWriter,
}

impl Channels {
    /// Allocate the channels for a pipeline of `segments` stages.
    pub fn allocate(segments: usize) -> Result<Self> {
        let relay_count = segments.saturating_sub(1);
        let mut relays = Vec::with_capacity(relay_count);
        for _ in 0..relay_count {
            let (reader, writer) = os_pipe::pipe().map_err(|source| ExecError::Resource {
                channel: "relay",
                source,
            })?;
            relays.push(Relay {
                reader: Some(reader),
                writer: Some(writer),
            });
        }

        let (stdout_reader, stdout_writer) =
            os_pipe::pipe().map_err(|source| ExecError::Resource {
                channel: "capture_out",
                source,
            })?;
        let (stderr_reader, stderr_writer) =
            os_pipe::pipe().map_err(|source| ExecError::Resource {
                channel: "capture_err",
                source,
            })?;

        Ok(Self {
            relays,
            stdout_reader,
            stdout_writer: Some(stdout_writer),
            stderr_reader,
            stderr_writer,
        })
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    /// Hand out the handles `route` needs. Relay ends and the stdout capture
    /// writer move into the returned value, so the parent's copy is gone as
    /// soon as the child's `Command` is dropped; the stderr writer is
    /// duplicated because every stage shares it.
    pub fn stage_io(&mut self, route: Route) -> io::Result<StageIo> {
        let stdin = match route.input {
            Source::First(FirstInput::Inherit) => Stdio::inherit(),
            Source::First(FirstInput::Null) => Stdio::null(),
            Source::Relay(i) => self
                .relays
                .get_mut(i)
                .and_then(|relay| relay.reader.take())
                .map(Stdio::from)
                .ok_or_else(|| missing("relay read end", i))?,
        };

        let stdout = match route.output {
            Sink::Relay(i) => self
                .relays
                .get_mut(i)
                .and_then(|relay| relay.writer.take())
                .map(Stdio::from)
                .ok_or_else(|| missing("relay write end", i))?,
            Sink::Capture => self
                .stdout_writer
                .take()
                .map(Stdio::from)
                .ok_or_else(|| missing("stdout capture", 0))?,
        };

        let stderr = Stdio::from(self.stderr_writer.try_clone()?);

        Ok(StageIo {
            stdin,
            stdout,
            stderr,
        })
    }

    /// Close everything the parent must not hold while collecting (all relay
    /// ends, both capture write ends) and keep the two capture read ends.
    pub fn into_capture_readers(self) -> (PipeReader, PipeReader) {
        let Self {
            relays,
            stdout_reader,
            stdout_writer,
            stderr_reader,
            stderr_writer,
        } = self;
        drop(relays);
        drop(stdout_writer);
        drop(stderr_writer);
        (stdout_reader, stderr_reader)
    }
}

fn missing(what: &str, index: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{what} {index} already handed out"),
    )
}
