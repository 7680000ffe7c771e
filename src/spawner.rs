use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};

use tracing::{debug, warn};

use crate::cancel::Controller;
use crate::error::ExecError;
use crate::pipeline::{Channels, Route};

/// A running child and the segment it executes.
#[derive(Debug)]
pub struct Spawned {
    pub child: Child,
    pub segment: String,
}

/// Result of launching a pipeline: everything that did start, plus the
/// error that stopped the launch early, if any.
#[derive(Debug)]
pub struct Launch {
    pub children: Vec<Spawned>,
    /// Process group shared by every stage (the first stage's pid).
    pub pgid: Option<u32>,
    pub failure: Option<ExecError>,
}

/// Start one `<shell> -c <segment>` child per segment, wired per `routes`.
///
/// All channels already exist when this runs, so no child can write into a
/// channel before its reader has been created. Each child is registered with
/// `controller` as soon as it is running. The first stage leads a new
/// process group and the later stages join it. A child inherits only the
/// three standard streams: pipe handles are close-on-exec, and the parent's
/// copy of each routed end is dropped together with the child's `Command`.
pub fn spawn_all(
    segments: &[String],
    routes: &[Route],
    channels: &mut Channels,
    shell: &str,
    cwd: Option<&Path>,
    controller: &Controller,
) -> Launch {
    let mut children = Vec::with_capacity(segments.len());
    let mut pgid = None;

    for (segment, route) in segments.iter().zip(routes) {
        match spawn_one(segment, *route, channels, shell, cwd, pgid) {
            Ok(child) => {
                let group = *pgid.get_or_insert(child.id());
                controller.register(child.id(), group, segment);
                children.push(Spawned {
                    child,
                    segment: segment.clone(),
                });
            }
            Err(failure) => {
                warn!(segment = segment.as_str(), error = %failure, "pipeline launch aborted");
                return Launch {
                    children,
                    pgid,
                    failure: Some(failure),
                };
            }
        }
    }

    Launch {
        children,
        pgid,
        failure: None,
    }
}

fn spawn_one(
    segment: &str,
    route: Route,
    channels: &mut Channels,
    shell: &str,
    cwd: Option<&Path>,
    pgid: Option<u32>,
) -> Result<Child, ExecError> {
    let spawn_error = |source| ExecError::Spawn {
        segment: segment.to_string(),
        source,
    };

    let io = channels.stage_io(route).map_err(spawn_error)?;
    let group = match pgid {
        Some(pgid) => libc::pid_t::try_from(pgid).map_err(|_| {
            spawn_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "process group id out of range",
            ))
        })?,
        None => 0,
    };

    let mut command = Command::new(shell);
    command
        .arg("-c")
        .arg(segment)
        .stdin(io.stdin)
        .stdout(io.stdout)
        .stderr(io.stderr)
        // One group per pipeline, so an interrupt also reaches whatever the
        // interpreter forks.
        .process_group(group);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let child = command.spawn().map_err(spawn_error)?;
    debug!(pid = child.id(), segment, ?route, "spawned segment");
    Ok(child)
}
