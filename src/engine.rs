use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::builtins::{self, DirContext};
use crate::cancel::Controller;
use crate::classify::{self, Outcome};
use crate::collector::{self, WaitMode};
use crate::config::EngineConfig;
use crate::error::ExecError;
use crate::pipeline::{self, Channels, FirstInput};
use crate::spawner::{self, Launch, Spawned};
use crate::terminal::ForegroundGuard;
use crate::splitter::{self, Parsed};
use crate::watch::{self, SessionId, WatchHandle, WatchQueue};

/// The command execution engine handed to the UI layer.
///
/// Cheap to clone; clones share the configuration and the cancellation
/// controller, so a clone moved into a Ctrl-C handler interrupts whatever
/// the original is running.
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    controller: Arc<Controller>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            controller: Arc::new(Controller::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Run `line` against the process-wide working directory. `cd` changes
    /// the directory of the whole process.
    pub fn execute(&self, line: &str) -> Outcome {
        self.run(line, DirContext::Global)
    }

    /// Run `line` against a tab-owned directory. `cd` rewrites `cwd` and
    /// never touches the process-wide directory; children start in `cwd`.
    pub fn execute_in(&self, line: &str, cwd: &mut PathBuf) -> Outcome {
        self.run(line, DirContext::Scoped(cwd))
    }

    /// Interrupt whatever this engine is running. Safe to call from any
    /// thread, including a `ctrlc` handler thread. Code running inside a real
    /// signal handler calls [`Controller::raise`] on
    /// [`Engine::controller`] instead.
    pub fn request_interrupt(&self) {
        self.controller.request_interrupt();
    }

    /// True (once) if the last invocation had an interrupt delivered to its
    /// children, so the caller can append a `^C` marker.
    pub fn take_interrupted(&self) -> bool {
        self.controller.take_delivered()
    }

    /// Start a detached watch session publishing into `queue`.
    ///
    /// The session has its own cancellation controller; stop it through the
    /// returned handle, not [`Engine::request_interrupt`].
    pub fn start_watch(
        &self,
        commands: Vec<String>,
        session: SessionId,
        prior_scrollback: Vec<String>,
        cwd: Option<PathBuf>,
        queue: WatchQueue,
    ) -> io::Result<WatchHandle> {
        watch::start(
            Arc::clone(&self.config),
            commands,
            session,
            prior_scrollback,
            cwd,
            queue,
        )
    }

    fn run(&self, line: &str, mut ctx: DirContext<'_>) -> Outcome {
        // A request raised while idle must not kill the next command.
        self.controller.reset();

        let segments = match splitter::parse_line(line) {
            Parsed::Empty => return Outcome::blank(),
            Parsed::ChangeDir(target) => {
                return match builtins::change_dir(&target, &mut ctx) {
                    Ok(()) => Outcome::blank(),
                    Err(e) => Outcome::error(e.to_string()),
                };
            }
            Parsed::Pipeline(segments) => segments,
        };

        let cwd = ctx.spawn_dir();
        match run_pipeline(
            &segments,
            cwd.as_deref(),
            self.config.first_input,
            WaitMode::Blocking,
            &self.config,
            &self.controller,
        ) {
            Ok(outcome) => outcome,
            Err(e) => Outcome::error(e.to_string()),
        }
    }
}

/// Build, launch, collect and classify one pipeline.
///
/// Every child that was started is waited on before this returns, including
/// on the spawn-failure path.
pub(crate) fn run_pipeline(
    segments: &[String],
    cwd: Option<&Path>,
    first: FirstInput,
    mode: WaitMode,
    config: &EngineConfig,
    controller: &Controller,
) -> Result<Outcome, ExecError> {
    let routes = pipeline::plan(segments.len(), first);
    let mut channels = Channels::allocate(segments.len())?;

    let launch = spawner::spawn_all(
        segments,
        &routes,
        &mut channels,
        &config.shell,
        cwd,
        controller,
    );

    // Held until every stage is reaped.
    let _terminal = match (first, launch.pgid) {
        (FirstInput::Inherit, Some(pgid)) => ForegroundGuard::acquire(libc::STDIN_FILENO, pgid),
        _ => None,
    };

    let Launch {
        children,
        failure,
        ..
    } = launch;
    if let Some(failure) = failure {
        return Err(abort_launch(children, channels, failure, controller));
    }

    let (stdout, stderr) = channels.into_capture_readers();
    let collected = collector::collect(stdout, stderr, mode, controller);

    let mut statuses = Vec::with_capacity(children.len());
    for mut spawned in children {
        match controller.wait(&mut spawned.child) {
            Ok(status) => statuses.push(Some(status)),
            Err(e) => {
                warn!(segment = spawned.segment.as_str(), error = %e, "failed to wait for child");
                statuses.push(None);
            }
        }
    }

    let captured = collected.map_err(ExecError::Collect)?;
    debug!(segments = segments.len(), ?statuses, "pipeline finished");
    Ok(classify::classify(&statuses, &captured, config.strip_ansi))
}

/// Clean up after a launch that stopped early: close every channel end so
/// the siblings that did start see EOF or SIGPIPE, then reap them.
fn abort_launch(
    children: Vec<Spawned>,
    channels: Channels,
    failure: ExecError,
    controller: &Controller,
) -> ExecError {
    drop(channels);
    for mut spawned in children {
        if let Err(e) = controller.wait(&mut spawned.child) {
            warn!(segment = spawned.segment.as_str(), error = %e, "failed to reap sibling");
        }
    }
    failure
}
