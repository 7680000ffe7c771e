//! Watch scheduler: runs a fixed set of commands concurrently, over and over,
//! and publishes each cycle's output through a shared queue that the UI
//! drains from its own event loop.
//!
//! ```text
//!   Starting ─▶ Cycle ─▶ Publishing ─▶ Waiting ─┐
//!                 ▲                             │
//!                 └─────────────────────────────┤
//!                                               ▼
//!                                           Stopping ─▶ done
//! ```

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::cancel::Controller;
use crate::classify::Outcome;
use crate::collector::WaitMode;
use crate::config::EngineConfig;
use crate::engine::run_pipeline;
use crate::pipeline::FirstInput;

/// Identifies the tab a watch session publishes to.
pub type SessionId = u64;

/// Separator drawn around each command's output.
pub const DIVIDER: &str = "----------------------------------------";

/// Granularity of every wait in the scheduler; bounds stop latency.
const TICK: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Published once when the session starts.
    Banner(String),
    /// One complete cycle: a block per command, in command order.
    Cycle(Vec<String>),
    /// The session ended; the UI restores this scrollback and clears its
    /// input line.
    Stopped { scrollback: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchMessage {
    pub session: SessionId,
    pub event: WatchEvent,
}

/// Mutex-guarded message queue shared between watch sessions and the UI.
#[derive(Debug, Clone, Default)]
pub struct WatchQueue {
    inner: Arc<Mutex<VecDeque<WatchMessage>>>,
}

impl WatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: WatchMessage) {
        self.lock().push_back(message);
    }

    /// Take every pending message, oldest first.
    pub fn drain(&self) -> Vec<WatchMessage> {
        self.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<WatchMessage>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owner's handle on a running session. Dropping it requests a stop.
#[derive(Debug)]
pub struct WatchHandle {
    session: SessionId,
    stop: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    controller: Arc<Controller>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Ask the session to stop. Running children get SIGINT right away and
    /// SIGKILL once the grace period has passed.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            debug!(session = self.session, "watch stop requested");
            self.controller.request_interrupt();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// True once the session has published its final message.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Stop and wait for the scheduler thread to finish.
    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(session = self.session, "watch scheduler panicked");
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a session on its own thread.
pub(crate) fn start(
    config: Arc<EngineConfig>,
    commands: Vec<String>,
    session: SessionId,
    prior_scrollback: Vec<String>,
    cwd: Option<PathBuf>,
    queue: WatchQueue,
) -> io::Result<WatchHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let controller = Arc::new(Controller::new());

    let scheduler = Scheduler {
        config,
        commands,
        session,
        prior_scrollback,
        cwd,
        queue,
        stop: Arc::clone(&stop),
        done: Arc::clone(&done),
        controller: Arc::clone(&controller),
    };
    let thread = thread::Builder::new()
        .name(format!("watch-{session}"))
        .spawn(move || scheduler.run())?;

    Ok(WatchHandle {
        session,
        stop,
        done,
        controller,
        thread: Some(thread),
    })
}

enum Phase {
    Starting,
    Cycle,
    Publishing(Vec<String>),
    Waiting,
    Stopping,
}

struct Scheduler {
    config: Arc<EngineConfig>,
    commands: Vec<String>,
    session: SessionId,
    prior_scrollback: Vec<String>,
    cwd: Option<PathBuf>,
    queue: WatchQueue,
    stop: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    controller: Arc<Controller>,
}

/// What one command produced in one cycle.
struct CommandRun {
    command: String,
    started: DateTime<Local>,
    outcome: Outcome,
}

impl Scheduler {
    fn run(self) {
        info!(session = self.session, commands = self.commands.len(), "watch session started");
        let mut phase = Phase::Starting;

        loop {
            phase = match phase {
                Phase::Starting => {
                    self.publish(WatchEvent::Banner(self.banner()));
                    if self.commands.is_empty() {
                        Phase::Stopping
                    } else {
                        Phase::Cycle
                    }
                }
                Phase::Cycle => match self.run_cycle() {
                    Some(lines) => Phase::Publishing(lines),
                    None => Phase::Stopping,
                },
                Phase::Publishing(lines) => {
                    self.publish(WatchEvent::Cycle(lines));
                    Phase::Waiting
                }
                Phase::Waiting => {
                    if self.sleep_unless_stopped(self.config.watch_interval) {
                        Phase::Cycle
                    } else {
                        Phase::Stopping
                    }
                }
                Phase::Stopping => break,
            };
        }

        self.finish();
    }

    fn banner(&self) -> String {
        format!(
            "multiWatch: {} command(s) every {:.1}s (Ctrl+C to stop)",
            self.commands.len(),
            self.config.watch_interval.as_secs_f64()
        )
    }

    /// Run every command once, concurrently. Returns the formatted cycle, or
    /// `None` if a stop arrived before it completed.
    fn run_cycle(&self) -> Option<Vec<String>> {
        if self.stopped() {
            return None;
        }

        let tasks: Vec<_> = self
            .commands
            .iter()
            .map(|command| (command.clone(), self.spawn_task(command.clone())))
            .collect();

        self.supervise(&tasks);

        let mut runs = Vec::with_capacity(tasks.len());
        for (command, task) in tasks {
            let run = match task {
                Ok(handle) => handle.join().unwrap_or_else(|_| CommandRun {
                    command,
                    started: Local::now(),
                    outcome: Outcome::error("watch task panicked"),
                }),
                Err(e) => CommandRun {
                    command,
                    started: Local::now(),
                    outcome: Outcome::error(format!("spawn failed: watch task: {e}")),
                },
            };
            runs.push(run);
        }

        if self.stopped() {
            return None;
        }
        Some(runs.iter().flat_map(format_block).collect())
    }

    fn spawn_task(&self, command: String) -> io::Result<JoinHandle<CommandRun>> {
        let config = Arc::clone(&self.config);
        let controller = Arc::clone(&self.controller);
        let cwd = self.cwd.clone();

        thread::Builder::new()
            .name(format!("watch-{}-task", self.session))
            .spawn(move || {
                let started = Local::now();
                // The whole command goes to the interpreter as one segment.
                let segments = [command.clone()];
                let outcome = run_pipeline(
                    &segments,
                    cwd.as_deref(),
                    FirstInput::Null,
                    WaitMode::Polling(config.poll_interval),
                    &config,
                    &controller,
                )
                .unwrap_or_else(|e| Outcome::error(e.to_string()));
                CommandRun {
                    command,
                    started,
                    outcome,
                }
            })
    }

    /// Wait for the cycle's tasks, escalating SIGINT to SIGKILL if a stop
    /// arrives and children outlive the grace period.
    fn supervise(&self, tasks: &[(String, io::Result<JoinHandle<CommandRun>>)]) {
        let mut stop_seen: Option<Instant> = None;

        while !tasks
            .iter()
            .all(|(_, task)| task.as_ref().map_or(true, JoinHandle::is_finished))
        {
            if self.stopped() {
                match stop_seen {
                    None => {
                        self.controller.request_interrupt();
                        stop_seen = Some(Instant::now());
                    }
                    Some(since) if since.elapsed() >= self.config.watch_grace => {
                        let killed = self.controller.signal_all(libc::SIGKILL);
                        if killed > 0 {
                            warn!(session = self.session, killed, "force-killed watch children");
                        }
                    }
                    Some(_) => {}
                }
            }
            thread::sleep(TICK);
        }
    }

    /// Sleep for `total` in small steps. Returns false if stopped meanwhile.
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.stopped() {
                return false;
            }
            thread::sleep(TICK.min(deadline.saturating_duration_since(Instant::now())));
        }
        !self.stopped()
    }

    fn finish(self) {
        let leftover = self.controller.drain();
        if !leftover.is_empty() {
            warn!(session = self.session, ?leftover, "watch registry not empty at stop");
        }

        self.publish(WatchEvent::Stopped {
            scrollback: self.prior_scrollback.clone(),
        });
        self.done.store(true, Ordering::SeqCst);
        info!(session = self.session, "watch session stopped");
    }

    fn publish(&self, event: WatchEvent) {
        self.queue.push(WatchMessage {
            session: self.session,
            event,
        });
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

fn format_block(run: &CommandRun) -> Vec<String> {
    let mut lines = Vec::with_capacity(run.outcome.lines().len() + 3);
    lines.push(format!(
        "$ {}  [{}]",
        run.command,
        run.started.format("%Y-%m-%d %H:%M:%S")
    ));
    lines.push(DIVIDER.to_string());
    lines.extend(run.outcome.clone().into_lines());
    lines.push(DIVIDER.to_string());
    lines
}
