use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::builtins::home_dir;
use crate::classify::Outcome;
use crate::engine::Engine;
use crate::splitter;
use crate::watch::{SessionId, WatchEvent, WatchHandle, WatchMessage, WatchQueue};

/// Line appended after a command whose children were interrupted.
pub const INTERRUPT_MARKER: &str = "^C";

/// Render the prompt for `cwd`, abbreviating the home directory as `~`.
pub fn prompt(cwd: &Path) -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
    format!("{user}@Term:{}$ ", display_dir(cwd, &home_dir()))
}

fn display_dir(cwd: &Path, home: &Path) -> String {
    if home != Path::new("/") {
        if let Ok(rest) = cwd.strip_prefix(home) {
            if rest.as_os_str().is_empty() {
                return "~".to_string();
            }
            return format!("~/{}", rest.display());
        }
    }
    cwd.display().to_string()
}

/// What applying a watch message did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The message was for another session.
    Ignored,
    /// These lines were appended to the scrollback.
    Appended(Vec<String>),
    /// The watch ended and the scrollback was restored to its pre-watch
    /// content followed by a fresh prompt.
    Restored,
}

/// One tab: its working directory, scrollback, input line and (at most one)
/// running watch session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    cwd: PathBuf,
    scrollback: Vec<String>,
    input: String,
    watch: Option<WatchHandle>,
}

impl Session {
    pub fn new(id: SessionId, cwd: PathBuf) -> Self {
        let first_prompt = prompt(&cwd);
        Self {
            id,
            cwd,
            scrollback: vec![first_prompt],
            input: String::new(),
            watch: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn scrollback(&self) -> &[String] {
        &self.scrollback
    }

    /// Text typed but not yet submitted.
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: &str) {
        self.input = text.to_string();
    }

    pub fn prompt(&self) -> String {
        prompt(&self.cwd)
    }

    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    /// Submit a command line. Returns the lines it added to the scrollback
    /// (not counting the prompt rows).
    pub fn submit(&mut self, line: &str, engine: &Engine, queue: &WatchQueue) -> Vec<String> {
        self.input.clear();
        if let Some(row) = self.scrollback.last_mut() {
            row.push_str(line);
        }

        let trimmed = line.trim();
        if trimmed == "clear" {
            self.scrollback = vec![self.prompt()];
            return Vec::new();
        }

        let output = match splitter::parse_watch(trimmed) {
            Some(commands) => match self.start_watch(commands, engine, queue) {
                // The watch publishes its own output; the prompt returns when it stops.
                Ok(()) => return Vec::new(),
                Err(message) => Outcome::error(message).into_lines(),
            },
            None => {
                let mut lines = engine.execute_in(line, &mut self.cwd).into_lines();
                if engine.take_interrupted() {
                    lines.push(INTERRUPT_MARKER.to_string());
                }
                lines
            }
        };

        self.scrollback.extend(output.iter().cloned());
        self.scrollback.push(self.prompt());
        output
    }

    fn start_watch(
        &mut self,
        commands: Vec<String>,
        engine: &Engine,
        queue: &WatchQueue,
    ) -> Result<(), String> {
        if commands.is_empty() {
            return Err(format!(
                "usage: {} [\"cmd\", ...]",
                splitter::WATCH_KEYWORD
            ));
        }
        if self.watch.is_some() {
            return Err("a watch is already running in this tab".to_string());
        }

        let prior = self.scrollback.clone();
        let handle = engine
            .start_watch(commands, self.id, prior, Some(self.cwd.clone()), queue.clone())
            .map_err(|e: io::Error| format!("{}: {e}", splitter::WATCH_KEYWORD))?;
        info!(session = self.id, "watch started");
        self.watch = Some(handle);
        Ok(())
    }

    /// Ctrl-C: stop a running watch, otherwise interrupt the engine.
    pub fn interrupt(&mut self, engine: &Engine) {
        match &self.watch {
            Some(watch) => watch.stop(),
            None => engine.request_interrupt(),
        }
    }

    pub fn stop_watch(&self) {
        if let Some(watch) = &self.watch {
            watch.stop();
        }
    }

    /// Fold one drained queue message into the scrollback.
    pub fn apply(&mut self, message: WatchMessage) -> Applied {
        if message.session != self.id {
            return Applied::Ignored;
        }

        match message.event {
            WatchEvent::Banner(text) => {
                self.scrollback.push(text.clone());
                Applied::Appended(vec![text])
            }
            WatchEvent::Cycle(lines) => {
                self.scrollback.extend(lines.iter().cloned());
                Applied::Appended(lines)
            }
            WatchEvent::Stopped { scrollback } => {
                self.scrollback = scrollback;
                self.scrollback.push(self.prompt());
                self.input.clear();
                if let Some(watch) = self.watch.take() {
                    // The scheduler is past its last publish; this only waits
                    // for the thread to return.
                    watch.join();
                }
                Applied::Restored
            }
        }
    }

    /// Tear the tab down, stopping and reaping any watch it owns.
    pub fn close(mut self) {
        if let Some(watch) = self.watch.take() {
            watch.join();
        }
    }
}
