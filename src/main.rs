use std::borrow::Cow;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crossterm::style::Stylize;
use crossterm::tty::IsTty;
use termgui::pipeline::FirstInput;
use termgui::session::Applied;
use termgui::{ERROR_MARKER, Engine, EngineConfig, Session, WatchQueue};
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// How often the loop wakes to drain the watch queue while idle.
const TICK: Duration = Duration::from_millis(50);

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("termgui: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> io::Result<()> {
    let mut config = EngineConfig::from_env();
    // Commands arrive on our stdin; children must not read from it.
    config.first_input = FirstInput::Null;
    let engine = Engine::new(config);

    let ctrl_c = Arc::new(AtomicBool::new(false));
    {
        let engine = engine.clone();
        let ctrl_c = Arc::clone(&ctrl_c);
        ctrlc::set_handler(move || {
            ctrl_c.store(true, Ordering::SeqCst);
            engine.request_interrupt();
        })
        .map_err(io::Error::other)?;
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| termgui::builtins::home_dir());
    let mut session = Session::new(1, cwd);
    let queue = WatchQueue::new();
    let lines = spawn_reader();
    let mut out = Output::new();

    out.prompt(&session.prompt())?;
    loop {
        for message in queue.drain() {
            match session.apply(message) {
                Applied::Appended(lines) => out.lines(&lines)?,
                Applied::Restored => out.prompt(&session.prompt())?,
                Applied::Ignored => {}
            }
        }

        if ctrl_c.swap(false, Ordering::SeqCst) && session.is_watching() {
            session.interrupt(&engine);
        }

        match lines.recv_timeout(TICK) {
            Ok(Ok(line)) => {
                let trimmed = line.trim();
                if trimmed == "exit" {
                    break;
                }
                if session.is_watching() {
                    // Any blank line or `stop` ends the watch, like Ctrl-C.
                    if trimmed.is_empty() || trimmed == "stop" {
                        session.stop_watch();
                    }
                    continue;
                }
                if trimmed == "clear" {
                    session.submit(&line, &engine, &queue);
                    out.clear()?;
                    out.prompt(&session.prompt())?;
                    continue;
                }

                let rendered = session.submit(&line, &engine, &queue);
                ctrl_c.store(false, Ordering::SeqCst);
                out.lines(&rendered)?;
                if !session.is_watching() {
                    out.prompt(&session.prompt())?;
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // EOF: let a running watch wind down and publish its last cycle.
                if session.is_watching() {
                    session.stop_watch();
                    while session.is_watching() {
                        for message in queue.drain() {
                            if let Applied::Appended(lines) = session.apply(message) {
                                out.lines(&lines)?;
                            }
                        }
                        thread::sleep(TICK);
                    }
                }
                out.newline()?;
                break;
            }
        }
    }

    session.close();
    Ok(())
}

/// Read stdin on its own thread so the loop keeps draining the watch queue
/// while waiting for input. Lines that are not valid UTF-8 are decoded
/// lossily rather than ending the session.
fn spawn_reader() -> mpsc::Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for raw in io::stdin().lock().split(b'\n') {
            let line = raw.map(|bytes| {
                let line = String::from_utf8_lossy(&bytes);
                if matches!(line, Cow::Owned(_)) {
                    warn!("input line is not valid UTF-8; decoded lossily");
                }
                line.trim_end_matches('\r').to_string()
            });
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Stdout renderer: error lines in red when attached to a terminal.
struct Output {
    stdout: io::Stdout,
    styled: bool,
}

impl Output {
    fn new() -> Self {
        let stdout = io::stdout();
        let styled = stdout.is_tty();
        Self { stdout, styled }
    }

    fn lines(&mut self, lines: &[String]) -> io::Result<()> {
        let mut handle = self.stdout.lock();
        for line in lines {
            if self.styled && line.starts_with(ERROR_MARKER) {
                writeln!(handle, "{}", line.as_str().red())?;
            } else {
                writeln!(handle, "{line}")?;
            }
        }
        handle.flush()
    }

    fn prompt(&mut self, prompt: &str) -> io::Result<()> {
        let mut handle = self.stdout.lock();
        if self.styled {
            write!(handle, "{}", prompt.green())?;
        } else {
            write!(handle, "{prompt}")?;
        }
        handle.flush()
    }

    fn newline(&mut self) -> io::Result<()> {
        writeln!(self.stdout)?;
        self.stdout.flush()
    }

    fn clear(&mut self) -> io::Result<()> {
        if self.styled {
            crossterm::execute!(
                self.stdout,
                crossterm::terminal::Clear(crossterm::terminal::ClearType::All),
                crossterm::cursor::MoveTo(0, 0)
            )?;
        }
        Ok(())
    }
}
