use std::time::Duration;

use tracing::warn;

use crate::pipeline::FirstInput;

const DEFAULT_SHELL: &str = "sh";
const DEFAULT_POLL: Duration = Duration::from_millis(100);
const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_WATCH_GRACE: Duration = Duration::from_millis(500);

/// Knobs for the execution engine.
///
/// Every field has a default; [`EngineConfig::from_env`] overrides them from
/// `TERMGUI_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interpreter each pipeline segment runs under, as `<shell> -c <segment>`.
    pub shell: String,
    /// Readiness-wait timeout for collectors that must notice cancellation
    /// on their own (watch tasks). Plain execution blocks without a timeout.
    pub poll_interval: Duration,
    /// Time between the end of one watch cycle and the start of the next.
    pub watch_interval: Duration,
    /// How long a stopping watch waits after SIGINT before sending SIGKILL.
    pub watch_grace: Duration,
    /// Remove terminal escape sequences from captured lines.
    pub strip_ansi: bool,
    /// Standard input of the first segment in plain execution. Front-ends
    /// that read commands from their own stdin set this to `Null`.
    pub first_input: FirstInput,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            poll_interval: DEFAULT_POLL,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            watch_grace: DEFAULT_WATCH_GRACE,
            strip_ansi: true,
            first_input: FirstInput::Inherit,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by whatever `TERMGUI_*` variables are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unparseable values are
    /// logged and replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(shell) = lookup("TERMGUI_SHELL") {
            let shell = shell.trim();
            if shell.is_empty() {
                warn!("TERMGUI_SHELL is empty, using {DEFAULT_SHELL}");
            } else {
                config.shell = shell.to_string();
            }
        }
        if let Some(ms) = millis(&lookup, "TERMGUI_POLL_MS") {
            config.poll_interval = ms;
        }
        if let Some(ms) = millis(&lookup, "TERMGUI_WATCH_INTERVAL_MS") {
            config.watch_interval = ms;
        }
        if let Some(ms) = millis(&lookup, "TERMGUI_WATCH_GRACE_MS") {
            config.watch_grace = ms;
        }
        if let Some(raw) = lookup("TERMGUI_STRIP_ANSI") {
            match parse_flag(&raw) {
                Some(flag) => config.strip_ansi = flag,
                None => warn!("TERMGUI_STRIP_ANSI={raw:?} is not a boolean, keeping default"),
            }
        }

        config
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            warn!("{key}=0 is not allowed, keeping default");
            None
        }
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!("{key}={raw:?} is not a number of milliseconds, keeping default");
            None
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
