use std::process::ExitStatus;

use crate::collector::Captured;
use crate::status;

/// Marker the legacy line rendering puts in front of every failure line.
pub const ERROR_MARKER: &str = "ERROR: ";

/// The formatted result of one invocation.
///
/// Lines never carry the error marker themselves; the caller decides how a
/// failure is rendered. Both variants always hold at least one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Vec<String>),
    Failure(Vec<String>),
}

impl Outcome {
    /// Success with no output: a single empty line, so the caller keeps a
    /// blank row without rendering anything spurious.
    pub fn blank() -> Self {
        Outcome::Success(vec![String::new()])
    }

    /// Failure consisting of one message line.
    pub fn error(message: impl Into<String>) -> Self {
        Outcome::Failure(vec![message.into()])
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn lines(&self) -> &[String] {
        match self {
            Outcome::Success(lines) | Outcome::Failure(lines) => lines,
        }
    }

    /// Flatten into display lines, prefixing failure lines with
    /// [`ERROR_MARKER`].
    pub fn into_lines(self) -> Vec<String> {
        match self {
            Outcome::Success(lines) => lines,
            Outcome::Failure(lines) => lines
                .into_iter()
                .map(|line| format!("{ERROR_MARKER}{line}"))
                .collect(),
        }
    }
}

/// Decide success or failure from the children's statuses and the captured
/// streams, and build the result lines.
///
/// A run fails if any child exited abnormally or non-zero, if a child could
/// not be waited on (`None`), or if anything reached the error stream.
/// Failure lines prefer the error stream, then stdout, then a synthetic line
/// with the last observed exit code.
pub fn classify(statuses: &[Option<ExitStatus>], captured: &Captured, strip_ansi: bool) -> Outcome {
    let wait_failed = statuses.iter().any(Option::is_none);
    let exited_badly = statuses
        .iter()
        .flatten()
        .any(|exit| !status::succeeded(*exit));
    let failed = wait_failed || exited_badly || !captured.stderr.is_empty();

    let out_lines = split_lines(&captured.stdout, strip_ansi);
    if !failed {
        if out_lines.is_empty() {
            return Outcome::blank();
        }
        return Outcome::Success(out_lines);
    }

    let err_lines = split_lines(&captured.stderr, strip_ansi);
    if !err_lines.is_empty() {
        return Outcome::Failure(err_lines);
    }
    if !out_lines.is_empty() {
        return Outcome::Failure(out_lines);
    }

    let code = statuses
        .iter()
        .rev()
        .flatten()
        .next()
        .map(|exit| status::exit_code(*exit))
        .unwrap_or(-1);
    Outcome::error(format!("(process exited with code {code})"))
}

/// Split raw bytes on `\n`. A trailing partial line is kept; a trailing
/// terminator does not produce an extra empty line. `\r` before the newline
/// is dropped.
pub fn split_lines(bytes: &[u8], strip_ansi: bool) -> Vec<String> {
    if bytes.is_empty() {
        return Vec::new();
    }

    let stripped;
    let bytes = if strip_ansi {
        stripped = strip_ansi_escapes::strip(bytes);
        stripped.as_slice()
    } else {
        bytes
    };

    if bytes.is_empty() {
        // Nothing but escape sequences.
        return Vec::new();
    }
    let body = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    body.split(|b| *b == b'\n')
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        })
        .collect()
}
