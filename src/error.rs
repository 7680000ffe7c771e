use std::io;

use thiserror::Error;

/// Failures that stop an invocation before a classified outcome exists.
///
/// None of these escape the public facade: `Engine` renders each one as a
/// single error-tagged line. Non-zero exits and interrupts are not errors
/// here, they are classified by [`crate::classify`].
#[derive(Debug, Error)]
pub enum ExecError {
    /// `cd` target missing or not a directory. Nothing was spawned.
    #[error("cd: no such file or directory: {path}")]
    Builtin { path: String },

    /// A relay or capture channel could not be allocated.
    #[error("{channel} pipe creation failed: {source}")]
    Resource {
        channel: &'static str,
        #[source]
        source: io::Error,
    },

    /// A segment's interpreter could not be started. Earlier siblings
    /// have already been reaped when this is returned.
    #[error("spawn failed: {segment}: {source}")]
    Spawn {
        segment: String,
        #[source]
        source: io::Error,
    },

    /// The readiness wait on the capture channels failed.
    #[error("output collection failed: {0}")]
    Collect(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;
