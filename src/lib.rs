//! Command execution engine for a tabbed terminal UI.
//!
//! A command line is split into `|`-separated segments, each segment runs
//! under `<shell> -c`, and the final stdout plus every stage's stderr are
//! captured without deadlock and classified into an [`Outcome`]. A watch
//! session re-runs a set of commands on a timer and publishes each cycle
//! through a [`WatchQueue`] that the UI drains.

#[cfg(not(unix))]
compile_error!("termgui's execution engine requires a Unix platform");

pub mod builtins;
pub mod cancel;
pub mod classify;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod spawner;
pub mod splitter;
pub mod status;
pub mod terminal;
pub mod watch;

pub use classify::{ERROR_MARKER, Outcome};
pub use config::EngineConfig;
pub use engine::Engine;
pub use session::Session;
pub use watch::{SessionId, WatchEvent, WatchHandle, WatchMessage, WatchQueue};
