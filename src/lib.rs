//! Pty-backed process task management.
//!
//! A [`PtyTask`] wraps one child process behind a pty. Tasks are either
//! forked directly or routed through a detached server process so the
//! session survives a restart of the owning program; either way all
//! pty I/O is serviced by one shared poll loop, the [`IoMultiplexer`].

pub mod error;
pub mod mux;
pub mod procinfo;
pub mod pty;
pub mod server;

pub use error::{AttachError, PtyError, Result};
pub use mux::IoMultiplexer;
pub use pty::{LaunchSpec, PtyTask, TaskDelegate, TaskId};
