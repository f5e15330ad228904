use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("PTY allocation failed: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("Fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("Task is not in a state that allows {0}")]
    BadState(&'static str),

    #[error(transparent)]
    Attach(#[from] AttachError),
}

/// Failure classification for the server attach protocol.
///
/// `NotListening` never escapes `attach()`; it only drives the retry
/// loop internally. Everything else is terminal for the attempt.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("server is not listening yet")]
    NotListening,

    #[error("server process {0} exited before becoming ready")]
    ServerDied(i32),

    #[error("timed out after {0:?} waiting for server {1}")]
    Timeout(std::time::Duration, i32),

    #[error("server rejected the connection: {0}")]
    Rejected(String),

    #[error("IO error during attach: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;
