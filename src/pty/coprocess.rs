//! Auxiliary processes bridged through a task's pty stream.
//!
//! A coprocess receives a mirror of everything the task's pty produces
//! (unless muted) on its stdin, and anything it prints on stdout is fed
//! back into the task's own write path. Its descriptors ride along in
//! the same readiness loop as the owning task.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{PtyError, Result};

/// Broadcast payload for coprocess lifecycle changes. Carries no data;
/// observers re-query whichever tasks they care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoprocessChanged;

static COPROCESS_EVENTS: OnceLock<broadcast::Sender<CoprocessChanged>> = OnceLock::new();

fn events() -> &'static broadcast::Sender<CoprocessChanged> {
    COPROCESS_EVENTS.get_or_init(|| broadcast::channel(16).0)
}

/// Subscribe to process-wide coprocess change notifications.
pub fn subscribe_coprocess_changes() -> broadcast::Receiver<CoprocessChanged> {
    events().subscribe()
}

pub(crate) fn notify_coprocess_changed() {
    // No receivers is fine; the notification is best-effort.
    let _ = events().send(CoprocessChanged);
}

/// A spawned coprocess bound to one task. Owned by that task's control
/// state; the multiplexer reads the binding under the task's lock.
#[derive(Debug)]
pub struct Coprocess {
    child: Child,
    pid: Pid,
    stdin_fd: OwnedFd,
    stdout_fd: OwnedFd,
    /// Bytes read from the task's pty, waiting to be written to the
    /// coprocess's stdin.
    buffer: Vec<u8>,
    mute: bool,
}

impl Coprocess {
    /// Spawn `command` through the shell with piped stdio and both pipe
    /// ends set non-blocking for the readiness loop.
    pub fn spawn(command: &str, mute: bool) -> Result<Self> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or(PtyError::BadState("coprocess stdin missing"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(PtyError::BadState("coprocess stdout missing"))?;
        let stdin_fd = OwnedFd::from(stdin);
        let stdout_fd = OwnedFd::from(stdout);
        set_nonblocking(&stdin_fd)?;
        set_nonblocking(&stdout_fd)?;

        let pid = Pid::from_raw(child.id() as i32);
        debug!("spawned coprocess {} for command {:?}", pid, command);

        Ok(Self {
            child,
            pid,
            stdin_fd,
            stdout_fd,
            buffer: Vec::new(),
            mute,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_mute(&self) -> bool {
        self.mute
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    /// Mirror task output into the stdin buffer, unless muted.
    pub fn mirror_output(&mut self, data: &[u8]) {
        if !self.mute {
            self.buffer.extend_from_slice(data);
        }
    }

    pub fn has_pending_input(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn pending_front(&self, limit: usize) -> &[u8] {
        let n = self.buffer.len().min(limit);
        &self.buffer[..n]
    }

    pub fn consume_pending(&mut self, written: usize) {
        let n = written.min(self.buffer.len());
        self.buffer.drain(..n);
    }

    /// Write end toward the coprocess's stdin.
    pub fn input_fd(&self) -> RawFd {
        self.stdin_fd.as_raw_fd()
    }

    /// Read end carrying the coprocess's stdout.
    pub fn output_fd(&self) -> RawFd {
        self.stdout_fd.as_raw_fd()
    }

    /// Terminate the coprocess and wait for it to be reaped. Called
    /// from owner threads only, with the binding already detached from
    /// the task; the readiness loop uses [`discard`](Self::discard)
    /// instead.
    pub fn stop(mut self) {
        let _ = kill(self.pid, Signal::SIGTERM);
        match self.child.wait() {
            Ok(status) => debug!("coprocess {} exited: {}", self.pid, status),
            Err(e) => warn!("failed to reap coprocess {}: {}", self.pid, e),
        }
        notify_coprocess_changed();
    }

    /// Teardown for the readiness loop, which must only ever block on
    /// readiness: SIGTERM, one non-blocking reap attempt, then SIGKILL
    /// with the wait handed to a detached reaper thread. The changed
    /// notification fires once the process is actually gone.
    pub fn discard(mut self) {
        let _ = kill(self.pid, Signal::SIGTERM);
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("coprocess {} exited: {}", self.pid, status);
                notify_coprocess_changed();
                return;
            }
            Ok(None) => {
                let _ = kill(self.pid, Signal::SIGKILL);
            }
            Err(e) => warn!("failed to reap coprocess {}: {}", self.pid, e),
        }
        let pid = self.pid;
        std::thread::Builder::new()
            .name("ptymux-reaper".to_string())
            .spawn(move || {
                match self.child.wait() {
                    Ok(status) => debug!("coprocess {} exited: {}", pid, status),
                    Err(e) => warn!("failed to reap coprocess {}: {}", pid, e),
                }
                notify_coprocess_changed();
            })
            .expect("failed to spawn reaper thread");
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}
