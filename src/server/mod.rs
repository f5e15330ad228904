//! Detached pty server.
//!
//! `fork_server` re-execs this binary with the `serve` directive; the
//! code here is the far side of that exec. The server holds the pty
//! pair for one child process, listens on a per-pid unix socket, and
//! hands the master fd to any client that connects, so the session can
//! outlive the process that launched it.

pub mod attach;

use std::io;
use std::io::IoSlice;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ttyname, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PtyError, Result};
use crate::pty::spawn::{build_argv, build_envp, exec_on_slave, exec_ptrs};

/// How long the server sleeps in poll() between liveness checks on its
/// child when no client is knocking.
const SERVER_POLL_INTERVAL_MS: u16 = 500;

/// First line of the attach handshake, terminated by `\n`. The master
/// fd rides along as SCM_RIGHTS ancillary data on the same message.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AttachHeader {
    pub child_pid: i32,
    pub tty: String,
}

// Set by the SIGTERM handler; the serve loop checks it every pass so
// the socket-file cleanup below still runs on a signalled shutdown.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigterm(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Acquire)
}

/// No SA_RESTART: a signal mid-poll must surface as EINTR so the loop
/// notices the flag promptly.
fn install_sigterm_handler() {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigterm),
        SaFlags::empty(),
        SigSet::empty(),
    );
    if let Err(e) = unsafe { sigaction(Signal::SIGTERM, &action) } {
        warn!("failed to install SIGTERM handler: {}", e);
    }
}

pub fn socket_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Rendezvous point for a server, keyed by its pid.
pub fn socket_path(server_pid: Pid) -> PathBuf {
    socket_dir().join(format!("ptymux-server-{}.sock", server_pid))
}

pub(crate) fn send_with_fd(stream: &UnixStream, payload: &[u8], fd: RawFd) -> io::Result<()> {
    let iov = [IoSlice::new(payload)];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(io::Error::from)?;
    Ok(())
}

/// Entry point for the `serve` directive. `master_fd` and `slave_fd`
/// are pty fd numbers inherited across our exec; this function owns
/// them from here on. Runs until the wrapped child exits and returns
/// its exit code.
pub fn run_server(master_fd: RawFd, slave_fd: RawFd, program: &str, args: &[String]) -> Result<i32> {
    let master = unsafe { OwnedFd::from_raw_fd(master_fd) };
    let slave = unsafe { OwnedFd::from_raw_fd(slave_fd) };

    let tty = ttyname(&slave)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let exec_path = std::ffi::CString::new(program)
        .map_err(|_| PtyError::BadState("NUL byte in launch argument"))?;
    let argv = build_argv(program, args)?;
    let envp = build_envp(&[])?;
    let diag = std::ffi::CString::new(format!("ptymux: exec of {} failed\n", program))
        .map_err(|_| PtyError::BadState("NUL byte in launch argument"))?;
    let argv_ptrs = exec_ptrs(&argv);
    let envp_ptrs = exec_ptrs(&envp);

    // Before the fork so no stop() can slip into the default-action
    // window; the child resets its dispositions on exec.
    install_sigterm_handler();

    let child = match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Child => unsafe {
            exec_on_slave(
                slave.as_raw_fd(),
                &exec_path,
                &argv_ptrs,
                &envp_ptrs,
                None,
                &diag,
            )
        },
        ForkResult::Parent { child } => child,
    };
    drop(slave);

    let path = socket_path(getpid());
    // A stale socket from a recycled pid would shadow us.
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    listener.set_nonblocking(true)?;
    info!("serving child {} ({}) on {}", child, program, path.display());

    let header = AttachHeader {
        child_pid: child.as_raw(),
        tty,
    };
    let mut payload = serde_json::to_vec(&header).map_err(io::Error::from)?;
    payload.push(b'\n');

    let exit_code = loop {
        if shutdown_requested() {
            info!("shutdown requested, hanging up child {}", child);
            let _ = kill(child, Signal::SIGHUP);
            let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));
            break 128 + Signal::SIGTERM as i32;
        }

        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, sig, _)) => break 128 + sig as i32,
            Ok(_) => {}
            Err(Errno::ECHILD) => break 0,
            Err(e) => {
                warn!("waitpid({}) failed: {}", child, e);
                break 1;
            }
        }

        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(SERVER_POLL_INTERVAL_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = send_with_fd(&stream, &payload, master.as_raw_fd()) {
                        warn!("attach handshake failed: {}", e);
                    } else {
                        info!("handed master fd to a client");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    };

    let _ = std::fs::remove_file(&path);
    info!("child {} exited with {}", child, exit_code);
    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_embeds_pid() {
        let path = socket_path(Pid::from_raw(4242));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("4242"));
    }

    #[test]
    fn test_sigterm_sets_the_shutdown_flag() {
        install_sigterm_handler();
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        assert!(shutdown_requested());
    }

    #[test]
    fn test_attach_header_round_trips_as_json_line() {
        let header = AttachHeader {
            child_pid: 7,
            tty: "/dev/pts/3".to_string(),
        };
        let mut line = serde_json::to_vec(&header).unwrap();
        line.push(b'\n');
        let parsed: AttachHeader = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed.child_pid, 7);
        assert_eq!(parsed.tty, "/dev/pts/3");
    }
}
