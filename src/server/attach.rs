//! Client side of the attach protocol.
//!
//! Connecting to a freshly forked server is a race: the socket may not
//! exist yet, or may exist but not be accepting. `attach` retries with
//! a doubling backoff while the server process stays alive, and gives
//! a precise failure classification when it does not work out.

use std::io;
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::error::AttachError;
use crate::pty::spawn::prepare_master;
use crate::server::{socket_path, AttachHeader};

pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What a successful handshake yields: the pty master (already
/// non-blocking and close-on-exec) and the identity of the wrapped
/// child.
#[derive(Debug)]
pub struct AttachResult {
    pub master: OwnedFd,
    pub child_pid: Pid,
    pub tty_name: String,
}

/// Connect to the server listening for `server_pid`, retrying until
/// `timeout` elapses. Gives up early with `ServerDied` when the server
/// process disappears between attempts.
pub fn attach(server_pid: Pid, timeout: Duration) -> Result<AttachResult, AttachError> {
    let path = socket_path(server_pid);
    let deadline = Instant::now() + timeout;
    let mut delay = INITIAL_RETRY_DELAY;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match try_connect(&path) {
            Ok(stream) => {
                debug!(
                    "connected to server {} after {} attempt(s)",
                    server_pid, attempts
                );
                return complete_handshake(stream);
            }
            Err(AttachError::NotListening) => {}
            Err(e) => return Err(e),
        }

        if !server_alive(server_pid) {
            return Err(AttachError::ServerDied(server_pid.as_raw()));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(AttachError::Timeout(timeout, server_pid.as_raw()));
        }

        std::thread::sleep(delay.min(deadline - now));
        delay = next_delay(delay);
    }
}

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(MAX_RETRY_DELAY)
}

fn try_connect(path: &Path) -> Result<UnixStream, AttachError> {
    match UnixStream::connect(path) {
        Ok(stream) => Ok(stream),
        Err(e)
            if e.kind() == io::ErrorKind::NotFound
                || e.kind() == io::ErrorKind::ConnectionRefused =>
        {
            Err(AttachError::NotListening)
        }
        Err(e) => Err(AttachError::Io(e)),
    }
}

/// Existence check that works for non-child processes too. EPERM means
/// the pid exists but belongs to someone else, which still counts.
fn server_alive(pid: Pid) -> bool {
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}

/// Read the newline-terminated JSON header and the SCM_RIGHTS master
/// fd off the stream, then put the master into multiplexer shape.
fn complete_handshake(stream: UnixStream) -> Result<AttachResult, AttachError> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    let mut line = Vec::with_capacity(256);
    let mut master: Option<OwnedFd> = None;

    while !line.contains(&b'\n') {
        let mut buf = [0u8; 256];
        // The recvmsg result borrows the iovec, so pull the byte count
        // and fds into locals before touching buf again.
        let (bytes, received_fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )
            .map_err(io::Error::from)?;

            let mut received_fds = Vec::new();
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    received_fds.extend_from_slice(&fds);
                }
            }
            (msg.bytes, received_fds)
        };

        for fd in received_fds {
            // recvmsg hands us raw numbers; take ownership of the
            // first, close any extras.
            if master.is_none() {
                master = Some(unsafe { OwnedFd::from_raw_fd(fd) });
            } else {
                unsafe {
                    libc::close(fd);
                }
            }
        }

        if bytes == 0 {
            return Err(AttachError::Rejected(
                "server closed the stream mid-handshake".to_string(),
            ));
        }
        line.extend_from_slice(&buf[..bytes]);
    }

    let newline = line.iter().position(|&b| b == b'\n').unwrap_or(line.len());
    let header: AttachHeader = serde_json::from_slice(&line[..newline])
        .map_err(|e| AttachError::Rejected(format!("bad header: {}", e)))?;

    let Some(master) = master else {
        return Err(AttachError::Rejected(
            "server sent no descriptor".to_string(),
        ));
    };
    prepare_master(&master).map_err(|e| AttachError::Io(io::Error::other(e.to_string())))?;

    info!(
        "attached to child {} on {}",
        header.child_pid, header.tty
    );
    Ok(AttachResult {
        master,
        child_pid: Pid::from_raw(header.child_pid),
        tty_name: header.tty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::send_with_fd;
    use nix::unistd::getpid;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_attach_survives_slow_server_startup() {
        // Our own pid stands in for the server: alive, and we control
        // its socket path.
        let pid = getpid();
        let path = socket_path(pid);
        let _ = std::fs::remove_file(&path);

        let server = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            let listener = UnixListener::bind(socket_path(getpid())).unwrap();
            let (stream, _) = listener.accept().unwrap();
            let (read_end, _write_end) = nix::unistd::pipe().unwrap();
            send_with_fd(
                &stream,
                b"{\"child_pid\":1234,\"tty\":\"/dev/pts/9\"}\n",
                read_end.as_raw_fd(),
            )
            .unwrap();
        });

        let started = Instant::now();
        let result = attach(pid, Duration::from_secs(5)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(result.child_pid, Pid::from_raw(1234));
        assert_eq!(result.tty_name, "/dev/pts/9");
        assert!(result.master.as_raw_fd() >= 0);

        server.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_attach_fails_fast_when_server_is_dead() {
        // A reaped child's pid reads as gone to kill(pid, 0).
        let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        let started = Instant::now();
        let err = attach(Pid::from_raw(pid), Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, AttachError::ServerDied(p) if p == pid));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_doubles_up_to_the_cap() {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut schedule = vec![delay];
        for _ in 0..5 {
            delay = next_delay(delay);
            schedule.push(delay);
        }
        let millis: Vec<u64> = schedule.iter().map(|d| d.as_millis() as u64).collect();
        assert_eq!(millis, vec![10, 20, 40, 80, 100, 100]);
    }

    #[test]
    fn test_attach_times_out_against_a_mute_server() {
        // Pid 1 is always alive and never listens on our socket.
        let err = attach(Pid::from_raw(1), Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, AttachError::Timeout(_, 1)));
    }
}
