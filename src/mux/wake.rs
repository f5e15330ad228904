//! Signal-handler-safe wake primitive for the readiness loop.
//!
//! A self-pipe: the read end sits in every poll set, and any thread (or
//! the SIGCHLD handler) can interrupt a blocked `poll()` by writing one
//! byte to the write end. The write is the only operation performed,
//! which keeps the primitive async-signal-safe: no locks, no heap.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe2;
use tracing::warn;

// Write end of the global multiplexer's wake pipe, published once the
// singleton loop starts so the SIGCHLD handler can reach it.
static SIGCHLD_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_sigchld(_: libc::c_int) {
    let fd = SIGCHLD_WAKE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        // SAFETY: write(2) is async-signal-safe; fd stays valid for the
        // process lifetime once published. A full pipe (EAGAIN) is fine,
        // the loop is already due to wake.
        unsafe {
            libc::write(fd, b"c".as_ptr() as *const libc::c_void, 1);
        }
    }
}

pub struct WakePipe {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl WakePipe {
    pub fn new() -> nix::Result<Self> {
        let (reader, writer) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self { reader, writer })
    }

    /// Fd to include with read interest in every poll set.
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    /// Interrupt a blocked poll. Callable from any thread; uses only a
    /// raw write so it is also safe from signal-handler context.
    pub fn wake(&self) {
        let fd = self.writer.as_raw_fd();
        unsafe {
            libc::write(fd, b"w".as_ptr() as *const libc::c_void, 1);
        }
    }

    /// Discard queued wake bytes after poll reports the pipe readable.
    pub fn drain(&self) {
        let fd = self.reader.as_raw_fd();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Raw write-end fd, for publishing to the SIGCHLD handler.
    pub fn writer_raw_fd(&self) -> RawFd {
        self.writer.as_raw_fd()
    }
}

/// Route SIGCHLD through the given wake pipe so child-termination
/// notifications interrupt the readiness wait. Installed once, by the
/// global multiplexer.
pub fn install_sigchld_wake(pipe: &WakePipe) {
    SIGCHLD_WAKE_FD.store(pipe.writer_raw_fd(), Ordering::Release);
    let action = SigAction::new(
        SigHandler::Handler(handle_sigchld),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    // SAFETY: the handler performs a single async-signal-safe write.
    if let Err(e) = unsafe { sigaction(Signal::SIGCHLD, &action) } {
        warn!("failed to install SIGCHLD handler: {}", e);
    }
}
