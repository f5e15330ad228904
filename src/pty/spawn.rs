//! Fork/exec plumbing under pty tasks.
//!
//! Everything the child branch touches after fork() is prepared up
//! front as `CString`s; the branch itself sticks to raw syscalls so it
//! stays async-signal-safe in a threaded parent.

use std::ffi::{CString, OsString};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{tcgetattr, tcsetattr, InputFlags, SetArg};
use nix::unistd::{fork, ttyname, ForkResult, Pid};
use tracing::{debug, info};

use crate::error::{PtyError, Result};

/// What to run and how the pty should look.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Overrides applied on top of the caller's environment; together
    /// they replace the child's environment wholesale.
    pub env: Vec<(String, String)>,
    pub width: u16,
    pub height: u16,
    pub utf8: bool,
    pub working_dir: Option<PathBuf>,
    /// Route the launch through a detached server so the session can
    /// outlive this process.
    pub use_server: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            width: 80,
            height: 24,
            utf8: true,
            working_dir: None,
            use_server: false,
        }
    }
}

/// Result of a direct (non-server) fork: the parent's side of the pty
/// and the child it now owns.
pub struct ForkedTask {
    pub master: OwnedFd,
    pub child: Pid,
    pub tty_name: String,
}

fn winsize(width: u16, height: u16) -> Winsize {
    Winsize {
        ws_row: height,
        ws_col: width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| PtyError::BadState("NUL byte in launch argument"))
}

fn cstring_os(s: &OsString) -> Result<CString> {
    CString::new(s.as_encoded_bytes())
        .map_err(|_| PtyError::BadState("NUL byte in launch argument"))
}

/// Caller environment overlaid with explicit overrides, flattened to
/// the `K=V` form execve wants.
pub(crate) fn build_envp(overrides: &[(String, String)]) -> Result<Vec<CString>> {
    let mut merged: Vec<(String, String)> = std::env::vars()
        .filter(|(k, _)| !overrides.iter().any(|(ok, _)| ok == k))
        .collect();
    merged.extend(overrides.iter().cloned());

    merged
        .iter()
        .map(|(k, v)| cstring(&format!("{}={}", k, v)))
        .collect()
}

pub(crate) fn build_argv(program: &str, args: &[String]) -> Result<Vec<CString>> {
    let mut argv = vec![cstring(program)?];
    for arg in args {
        argv.push(cstring(arg)?);
    }
    Ok(argv)
}

/// Null-terminated pointer array for execve. Built before fork so the
/// child branch stays allocation-free; the pointers stay valid as long
/// as `args` does.
pub(crate) fn exec_ptrs(args: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = args.iter().map(|c| c.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

/// Fork and exec `spec.program` directly on a fresh pty. The caller
/// becomes the owner of the child; no server is involved.
pub fn fork_direct(spec: &LaunchSpec) -> Result<ForkedTask> {
    let pty = openpty(&winsize(spec.width, spec.height), None).map_err(PtyError::OpenPty)?;
    apply_utf8_mode(&pty.slave, spec.utf8);

    let tty_name = ttyname(pty.slave.as_fd())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    // Everything the child needs, built before fork.
    let exec_path = cstring(&spec.program)?;
    let argv = build_argv(&spec.program, &spec.args)?;
    let envp = build_envp(&spec.env)?;
    let cwd = match &spec.working_dir {
        Some(dir) => Some(cstring_os(&dir.clone().into_os_string())?),
        None => None,
    };
    let diag = cstring(&format!("ptymux: exec of {} failed\n", spec.program))?;
    let argv_ptrs = exec_ptrs(&argv);
    let envp_ptrs = exec_ptrs(&envp);

    match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Child => {
            // Never returns.
            unsafe {
                exec_on_slave(
                    pty.slave.as_raw_fd(),
                    &exec_path,
                    &argv_ptrs,
                    &envp_ptrs,
                    cwd.as_deref(),
                    &diag,
                )
            }
        }
        ForkResult::Parent { child } => {
            drop(pty.slave);
            prepare_master(&pty.master)?;
            info!("forked {} as pid {} on {}", spec.program, child, tty_name);
            Ok(ForkedTask {
                master: pty.master,
                child,
                tty_name,
            })
        }
    }
}

/// Fork the current executable as a detached server wrapping
/// `spec.program`. The pty pair is created here and handed to the
/// server across its exec via inherited fd numbers; the caller owns
/// neither side afterwards and must rendezvous through the attach
/// protocol to get the master back.
pub fn fork_server(spec: &LaunchSpec) -> Result<Pid> {
    let pty = openpty(&winsize(spec.width, spec.height), None).map_err(PtyError::OpenPty)?;
    apply_utf8_mode(&pty.slave, spec.utf8);

    let master_fd = pty.master.as_raw_fd();
    let slave_fd = pty.slave.as_raw_fd();

    let exe = std::env::current_exe()?;
    let exe_str = exe.to_string_lossy().into_owned();
    let mut server_args = vec![
        "serve".to_string(),
        "--master-fd".to_string(),
        master_fd.to_string(),
        "--slave-fd".to_string(),
        slave_fd.to_string(),
        "--".to_string(),
        spec.program.clone(),
    ];
    server_args.extend(spec.args.iter().cloned());

    let exec_path = cstring(&exe_str)?;
    let argv = build_argv(&exe_str, &server_args)?;
    let envp = build_envp(&spec.env)?;
    let cwd = match &spec.working_dir {
        Some(dir) => Some(cstring_os(&dir.clone().into_os_string())?),
        None => None,
    };
    let diag = cstring("ptymux: exec of server failed\n")?;
    let argv_ptrs = exec_ptrs(&argv);
    let envp_ptrs = exec_ptrs(&envp);

    match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Child => unsafe {
            exec_detached_server(
                master_fd,
                slave_fd,
                &exec_path,
                &argv_ptrs,
                &envp_ptrs,
                cwd.as_deref(),
                &diag,
            )
        },
        ForkResult::Parent { child } => {
            // The server owns both pty ends now; the master comes back
            // through the attach handshake.
            drop(pty.slave);
            drop(pty.master);
            debug!("forked server pid {} for {}", child, spec.program);
            Ok(child)
        }
    }
}

fn apply_utf8_mode(slave: &OwnedFd, utf8: bool) {
    // Best effort; a pty without IUTF8 still works.
    if let Ok(mut termios) = tcgetattr(slave.as_fd()) {
        termios.input_flags.set(InputFlags::IUTF8, utf8);
        let _ = tcsetattr(slave.as_fd(), SetArg::TCSANOW, &termios);
    }
}

/// Non-blocking and close-on-exec, the mode every master fd is in
/// while registered with the multiplexer.
pub(crate) fn prepare_master(master: &OwnedFd) -> Result<()> {
    let flags = fcntl(master.as_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(master.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    fcntl(master.as_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Child branch for a task (or the server's grandchild): become a
/// session leader on the pty slave and exec the target program.
///
/// # Safety
/// Must be called in a freshly forked child. Performs only raw
/// syscalls; all arguments, including the null-terminated pointer
/// arrays, were allocated before the fork.
pub(crate) unsafe fn exec_on_slave(
    slave_fd: RawFd,
    path: &CString,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    cwd: Option<&std::ffi::CStr>,
    diag: &CString,
) -> ! {
    restore_default_signals();

    libc::setsid();
    libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0);
    libc::dup2(slave_fd, 0);
    libc::dup2(slave_fd, 1);
    libc::dup2(slave_fd, 2);
    // The child keeps only stdio. A leaked master ref here would block
    // SIGHUP delivery on pty teardown.
    close_fds_above_stdio(&[]);

    if let Some(dir) = cwd {
        libc::chdir(dir.as_ptr());
    }

    libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());

    // No channel back to the parent beyond process death. Leave a
    // diagnostic on the pty and pause briefly to avoid a respawn storm.
    libc::write(2, diag.as_ptr() as *const libc::c_void, diag.as_bytes().len());
    libc::sleep(1);
    libc::_exit(1)
}

/// Child branch for the detached server: detach from the controlling
/// terminal, keep the inherited pty fds across exec, run stdio on
/// /dev/null, and exec ourselves with the serve directive.
unsafe fn exec_detached_server(
    master_fd: RawFd,
    slave_fd: RawFd,
    path: &CString,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    cwd: Option<&std::ffi::CStr>,
    diag: &CString,
) -> ! {
    restore_default_signals();

    libc::setsid();

    let devnull = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
    if devnull >= 0 {
        libc::dup2(devnull, 0);
        libc::dup2(devnull, 1);
        libc::dup2(devnull, 2);
        if devnull > 2 {
            libc::close(devnull);
        }
    }
    close_fds_above_stdio(&[master_fd, slave_fd]);

    if let Some(dir) = cwd {
        libc::chdir(dir.as_ptr());
    }

    libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());

    libc::write(2, diag.as_ptr() as *const libc::c_void, diag.as_bytes().len());
    libc::sleep(1);
    libc::_exit(1)
}

unsafe fn restore_default_signals() {
    for sig in 1..32 {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        libc::signal(sig, libc::SIG_DFL);
    }
    let mut set: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut set);
    libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
}

unsafe fn close_fds_above_stdio(keep: &[RawFd]) {
    let max = libc::sysconf(libc::_SC_OPEN_MAX);
    let max = if max <= 0 { 1024 } else { max as RawFd };
    for fd in 3..max {
        if !keep.contains(&fd) {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_envp_overlays_overrides() {
        std::env::set_var("PTYMUX_TEST_BASE", "base");
        let envp = build_envp(&[
            ("PTYMUX_TEST_BASE".to_string(), "override".to_string()),
            ("PTYMUX_TEST_NEW".to_string(), "fresh".to_string()),
        ])
        .unwrap();

        let entries: Vec<String> = envp
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect();
        assert!(entries.contains(&"PTYMUX_TEST_BASE=override".to_string()));
        assert!(entries.contains(&"PTYMUX_TEST_NEW=fresh".to_string()));
        assert!(!entries.contains(&"PTYMUX_TEST_BASE=base".to_string()));
        std::env::remove_var("PTYMUX_TEST_BASE");
    }

    #[test]
    fn test_build_argv_leads_with_program() {
        let argv = build_argv("/bin/echo", &["hello".to_string()]).unwrap();
        assert_eq!(argv[0].to_str().unwrap(), "/bin/echo");
        assert_eq!(argv[1].to_str().unwrap(), "hello");
    }

    #[test]
    fn test_exec_ptrs_are_null_terminated() {
        let argv = build_argv("/bin/echo", &["hi".to_string()]).unwrap();
        let ptrs = exec_ptrs(&argv);
        assert_eq!(ptrs.len(), argv.len() + 1);
        assert!(ptrs.last().unwrap().is_null());
        assert_eq!(ptrs[0], argv[0].as_ptr());
    }

    #[test]
    fn test_nul_in_argument_is_rejected() {
        assert!(build_argv("/bin/echo", &["bad\0arg".to_string()]).is_err());
    }

    #[test]
    fn test_fork_direct_produces_live_pty() {
        let mut spec = LaunchSpec::new("/bin/sh");
        spec.args = vec!["-c".to_string(), "exit 0".to_string()];
        let forked = fork_direct(&spec).unwrap();
        assert!(forked.master.as_raw_fd() >= 0);
        assert!(forked.child.as_raw() > 0);
        assert!(forked.tty_name.starts_with("/dev/"));
        // Reap so the test process stays zombie-free.
        let _ = nix::sys::wait::waitpid(forked.child, None);
    }
}
