//! Best-effort process-table point queries.
//!
//! Backed by `/proc` on Linux; both queries return `None` on other
//! platforms or for processes that are gone or unreadable. Callers use
//! these for display purposes only, never on the multiplexer thread.

use std::path::PathBuf;

use nix::unistd::Pid;

/// Current working directory of the given process, if discoverable.
pub fn working_directory(pid: Pid) -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_link(format!("/proc/{}/cwd", pid.as_raw())).ok()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

/// Short command name of the given process ("job name"), if discoverable.
pub fn job_name(pid: Pid) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid.as_raw())).ok()?;
        let name = comm.trim_end_matches('\n').to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_own_process_is_discoverable() {
        let pid = getpid();
        assert!(working_directory(pid).is_some());
        let name = job_name(pid).unwrap();
        assert!(!name.is_empty());
    }

    #[test]
    fn test_dead_pid_returns_none() {
        // Pid from far outside the default pid_max range.
        let gone = Pid::from_raw(i32::MAX - 1);
        assert!(working_directory(gone).is_none());
        assert!(job_name(gone).is_none());
    }
}
