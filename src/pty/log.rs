//! Optional on-disk capture of a task's raw output stream.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Appends every chunk the multiplexer reads from the pty, while
/// started. Append failures stop the log rather than the task.
#[derive(Debug, Default)]
pub struct OutputLog {
    file: Option<File>,
    path: Option<PathBuf>,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or create) the log file. Returns false if the file could
    /// not be opened; the task keeps running either way.
    pub fn start(&mut self, path: &Path) -> bool {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                debug!("logging task output to {}", path.display());
                self.file = Some(file);
                self.path = Some(path.to_path_buf());
                true
            }
            Err(e) => {
                warn!("failed to open output log {}: {}", path.display(), e);
                false
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(path) = self.path.take() {
            debug!("stopped logging task output to {}", path.display());
        }
        self.file = None;
    }

    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    pub fn append(&mut self, data: &[u8]) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(data) {
                warn!("output log write failed, disabling log: {}", e);
                self.file = None;
                self.path = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_only_while_active() {
        let dir = std::env::temp_dir().join(format!("ptymux-log-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.log");

        let mut log = OutputLog::new();
        log.append(b"dropped");
        assert!(log.start(&path));
        log.append(b"kept");
        log.stop();
        log.append(b"dropped too");

        assert_eq!(std::fs::read(&path).unwrap(), b"kept");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_start_failure_returns_false() {
        let mut log = OutputLog::new();
        assert!(!log.start(Path::new("/nonexistent-dir/never/out.log")));
        assert!(!log.is_active());
    }
}
