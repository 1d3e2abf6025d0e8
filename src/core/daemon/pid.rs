use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::StartupError;
use crate::platform::{NativePlatform, Platform};

/// Owns the PID marker for as long as it lives; dropping it removes the file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

impl PidFile {
    /// Write our pid. A marker left by a dead process is replaced; one held
    /// by a live process is an error.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, StartupError> {
        let path = path.into();
        if let Some(pid) = read_pid(&path) {
            if pid != std::process::id() && NativePlatform::is_process_alive(pid) {
                return Err(StartupError::AlreadyRunning { pid });
            }
            warn!("Removing stale PID file {:?} (pid {})", path, pid);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StartupError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, std::process::id().to_string()).map_err(|source| {
            StartupError::Io {
                path: path.clone(),
                source,
            }
        })?;
        debug!("Wrote PID file {:?}", path);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the marker if it is still ours.
        if read_pid(&self.path) == Some(std::process::id()) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
