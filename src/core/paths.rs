use std::path::{Path, PathBuf};

use crate::core::config::Config;
use crate::platform::{NativePlatform, Platform};

/// Locations of everything the daemon keeps on disk.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
    queue: PathBuf,
    tasks: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            queue: root.join("queue"),
            tasks: root.join("tasks"),
            root,
        }
    }

    /// Platform data dir, honouring `$CHATRELAY_HOME`.
    pub fn from_env() -> Self {
        Self::new(NativePlatform::data_dir())
    }

    /// Apply `queue_dir` / `tasks_dir` overrides from the config.
    pub fn with_config(mut self, config: &Config) -> Self {
        if let Some(dir) = &config.queue_dir {
            self.queue = self.resolve(dir);
        }
        if let Some(dir) = &config.tasks_dir {
            self.tasks = self.resolve(dir);
        }
        self
    }

    fn resolve(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.root.join(dir)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn crash_log(&self) -> PathBuf {
        self.run_dir().join("crashes.json")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.run_dir().join("chatrelay.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.run_dir().join("chatrelay.log")
    }

    pub fn reset_dir(&self) -> PathBuf {
        self.root.join("reset")
    }

    pub fn reset_signal(&self, agent_id: &str) -> PathBuf {
        self.reset_dir().join(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_root() {
        let paths = DataPaths::new("/data");
        assert_eq!(paths.config_file(), PathBuf::from("/data/config.yaml"));
        assert_eq!(paths.queue_dir(), Path::new("/data/queue"));
        assert_eq!(paths.pid_file(), PathBuf::from("/data/run/chatrelay.pid"));
        assert_eq!(paths.reset_signal("a"), PathBuf::from("/data/reset/a"));
    }

    #[test]
    fn config_overrides_resolve_relative_to_root() {
        let config = Config::from_yaml("queue_dir: spool\ntasks_dir: /etc/chatrelay/tasks").unwrap();
        let paths = DataPaths::new("/data").with_config(&config);
        assert_eq!(paths.queue_dir(), Path::new("/data/spool"));
        assert_eq!(paths.tasks_dir(), Path::new("/etc/chatrelay/tasks"));
    }
}
