use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Build a **tokio** `Command` that runs an inline shell string.
    fn shell_inline(command: &str) -> tokio::process::Command;

    /// Send a termination signal to the process identified by `pid`.
    fn kill_process(pid: &str) -> std::io::Result<std::process::Output>;

    /// Whether a process with this pid currently exists.
    fn is_process_alive(pid: u32) -> bool;

    /// Spawn a child that tails / follows a log file.
    fn tail_file(path: &Path) -> std::io::Result<std::process::Child>;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Binary filename for this platform (`"chatrelay"` / `"chatrelay.exe"`).
    fn binary_name() -> &'static str;

    /// Root data directory.
    /// Unix: `~/.chatrelay`, Windows: `%APPDATA%\chatrelay`.
    fn data_dir() -> PathBuf;
}

pub const HOME_ENV: &str = "CHATRELAY_HOME";

/// `$CHATRELAY_HOME` wins over the platform default when set and non-empty.
pub fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os(HOME_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
