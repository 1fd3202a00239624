use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` so call sites stay free of
/// `#[cfg]` blocks.
pub trait Platform {
    /// Build a **tokio** `Command` that executes a script file through the platform shell.
    fn shell_command_async(script_path: &Path) -> tokio::process::Command;

    /// Build a **tokio** `Command` that runs an inline shell string.
    fn shell_inline(command: &str) -> tokio::process::Command;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Build a **tokio** `Command` that launches a desktop application by name.
    fn launch_application(name: &str) -> tokio::process::Command;

    /// Platform default location of the taskcrew home directory.
    fn default_data_dir() -> PathBuf;

    /// Root data directory, honouring `TASKCREW_HOME`.
    fn data_dir() -> PathBuf {
        resolve_data_dir(Self::default_data_dir())
    }
}

pub const DATA_DIR_ENV: &str = "TASKCREW_HOME";

/// `TASKCREW_HOME` when set and non-empty, else `fallback`.
pub fn resolve_data_dir(fallback: PathBuf) -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => fallback,
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
