//! Platform-specific logging directory resolution.

use std::path::PathBuf;

/// Returns the platform-appropriate directory for log files.
///
/// On Linux this is `$XDG_STATE_HOME/subtext/logs` (or
/// `~/.local/state/subtext/logs`); elsewhere the local data directory.
pub fn log_dir() -> PathBuf {
    let base = directories::ProjectDirs::from("", "", "subtext")
        .expect("Failed to determine project directories");

    #[cfg(target_os = "linux")]
    {
        base.state_dir()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| base.data_local_dir().join("state"))
            .join("logs")
    }

    #[cfg(not(target_os = "linux"))]
    {
        base.data_local_dir().join("logs")
    }
}

/// Ensures the log directory exists, creating it if necessary.
pub fn ensure_log_dir() -> Result<(), std::io::Error> {
    let dir = log_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(())
}

/// Returns the base path for the service log file.
pub fn service_log_path() -> PathBuf {
    log_dir().join("subtext-service.log")
}
