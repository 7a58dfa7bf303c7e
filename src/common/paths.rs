//! Platform-appropriate configuration and scratch paths
//!
//! Uses the directories crate:
//! - Linux: `~/.config/toolharness/` and `~/.local/share/toolharness/`
//! - macOS: `~/Library/Application Support/toolharness/`
//! - Windows: `%APPDATA%\toolharness\`

use std::io;
use std::path::PathBuf;

/// Name used for the project directories
const APP_NAME: &str = "toolharness";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Directory under which per-instance config trees are generated
///
/// Falls back to the system temp dir when no home directory is known.
pub fn default_work_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("instances"))
        .unwrap_or_else(|| std::env::temp_dir().join(format!("{}-instances", APP_NAME)))
}

/// Directory where structured reports are written when none is given
pub fn default_report_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("reports"))
        .unwrap_or_else(|| std::env::temp_dir().join(format!("{}-reports", APP_NAME)))
}

/// Ensure a directory exists, creating parents as needed
pub fn ensure_dir(dir: &std::path::Path) -> io::Result<PathBuf> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dirs_are_distinct() {
        assert_ne!(default_work_dir(), default_report_dir());
        assert!(!default_work_dir().as_os_str().is_empty());
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let created = ensure_dir(&nested).unwrap();
        assert!(created.is_dir());
        // Second call is a no-op
        ensure_dir(&nested).unwrap();
    }
}
