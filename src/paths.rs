//! Application directory structure for vmkeeper.
//!
//! Provides a single `AppPaths` struct that resolves the standard directories
//! and can create them on first launch. Follows platform conventions:
//!
//! - Config: `~/.config/vmkeeper/`  (human-editable, XDG-style everywhere)
//! - Data:   `~/Library/Application Support/vmkeeper/` on macOS,
//!           `$XDG_DATA_HOME/vmkeeper/` elsewhere
//! - Logs:   `~/Library/Logs/vmkeeper/` on macOS, `<data>/logs/` elsewhere
//!
//! The data directory is the default `data_path`: machine settings and the
//! raw disk descriptor live there.

use std::path::{Path, PathBuf};
use tracing::debug;

pub const APP_NAME: &str = "vmkeeper";

/// Name of the configuration file looked up in [`AppPaths::config`].
pub const CONFIG_FILE: &str = "config.toml";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config: `~/.config/vmkeeper/`
    pub config: PathBuf,
    /// Machine settings and disk descriptors
    pub data: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        Some(Self {
            config: resolve_config_dir(&home),
            data: resolve_data_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    /// Default configuration file, if it exists.
    pub fn default_config_file(&self) -> Option<PathBuf> {
        let path = self.config.join(CONFIG_FILE);
        path.is_file().then_some(path)
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!(dir = %dir.display(), "Ensured directory");
        }
        Ok(())
    }
}

/// Data directory used when no home directory can be resolved.
pub fn fallback_data_dir() -> PathBuf {
    std::env::temp_dir().join(APP_NAME)
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Application Support").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home).join("logs")
}
