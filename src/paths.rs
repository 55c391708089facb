//! Application path management for portable and installed modes.
//!
//! - **Portable mode**: a `.portable` marker next to the executable keeps
//!   `config.yaml` and `logs/` beside the binary.
//! - **Installed mode** (default): data lives in `%APPDATA%\Mixr` (or the
//!   platform equivalent).

use std::path::{Path, PathBuf};
use tracing::debug;

/// Application name used for directories in installed mode
const APP_NAME: &str = "Mixr";

/// Application paths for config and logs.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Path to the configuration file
    pub config: PathBuf,
    /// Path to the logs directory
    pub logs_dir: PathBuf,
    /// Whether running in portable mode (config next to exe)
    pub is_portable: bool,
}

impl AppPaths {
    /// Detect the appropriate paths based on environment.
    ///
    /// In debug builds a `config.yaml` in the working directory wins, so
    /// `cargo run` picks up the project's config.
    ///
    /// Called before logging is initialized, so diagnostics go to stderr.
    pub fn detect() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        #[cfg(debug_assertions)]
        {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            if cwd.join("config.yaml").exists() {
                eprintln!("[paths] DEV mode, using config.yaml in {}", cwd.display());
                return Self::portable(&cwd);
            }
        }

        if exe_dir.join(".portable").exists() {
            return Self::portable(&exe_dir);
        }

        let app_data = dirs::data_dir()
            .unwrap_or_else(|| {
                eprintln!("[paths] WARNING: no data directory, falling back to exe dir");
                exe_dir.clone()
            })
            .join(APP_NAME);

        Self {
            config: app_data.join("config.yaml"),
            logs_dir: app_data.join("logs"),
            is_portable: false,
        }
    }

    /// Paths rooted at an explicit config file (from `--config`)
    pub fn for_config(config: impl Into<PathBuf>) -> Self {
        let config = config.into();
        let base = config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            logs_dir: base.join("logs"),
            config,
            is_portable: true,
        }
    }

    fn portable(dir: &Path) -> Self {
        Self {
            config: dir.join("config.yaml"),
            logs_dir: dir.join("logs"),
            is_portable: true,
        }
    }

    /// Ensure the logs directory exists.
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        if !self.logs_dir.exists() {
            debug!("Creating logs directory: {}", self.logs_dir.display());
            std::fs::create_dir_all(&self.logs_dir)?;
        }
        Ok(())
    }
}
