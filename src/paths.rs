use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use directories::BaseDirs;

const APP_DIR_NAME: &str = "ProjectLauncher";

/// Per-user directory layout.
#[derive(Debug, Clone)]
pub struct AppDirs {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

impl AppDirs {
    pub fn new() -> Result<Self> {
        let base_dirs = BaseDirs::new().context("Unable to determine platform data directory")?;
        let data_dir = base_dirs.data_local_dir().join(APP_DIR_NAME);
        let config_dir = base_dirs.config_dir().join(APP_DIR_NAME);
        let runtime_dir = base_dirs
            .runtime_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .unwrap_or_else(|| data_dir.join("run"));
        Self::at(data_dir, config_dir, runtime_dir)
    }

    /// Builds a layout rooted at explicit directories, creating them.
    pub fn at(data_dir: PathBuf, config_dir: PathBuf, runtime_dir: PathBuf) -> Result<Self> {
        for dir in [&data_dir, &config_dir, &runtime_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(Self {
            data_dir,
            config_dir,
            runtime_dir,
        })
    }

    pub fn default_cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }
}
