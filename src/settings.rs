use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutSettings {
    pub width: u32,
    pub height: u32,
    pub split_command: bool,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            width: 420,
            height: 640,
            split_command: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSettings {
    pub username: String,
    pub remember: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub layout: LayoutSettings,
    pub language: String,
    pub environment: u8,
    pub account: AccountSettings,
    pub last_command: String,
    pub project_id: Option<i64>,
    pub task_id: Option<i64>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            layout: LayoutSettings::default(),
            language: "en_US".to_string(),
            environment: 0,
            account: AccountSettings::default(),
            last_command: String::new(),
            project_id: None,
            task_id: None,
        }
    }
}

impl AppSettings {
    pub fn sanitize(&mut self) {
        self.layout.width = self.layout.width.clamp(240, 4096);
        self.layout.height = self.layout.height.clamp(240, 4096);
        self.environment = self.environment.min(2);
        self.language = self.language.trim().to_string();
        if self.language.is_empty() {
            self.language = "en_US".to_string();
        }
        self.account.username = self.account.username.trim().to_string();
        if !self.account.remember {
            self.account.username.clear();
        }
        if self.project_id.is_none() {
            self.task_id = None;
        }
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn load(&self) -> Result<AppSettings> {
        if !self.path.exists() {
            return Ok(AppSettings::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let mut settings: AppSettings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        settings.sanitize();
        Ok(settings)
    }

    pub fn save(&self, settings: &AppSettings) -> Result<()> {
        let mut normalized = settings.clone();
        normalized.sanitize();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let payload = serde_json::to_string_pretty(&normalized)?;
        fs::write(&self.path, payload)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    /// Loads, applies `change`, and writes back in one step.
    pub fn update<F>(&self, change: F) -> Result<AppSettings>
    where
        F: FnOnce(&mut AppSettings),
    {
        let mut settings = self.load()?;
        change(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }
}
