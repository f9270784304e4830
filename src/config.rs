use std::{env, path::PathBuf, time::Duration};

use once_cell::sync::Lazy;

use crate::paths::AppDirs;
use crate::scheduler::ScheduleIntervals;

pub const DEFAULT_CHANNEL_NAME: &str = "LauncherInstance";
pub const DEFAULT_OFFLINE_KEY: &str = "OFFLINE_MODE";
pub const DEFAULT_DEVELOP_KEY: &str = "DEVELOP_MODE";
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

static DEFAULT_API_URL: Lazy<Option<String>> = Lazy::new(|| {
    if let Ok(value) = env::var("LAUNCHER_API_URL") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    if let Some(value) = option_env!("LAUNCHER_DEFAULT_API_URL") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    None
});

/// Names of the environment variables that carry operating-mode markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeKeys {
    pub offline: String,
    pub develop: String,
}

impl Default for ModeKeys {
    fn default() -> Self {
        Self {
            offline: DEFAULT_OFFLINE_KEY.to_string(),
            develop: DEFAULT_DEVELOP_KEY.to_string(),
        }
    }
}

/// Names of the variables that steer how launched commands are spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchKeys {
    /// Variable whose value names the variable holding the shell path.
    pub shell: String,
    /// Variable listing installed package roots (path-list).
    pub package_roots: Option<String>,
    /// Package names whose roots stay visible to launched commands.
    pub inherit: Vec<String>,
}

impl Default for LaunchKeys {
    fn default() -> Self {
        Self {
            shell: "SHELL".to_string(),
            package_roots: None,
            inherit: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_url: Option<String>,
    pub cache_dir: PathBuf,
    pub cache_retention: Duration,
    pub intervals: ScheduleIntervals,
    pub channel_name: String,
    pub handshake_timeout: Duration,
    pub worker_threads: usize,
    pub package_name: Option<String>,
    pub current_tag: String,
    pub release_feed: Option<String>,
    pub mode_keys: ModeKeys,
    pub launch_keys: LaunchKeys,
}

impl AppConfig {
    pub fn with_dirs(dirs: &AppDirs) -> Self {
        Self {
            api_url: None,
            cache_dir: dirs.default_cache_dir(),
            cache_retention: Duration::from_secs(DEFAULT_RETENTION_DAYS * 24 * 60 * 60),
            intervals: ScheduleIntervals::default(),
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            handshake_timeout: Duration::from_millis(1000),
            worker_threads: 4,
            package_name: None,
            current_tag: env!("CARGO_PKG_VERSION").to_string(),
            release_feed: None,
            mode_keys: ModeKeys::default(),
            launch_keys: LaunchKeys::default(),
        }
    }

    /// Resolves the configuration from the process environment on top of the
    /// defaults for `dirs`.
    pub fn from_env(dirs: &AppDirs) -> Self {
        let mut config = Self::with_dirs(dirs);
        config.api_url = DEFAULT_API_URL.as_ref().cloned();
        if let Some(dir) = non_empty_var("LAUNCHER_TEMP") {
            config.cache_dir = PathBuf::from(dir);
        }
        config.package_name = non_empty_var("LAUNCHER_NAME");
        if let Some(tag) = non_empty_var("LAUNCHER_TAGS") {
            config.current_tag = tag;
        }
        config.release_feed = non_empty_var("LAUNCHER_RELEASE_FEED");
        if let Some(name) = non_empty_var("LAUNCHER_OFFLINE_NAME") {
            config.mode_keys.offline = name;
        }
        if let Some(name) = non_empty_var("LAUNCHER_DEVELOP_NAME") {
            config.mode_keys.develop = name;
        }
        if let Some(name) = non_empty_var("LAUNCHER_SYS_SHELL_NAME") {
            config.launch_keys.shell = name;
        }
        config.launch_keys.package_roots = non_empty_var("LAUNCHER_PKGROOT_NAME");
        if let Some(inherit) = env::var_os("LAUNCHER_INHERIT") {
            config.launch_keys.inherit = env::split_paths(&inherit)
                .filter_map(|path| path.to_str().map(str::to_string))
                .filter(|name| !name.is_empty())
                .collect();
        }
        config
    }

    pub fn sanitize(&mut self) {
        self.worker_threads = self.worker_threads.clamp(1, 64);
        self.handshake_timeout = self
            .handshake_timeout
            .clamp(Duration::from_millis(50), Duration::from_secs(10));
        if let Some(url) = &self.api_url {
            let trimmed = url.trim().trim_end_matches('/');
            self.api_url = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
