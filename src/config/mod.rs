use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::loader::Visibility;

/// Environment variable holding extra plugin directories, separated like `PATH`.
pub const PLUGIN_PATH_ENV: &str = "HEARTH_PLUGIN_PATH";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directories scanned after those from the environment
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Also scan `~/.hearth/plugins` and `<exe dir>/plugins`
    #[serde(default = "default_true")]
    pub include_default_paths: bool,

    /// Symbol visibility for loaded modules: global or local
    #[serde(default)]
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads running plugin entry points
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Version plugins are checked against; defaults to the crate version
    #[serde(default)]
    pub host_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// Named pipe secondaries forward commands through
    #[serde(default = "default_pipe_path")]
    pub pipe_path: PathBuf,

    /// Listener sleep between empty reads
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join("hearth.lock")
}

fn default_pipe_path() -> PathBuf {
    std::env::temp_dir().join("hearth.pipe")
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            include_default_paths: true,
            visibility: Visibility::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            host_version: None,
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            lock_path: default_lock_path(),
            pipe_path: default_pipe_path(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl InstanceConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Config {
    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(hearth_home()?.join("config.yaml"))
    }

    /// Version plugins must be compatible with.
    #[must_use]
    pub fn host_version(&self) -> String {
        self.runtime
            .host_version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    /// Directories to scan, in order: the environment, the config file, then
    /// the defaults. Duplicates are dropped.
    #[must_use]
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = std::env::var_os(PLUGIN_PATH_ENV)
            .map(|value| std::env::split_paths(&value).collect())
            .unwrap_or_default();
        paths.extend(self.plugins.search_paths.iter().cloned());
        if self.plugins.include_default_paths {
            paths.extend(default_search_paths());
        }

        let mut unique = Vec::with_capacity(paths.len());
        for path in paths {
            if !path.as_os_str().is_empty() && !unique.contains(&path) {
                unique.push(path);
            }
        }
        unique
    }
}

fn hearth_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;

    Ok(home.join(".hearth"))
}

fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(home) = hearth_home() {
        paths.push(home.join("plugins"));
    }
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("plugins")))
    {
        paths.push(dir);
    }
    paths
}
