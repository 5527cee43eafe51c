use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const CONFIG_FILE: &str = "flasher.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// The privileged helper every flash command is addressed to
    pub ksud_path: PathBuf,
    /// Passed to the helper as `--magiskboot` when set
    pub magiskboot_path: Option<PathBuf>,
    pub su_path: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            ksud_path: PathBuf::from("/data/adb/ksud"),
            magiskboot_path: None,
            su_path: PathBuf::from("su"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Pause between consecutive batch elements
    pub settle_delay_ms: u64,
    /// Prefix of saved install logs
    pub product_name: String,
    pub cache_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    /// Where a patched boot image is written
    pub boot_output_dir: Option<PathBuf>,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            product_name: "KernelSU".to_string(),
            cache_dir: None,
            log_dir: None,
            boot_output_dir: None,
        }
    }
}

impl FlashConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub poll_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retry_count: u32,
    /// Unchanged progress samples tolerated before a transfer counts as stalled
    pub stall_threshold: u32,
    pub download_dir: Option<PathBuf>,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            retry_delay_ms: 3000,
            max_retry_count: 3,
            stall_threshold: 30,
            download_dir: None,
            user_agent: format!("ksu-flasher/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DownloadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Settings persisted as `flasher.toml` in the per-user config directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    pub executor: ExecutorConfig,
    pub flash: FlashConfig,
    pub download: DownloadConfig,
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "sukisu", "ksu-flasher")
        .ok_or_else(|| anyhow!("Failed to determine project directories"))
}

impl FlasherConfig {
    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: FlasherConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).with_context(|| format!("Failed to write config {:?}", path))?;
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.flash
            .cache_dir
            .clone()
            .or_else(|| project_dirs().ok().map(|d| d.cache_dir().to_path_buf()))
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Public downloads location, falling back to the cache directory
    fn downloads_dir(&self) -> PathBuf {
        UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| self.cache_dir())
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download
            .download_dir
            .clone()
            .unwrap_or_else(|| self.downloads_dir())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.flash
            .log_dir
            .clone()
            .unwrap_or_else(|| self.downloads_dir())
    }

    pub fn boot_output_dir(&self) -> PathBuf {
        self.flash
            .boot_output_dir
            .clone()
            .unwrap_or_else(|| self.downloads_dir())
    }
}
