//! Service configuration.
//!
//! Settings are read from a TOML file and then patched with the two
//! environment overrides the deployment supplies (`OCR_SERVICE_URL` and
//! `PORT`). Every section has defaults, so an absent file yields a working
//! local configuration via [`Config::minimal`].
//!
//! ```toml
//! [db]
//! path = "./data/rewards.sqlite"
//!
//! [server]
//! bind = "0.0.0.0:3001"
//!
//! [recognition]
//! endpoint = "http://localhost:8001"
//! timeout_secs = 30
//!
//! [uploads]
//! dir = "./uploads"
//! max_bytes = 10485760
//!
//! [rewards]
//! points_per_receipt = 25
//! duplicate_window_secs = 3600
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding `recognition.endpoint`.
pub const ENV_OCR_SERVICE_URL: &str = "OCR_SERVICE_URL";
/// Environment variable overriding the port of `server.bind`.
pub const ENV_PORT: &str = "PORT";

/// Longest accepted duplicate window: one year.
pub const MAX_DUPLICATE_WINDOW_SECS: i64 = 366 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/rewards.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3001".to_string(),
        }
    }
}

/// Where and how the external recognition service is called.
#[derive(Debug, Deserialize, Clone)]
pub struct RecognitionConfig {
    /// Base URL; requests go to `{endpoint}/process-receipt`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_endpoint() -> String {
    "http://localhost:8001".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadsConfig {
    #[serde(default = "default_upload_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: default_upload_dir(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}
fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}

/// Award and duplicate-suppression policy.
#[derive(Debug, Deserialize, Clone)]
pub struct RewardsConfig {
    #[serde(default = "default_points_per_receipt")]
    pub points_per_receipt: i64,
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: i64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            points_per_receipt: default_points_per_receipt(),
            duplicate_window_secs: default_duplicate_window_secs(),
        }
    }
}

fn default_points_per_receipt() -> i64 {
    25
}
fn default_duplicate_window_secs() -> i64 {
    3600
}

impl Config {
    /// Defaults for every section, used when no config file exists.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig::default(),
            server: ServerConfig::default(),
            recognition: RecognitionConfig::default(),
            uploads: UploadsConfig::default(),
            rewards: RewardsConfig::default(),
        }
    }

    /// Applies `OCR_SERVICE_URL` and `PORT` from the given lookup.
    ///
    /// Takes a lookup function rather than reading the process environment
    /// directly so the override rules can be tested in isolation.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_OCR_SERVICE_URL).filter(|v| !v.trim().is_empty()) {
            self.recognition.endpoint = url.trim().to_string();
        }

        if let Some(port) = lookup(ENV_PORT).filter(|v| !v.trim().is_empty()) {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("{} must be a port number, got '{}'", ENV_PORT, port))?;
            let host = match self.server.bind.rsplit_once(':') {
                Some((host, _)) => host.to_string(),
                None => self.server.bind.clone(),
            };
            self.server.bind = format!("{}:{}", host, port);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.uploads.max_bytes == 0 {
            anyhow::bail!("uploads.max_bytes must be > 0");
        }

        if self.recognition.timeout_secs == 0 {
            anyhow::bail!("recognition.timeout_secs must be > 0");
        }

        let url = reqwest::Url::parse(&self.recognition.endpoint).with_context(|| {
            format!(
                "recognition.endpoint is not a valid URL: '{}'",
                self.recognition.endpoint
            )
        })?;
        match url.scheme() {
            "http" | "https" => {}
            other => anyhow::bail!(
                "recognition.endpoint must use http or https, got '{}'",
                other
            ),
        }

        if self.rewards.points_per_receipt <= 0 {
            anyhow::bail!("rewards.points_per_receipt must be > 0");
        }

        if self.rewards.duplicate_window_secs <= 0
            || self.rewards.duplicate_window_secs > MAX_DUPLICATE_WINDOW_SECS
        {
            anyhow::bail!(
                "rewards.duplicate_window_secs must be between 1 and {}",
                MAX_DUPLICATE_WINDOW_SECS
            );
        }

        Ok(())
    }
}

/// Parses and validates a config file, without environment overrides.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

/// Loads the config file if present (defaults otherwise), then applies the
/// process environment overrides.
pub fn resolve_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        load_config(path)?
    } else {
        Config::minimal()
    };

    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;

    Ok(config)
}
