use anyhow::{Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::models::{ArchiveFormat, HashAlgorithm};

pub const DEFAULT_CONFIG_FILE: &str = "ferry.toml";

/// Fixed-count, fixed-delay retry policy for uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total upload attempts, including the first one.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_secs: 5,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Archive format used when the caller does not pick one.
    pub format: ArchiveFormat,
    /// Entry names matching any of these (substring, or suffix once `*` is
    /// stripped) are left out of the archive.
    pub exclude_patterns: Vec<String>,
    /// Compare local and remote digests before installing.
    pub verify_upload: bool,
    pub hash_algorithm: HashAlgorithm,
    pub retry: RetryConfig,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Remote directory the archive is uploaded into before extraction.
    pub remote_temp_dir: String,
    /// Local directory archives are built in.
    pub scratch_dir: PathBuf,
    /// Number of `*.backup.*` directories kept after a successful install.
    /// `None` keeps all of them.
    pub backup_retention: Option<usize>,
    pub database_path: PathBuf,
    pub log_json: bool,
    pub verbose: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            format: ArchiveFormat::Zip,
            exclude_patterns: [
                "__pycache__",
                ".git",
                "*.pyc",
                ".DS_Store",
                "node_modules",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            verify_upload: true,
            hash_algorithm: HashAlgorithm::Md5,
            retry: RetryConfig::default(),
            connect_timeout_secs: 30,
            command_timeout_secs: 30,
            remote_temp_dir: "/tmp".to_string(),
            scratch_dir: std::env::temp_dir().join("ferry"),
            backup_retention: None,
            database_path: PathBuf::from("ferry.db"),
            log_json: false,
            verbose: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `FERRY_*` environment variables and
    /// finally any CLI overrides, then validate the result.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("FERRY_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.attempts == 0 {
            bail!("retry.attempts must be at least 1");
        }
        if self.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than 0");
        }
        if self.command_timeout_secs == 0 {
            bail!("command_timeout_secs must be greater than 0");
        }
        if !self.remote_temp_dir.starts_with('/') {
            bail!(
                "remote_temp_dir must be an absolute path, got '{}'",
                self.remote_temp_dir
            );
        }
        if self.backup_retention == Some(0) {
            bail!("backup_retention must keep at least one backup; omit it to keep all");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
