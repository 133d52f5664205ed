use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Upper bound for the worker pool. The detection service rate-limits submissions.
pub const MAX_PARALLELISM: usize = 32;

/// Environment variable that supplies the detection API key when the config leaves it empty.
pub const DETECTION_KEY_ENV: &str = "DOD_API_KEY";

/// Environment variable that supplies a Drive access token, overriding the token file.
pub const DRIVE_TOKEN_ENV: &str = "DRIVE_ACCESS_TOKEN";

const CONFIG_FILE_NAME: &str = "config.toml";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Config structs for config.toml
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Paths {
    pub state_file: String,
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Limits {
    /// Files strictly larger than this are never downloaded.
    pub file_size_cap: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Pools {
    /// 1 runs the sequential batch pipeline, anything larger the worker pool.
    pub max_parallelism: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Polling {
    pub interval_secs: u64,
    /// 0 disables the per-job deadline.
    pub job_deadline_secs: u64,
    /// 0 means unlimited poll rounds.
    pub max_polls: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Drive {
    pub api_base: String,
    pub token_file: String,
    pub quarantine_folder_name: String,
    pub page_size: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Detection {
    pub api_base: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub paths: Paths,
    pub limits: Limits,
    pub pools: Pools,
    pub polling: Polling,
    pub drive: Drive,
    pub detection: Detection,
    pub logging: Logging,
}

// Default implementation for AppConfig
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: Paths {
                state_file: "./settings.json".to_string(),
                log_directory: "./logs".to_string(),
            },
            limits: Limits {
                // 32 MB in SI units, the detection service rejects anything bigger
                file_size_cap: 32_000_000,
            },
            pools: Pools { max_parallelism: 5 },
            polling: Polling {
                interval_secs: 5,
                job_deadline_secs: 1800,
                max_polls: 0,
            },
            drive: Drive {
                api_base: "https://www.googleapis.com/drive/v3".to_string(),
                token_file: "./token.json".to_string(),
                quarantine_folder_name: "Quarantine".to_string(),
                page_size: 1000,
                timeout_secs: 60,
            },
            detection: Detection {
                api_base: "https://feapi.marketplace.apps.fireeye.com".to_string(),
                api_key: String::new(),
                timeout_secs: 60,
            },
            logging: Logging {
                log_level: "info".to_string(),
                log_format: "json".to_string(),
                log_to_terminal: true,
                log_to_file: true,
            },
        }
    }
}

impl AppConfig {
    /// Checks the settings the pipeline cannot run without.
    pub fn validate(&self) -> ConfigResult<()> {
        let parallelism = self.pools.max_parallelism;
        if parallelism == 0 || parallelism > MAX_PARALLELISM {
            return Err(ConfigError::Invalid(format!(
                "pools.max_parallelism must be between 1 and {}, got {}",
                MAX_PARALLELISM, parallelism
            )));
        }
        if self.polling.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "polling.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.limits.file_size_cap == 0 {
            return Err(ConfigError::Invalid(
                "limits.file_size_cap must be greater than 0".to_string(),
            ));
        }
        if self.drive.page_size == 0 || self.drive.page_size > 1000 {
            return Err(ConfigError::Invalid(format!(
                "drive.page_size must be between 1 and 1000, got {}",
                self.drive.page_size
            )));
        }
        if self.drive.quarantine_folder_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "drive.quarantine_folder_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_secs)
    }

    pub fn job_deadline(&self) -> Option<Duration> {
        match self.polling.job_deadline_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn max_polls(&self) -> Option<u32> {
        match self.polling.max_polls {
            0 => None,
            polls => Some(polls),
        }
    }

    /// Fills secrets left empty in the file from the environment.
    fn apply_env_overrides(&mut self) {
        if self.detection.api_key.is_empty() {
            if let Ok(key) = std::env::var(DETECTION_KEY_ENV) {
                self.detection.api_key = key;
            }
        }
    }
}

/// Owns the configuration directory and the parsed `config.toml`.
pub struct ConfigManager {
    app_config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Loads `config.toml` from `config_dir`, writing a default one when absent.
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        // Create the directory if it doesn't exist
        if !config_dir.exists() {
            info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let manager = Self {
            app_config: Arc::new(RwLock::new(AppConfig::default())),
            config_dir,
        };
        manager.create_default_config()?;

        let mut app_config = Self::load_app_config(&manager.config_dir)?;
        app_config.apply_env_overrides();
        app_config.validate()?;
        *manager.app_config.write() = app_config;

        Ok(manager)
    }

    // Load app config from config.toml
    fn load_app_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            warn!("Config file not found: {}", config_path.display());
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    // Get app config
    pub fn get_app_config(&self) -> AppConfig {
        self.app_config.read().clone()
    }

    /// Replaces the in-memory config, e.g. after applying command line overrides.
    pub fn override_app_config(&self, config: AppConfig) -> ConfigResult<()> {
        config.validate()?;
        *self.app_config.write() = config;
        Ok(())
    }

    // Create config.toml if it doesn't exist
    pub fn create_default_config(&self) -> ConfigResult<()> {
        let config_path = self.config_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            let default_config = AppConfig::default();
            let toml_string = toml::to_string_pretty(&default_config)
                .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
            fs::write(&config_path, toml_string)?;
            info!("Created default config at {}", config_path.display());
        }
        Ok(())
    }
}

// Helper function to create a ConfigManager instance
pub fn init_config(config_dir: impl AsRef<Path>) -> ConfigResult<Arc<ConfigManager>> {
    Ok(Arc::new(ConfigManager::new(config_dir)?))
}
