use crate::classifier::{ErrorClassification, KeywordTable};
use crate::config::error::{ConfigError, Result};
use crate::policy::RetryPolicy;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Backend endpoints used by the probe and session refresh
    #[serde(default)]
    pub backend: BackendConfig,

    /// Default retry policy
    #[serde(default)]
    pub retry: RetrySettings,

    /// Error log settings
    #[serde(default)]
    pub log: LogSettings,

    /// Classifier keyword overrides
    #[serde(default)]
    pub classifier: ClassifierSettings,
}

/// Hosted backend location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://project.example.co`
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Public API key sent as the `apikey` header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anon_key: Option<String>,

    /// Path hit by the connectivity probe
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Path of the session refresh endpoint
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,

    /// Per-request timeout for probe and refresh calls
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Retry settings, turned into a [`RetryPolicy`] by [`RecoveryConfig::retry_policy`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// ±fraction of randomness applied to each delay (0 disables jitter)
    #[serde(default)]
    pub jitter_factor: f64,

    /// Classifications that are retried
    #[serde(default = "default_retryable")]
    pub retryable: Vec<ErrorClassification>,
}

/// Error log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Maximum number of entries kept
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,

    /// User agent stamped on entries (defaults to the crate name and version)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Page or endpoint URL stamped on entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Keyword overrides, replacing the built-in list for each class named
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierSettings {
    #[serde(default)]
    pub keywords: BTreeMap<ErrorClassification, Vec<String>>,
}

// Default value functions
fn default_backend_url() -> String {
    "http://localhost:54321".to_string()
}
fn default_probe_path() -> String {
    "/rest/v1/".to_string()
}
fn default_refresh_path() -> String {
    "/auth/v1/token?grant_type=refresh_token".to_string()
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_retryable() -> Vec<ErrorClassification> {
    RetryPolicy::default().retryable().iter().copied().collect()
}
fn default_log_capacity() -> usize {
    crate::log::DEFAULT_CAPACITY
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            anon_key: None,
            probe_path: default_probe_path(),
            refresh_path: default_refresh_path(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: 0.0,
            retryable: default_retryable(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
            user_agent: None,
            url: None,
        }
    }
}

impl BackendConfig {
    /// Joins `path` onto the base URL.
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl RecoveryConfig {
    /// Builds the default retry policy described by `[retry]`.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::builder()
            .max_retries(self.retry.max_retries)
            .base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .backoff_multiplier(self.retry.backoff_multiplier)
            .jitter_factor(self.retry.jitter_factor)
            .retryable(self.retry.retryable.iter().copied())
            .build()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Built-in keyword table with `[classifier.keywords]` applied.
    pub fn keyword_table(&self) -> KeywordTable {
        let mut table = KeywordTable::default();
        for (class, keywords) in &self.classifier.keywords {
            table.set_keywords(*class, keywords.iter().cloned());
        }
        table
    }

    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.backend.url).map_err(|e| {
            ConfigError::ValidationError(format!("backend.url '{}': {e}", self.backend.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError(format!(
                "backend.url must be http(s), got scheme '{}'",
                url.scheme()
            )));
        }
        if self.backend.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "backend.request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.log.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "log.capacity must be at least 1".to_string(),
            ));
        }
        self.retry_policy()?;
        Ok(())
    }
}

/// Configuration loader with layered merging support
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new ConfigLoader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration with layered merging:
    /// 1. Start with defaults (from Default implementations)
    /// 2. Merge config file if provided
    /// 3. Override with environment variables (HELPDESK_ prefix)
    pub fn load(&self) -> Result<RecoveryConfig> {
        let mut builder = Config::builder();

        // Layer 1: Defaults (serialize defaults to JSON and load as base)
        let defaults_json = serde_json::to_string(&RecoveryConfig::default())?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        // Layer 2: Config file (if provided)
        if let Some(ref path) = self.config_path {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_path()));
            } else {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
        }

        // Layer 3: Environment variables, double underscore for nesting.
        // Example: HELPDESK_RETRY__MAX_RETRIES=5
        builder = builder.add_source(
            Environment::with_prefix("HELPDESK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("retry.retryable"),
        );

        let config = builder.build()?;
        let recovery_config: RecoveryConfig = config.try_deserialize()?;
        recovery_config.validate()?;

        Ok(recovery_config)
    }

    /// Locate the default config file in standard locations:
    /// 1. Current directory: ./helpdesk-recovery.toml
    /// 2. XDG config: ~/.config/helpdesk/recovery.toml
    /// 3. Home directory: ~/.helpdesk-recovery.toml
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./helpdesk-recovery.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("helpdesk").join("recovery.toml");
            if xdg_config.exists() {
                return Some(xdg_config);
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".helpdesk-recovery.toml");
            if home_config.exists() {
                return Some(home_config);
            }
        }

        None
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<RecoveryConfig> {
        let loader = if let Some(config_path) = Self::find_config_file() {
            ConfigLoader::new().with_file(config_path)
        } else {
            ConfigLoader::new()
        };

        loader.load()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
