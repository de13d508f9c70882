/// Configuration for the recovery layer
///
/// Layered the 12-factor way:
/// 1. Defaults (from code)
/// 2. Config file (helpdesk-recovery.toml)
/// 3. Environment variables (HELPDESK_* prefix, `__` for nesting)
///
/// # Example
///
/// ```no_run
/// use helpdesk_recovery::config::ConfigLoader;
///
/// // Load from default locations
/// let config = ConfigLoader::load_default().expect("Failed to load config");
///
/// // Or load from specific file
/// let config = ConfigLoader::new()
///     .with_file("./helpdesk-recovery.toml")
///     .load()
///     .expect("Failed to load config");
/// ```
pub mod error;
pub mod loader;

pub use error::{ConfigError, Result};
pub use loader::{
    BackendConfig, ClassifierSettings, ConfigLoader, LogSettings, RecoveryConfig, RetrySettings,
};
