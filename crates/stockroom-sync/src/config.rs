//! # Sync Configuration
//!
//! Configuration management for the sync agent.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     STOCKROOM_PROVIDER_URL=https://x.example.co/rest/v1                │
//! │     STOCKROOM_DB_PATH=/var/lib/stockroom/stockroom.db                  │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/stockroom-sync/sync.toml (Linux)                         │
//! │     ~/Library/Application Support/com.stockroom.sync/sync.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │                                                                         │
//! │  Runtime settings (enabled flag, interval, strategy, stored            │
//! │  credentials) live in the sync_metadata row, not here. The [provider]  │
//! │  section only seeds that row, and blank or placeholder values never    │
//! │  replace a stored credential.                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! name = "Front Counter"
//!
//! [database]
//! path = "/var/lib/stockroom/stockroom.db"
//!
//! [sync]
//! batch_size = 50
//! item_delay_ms = 100
//! max_retries = 5
//!
//! [provider]
//! base_url = "https://x.example.co/rest/v1"
//! api_key = "..."
//!
//! [http]
//! read_timeout_secs = 15
//! write_timeout_secs = 10
//! max_attempts = 3
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use stockroom_core::settings::validate_provider_url;
use stockroom_core::{SettingsUpdate, LOCK_LEASE_SECS};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
///
/// The device id itself is generated once and stored in `sync_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Human-readable device name, used in logs.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Stockroom Terminal".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

/// Local database location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to `stockroom.db` in the project data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Maximum pool connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl DatabaseSettings {
    /// The configured path, or the platform default.
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .or_else(|| {
                directories::ProjectDirs::from("com", "stockroom", "sync")
                    .map(|dirs| dirs.data_dir().join("stockroom.db"))
            })
            .unwrap_or_else(|| PathBuf::from("stockroom.db"))
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Push/pull behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Journal entries dequeued per run.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Pause between two pushed items (milliseconds).
    #[serde(default = "default_item_delay")]
    pub item_delay_ms: u64,

    /// Retry budget for retryable journal errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Sync lock lease (seconds).
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Null an optional foreign key whose parent is missing locally
    /// instead of failing the push.
    #[serde(default)]
    pub null_unresolved_optional_fks: bool,

    /// Synced journal entries older than this are purged.
    #[serde(default = "default_cleanup_days")]
    pub cleanup_after_days: u32,
}

fn default_batch_size() -> u32 {
    50
}
fn default_item_delay() -> u64 {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_lease() -> u64 {
    LOCK_LEASE_SECS as u64
}
fn default_cleanup_days() -> u32 {
    7
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            batch_size: default_batch_size(),
            item_delay_ms: default_item_delay(),
            max_retries: default_max_retries(),
            lease_secs: default_lease(),
            null_unresolved_optional_fks: false,
            cleanup_after_days: default_cleanup_days(),
        }
    }
}

// =============================================================================
// Provider & HTTP Settings
// =============================================================================

/// Initial cloud provider credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// HTTP client behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Timeout for change enumeration (seconds).
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Timeout for PATCH/POST (seconds).
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Attempts per request, first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay (milliseconds); doubles per attempt.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Rows per page when enumerating changes.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_read_timeout() -> u64 {
    15
}
fn default_write_timeout() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    1_000
}
fn default_page_size() -> u32 {
    1_000
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            page_size: default_page_size(),
        }
    }
}

// =============================================================================
// Engine Settings
// =============================================================================

/// The subset of configuration the engine reads on every run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub batch_size: u32,
    pub item_delay: Duration,
    pub max_retries: u32,
    pub lock_lease: Duration,
    pub null_unresolved_optional_fks: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        SyncSettings::default().into()
    }
}

impl From<SyncSettings> for EngineSettings {
    fn from(settings: SyncSettings) -> Self {
        EngineSettings {
            batch_size: settings.batch_size,
            item_delay: Duration::from_millis(settings.item_delay_ms),
            max_retries: settings.max_retries,
            lock_lease: Duration::from_secs(settings.lease_secs),
            null_unresolved_optional_fks: settings.null_unresolved_optional_fks,
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub provider: ProviderSettings,

    #[serde(default)]
    pub http: HttpSettings,
}

impl SyncConfig {
    /// Creates a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.sync.lease_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "lease_secs must be greater than 0".into(),
            ));
        }

        if self.http.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }

        if self.http.read_timeout_secs == 0 || self.http.write_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig("HTTP timeouts must be non-zero".into()));
        }

        if self.http.page_size == 0 {
            return Err(SyncError::InvalidConfig(
                "page_size must be greater than 0".into(),
            ));
        }

        if let Some(url) = self.provider.base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            validate_provider_url(url).map_err(|e| SyncError::InvalidUrl(e.to_string()))?;
        }

        Ok(())
    }

    /// Applies `STOCKROOM_*` overrides read through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("STOCKROOM_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(path) = lookup("STOCKROOM_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }

        if let Some(url) = lookup("STOCKROOM_PROVIDER_URL") {
            debug!(url = %url, "Overriding provider URL from environment");
            self.provider.base_url = Some(url);
        }

        if let Some(key) = lookup("STOCKROOM_API_KEY") {
            self.provider.api_key = Some(key);
        }

        if let Some(token) = lookup("STOCKROOM_ACCESS_TOKEN") {
            self.provider.access_token = Some(token);
        }

        if let Some(size) = lookup("STOCKROOM_BATCH_SIZE") {
            match size.parse::<u32>() {
                Ok(n) => self.sync.batch_size = n,
                Err(_) => warn!(value = %size, "Ignoring invalid STOCKROOM_BATCH_SIZE"),
            }
        }

        if let Some(delay) = lookup("STOCKROOM_ITEM_DELAY_MS") {
            match delay.parse::<u64>() {
                Ok(ms) => self.sync.item_delay_ms = ms,
                Err(_) => warn!(value = %delay, "Ignoring invalid STOCKROOM_ITEM_DELAY_MS"),
            }
        }

        if let Some(retries) = lookup("STOCKROOM_MAX_RETRIES") {
            match retries.parse::<u32>() {
                Ok(n) => self.sync.max_retries = n,
                Err(_) => warn!(value = %retries, "Ignoring invalid STOCKROOM_MAX_RETRIES"),
            }
        }

        if let Some(flag) = lookup("STOCKROOM_NULL_OPTIONAL_FKS") {
            self.sync.null_unresolved_optional_fks =
                matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "stockroom", "sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Engine-facing settings.
    pub fn engine_settings(&self) -> EngineSettings {
        self.sync.clone().into()
    }

    /// The `[provider]` section as a settings update. Blank values are left
    /// out so they cannot clear anything.
    pub fn provider_update(&self) -> Option<SettingsUpdate> {
        let non_blank = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        let update = SettingsUpdate {
            provider_url: non_blank(&self.provider.base_url),
            provider_key: non_blank(&self.provider.api_key),
            access_token: non_blank(&self.provider.access_token),
            ..Default::default()
        };
        if update.provider_url.is_none()
            && update.provider_key.is_none()
            && update.access_token.is_none()
        {
            None
        } else {
            Some(update)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.lease_secs, 300);
        assert_eq!(config.http.read_timeout_secs, 15);
        assert_eq!(config.http.write_timeout_secs, 10);
        assert_eq!(config.http.page_size, 1000);
        assert!(!config.sync.null_unresolved_optional_fks);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.sync.batch_size = 0;
        assert!(config.validate().is_err());
        config.sync.batch_size = 10;

        config.provider.base_url = Some("ftp://example.com".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.provider.base_url = Some("https://x.example.co/rest/v1".into());
        assert!(config.validate().is_ok());

        config.http.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STOCKROOM_DB_PATH", "/tmp/s.db"),
            ("STOCKROOM_PROVIDER_URL", "https://x.example.co/rest/v1"),
            ("STOCKROOM_BATCH_SIZE", "7"),
            ("STOCKROOM_MAX_RETRIES", "not-a-number"),
            ("STOCKROOM_NULL_OPTIONAL_FKS", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.resolved_path(), PathBuf::from("/tmp/s.db"));
        assert_eq!(config.sync.batch_size, 7);
        assert_eq!(config.sync.max_retries, 5);
        assert!(config.sync.null_unresolved_optional_fks);
        assert_eq!(
            config.provider.base_url.as_deref(),
            Some("https://x.example.co/rest/v1")
        );
    }

    #[test]
    fn test_toml_sections() {
        let config: SyncConfig = toml::from_str(
            r#"
            [sync]
            batch_size = 20
            item_delay_ms = 0

            [provider]
            base_url = "https://x.example.co/rest/v1"
            api_key = "  "
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.batch_size, 20);
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.engine_settings().item_delay, Duration::ZERO);

        let update = config.provider_update().unwrap();
        assert_eq!(update.provider_url.as_deref(), Some("https://x.example.co/rest/v1"));
        assert!(update.provider_key.is_none());

        let toml_str = toml::to_string_pretty(&SyncConfig::default()).unwrap();
        assert!(toml_str.contains("[sync]"));
        assert!(toml_str.contains("[http]"));
    }

    #[test]
    fn test_provider_section_merges_over_stored_provider() {
        let mut config = SyncConfig::default();
        config.provider.base_url = Some("https://x.example.co/rest/v1/".into());
        config.provider.api_key = Some("anon-key".into());

        let update: stockroom_core::SettingsUpdate = config.provider_update().unwrap();
        assert!(update.validate().is_ok());
        let merged = update.merge_provider(&stockroom_core::ProviderConfig::default());
        assert_eq!(merged.base_url, "https://x.example.co/rest/v1");
        assert_eq!(merged.api_key, "anon-key");
    }

    #[test]
    fn test_empty_provider_section_seeds_nothing() {
        assert!(SyncConfig::default().provider_update().is_none());
    }
}
