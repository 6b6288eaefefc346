//! # Settings Validation
//!
//! Partial updates to the user-editable sync settings.
//!
//! ## Credential Rule
//! A blank or placeholder credential in an update (an empty field, a masked
//! `"********"` echoed back by the UI, a template value such as
//! `"your-api-key"`) never overwrites a credential that is already stored.
//!
//! ## Usage
//! ```rust
//! use stockroom_core::settings::SettingsUpdate;
//!
//! let update = SettingsUpdate {
//!     interval_minutes: Some(30),
//!     ..Default::default()
//! };
//! update.validate().unwrap();
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{ConflictStrategy, ProviderConfig};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

pub const MIN_INTERVAL_MINUTES: i64 = 1;
pub const MAX_INTERVAL_MINUTES: i64 = 24 * 60;

const PLACEHOLDER_KEYS: &[&str] = &[
    "your-api-key",
    "your_api_key",
    "your-anon-key",
    "changeme",
    "<api-key>",
];

/// A partial settings update; `None` leaves a field as stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<i64>,
    pub provider_url: Option<String>,
    pub provider_key: Option<String>,
    pub access_token: Option<String>,
    pub conflict_strategy: Option<String>,
}

impl SettingsUpdate {
    /// Validates every field that is present.
    pub fn validate(&self) -> ValidationResult<()> {
        if let Some(minutes) = self.interval_minutes {
            validate_interval(minutes)?;
        }
        if let Some(url) = &self.provider_url {
            validate_provider_url(url)?;
        }
        if let Some(strategy) = &self.conflict_strategy {
            parse_strategy(strategy)?;
        }
        Ok(())
    }

    /// Parsed conflict strategy, if present.
    pub fn strategy(&self) -> ValidationResult<Option<ConflictStrategy>> {
        self.conflict_strategy.as_deref().map(parse_strategy).transpose()
    }

    /// Provider config with this update's fields applied over `current`.
    pub fn merge_provider(&self, current: &ProviderConfig) -> ProviderConfig {
        let mut merged = current.clone();
        if let Some(url) = &self.provider_url {
            merged.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(key) = self.provider_key.as_deref() {
            if !is_placeholder_credential(key) {
                merged.api_key = key.trim().to_string();
            }
        }
        if let Some(token) = self.access_token.as_deref() {
            if !is_placeholder_credential(token) {
                merged.access_token = Some(token.trim().to_string());
            }
        }
        merged
    }
}

/// Validates the sync interval in minutes.
pub fn validate_interval(minutes: i64) -> ValidationResult<()> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&minutes) {
        return Err(ValidationError::OutOfRange {
            field: "sync_interval_minutes".to_string(),
            min: MIN_INTERVAL_MINUTES,
            max: MAX_INTERVAL_MINUTES,
        });
    }
    Ok(())
}

/// Validates a provider base URL: `http(s)://host[...]`.
pub fn validate_provider_url(url: &str) -> ValidationResult<()> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ValidationError::Required {
            field: "provider_url".to_string(),
        });
    }
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| ValidationError::InvalidFormat {
            field: "provider_url".to_string(),
            reason: "must start with http:// or https://".to_string(),
        })?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(ValidationError::InvalidFormat {
            field: "provider_url".to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(())
}

fn parse_strategy(value: &str) -> ValidationResult<ConflictStrategy> {
    value.parse().map_err(|_| ValidationError::NotAllowed {
        field: "conflict_strategy".to_string(),
        allowed: ConflictStrategy::VALUES.iter().map(|s| s.to_string()).collect(),
    })
}

/// True for empty, masked (`****`) or template credentials.
pub fn is_placeholder_credential(value: &str) -> bool {
    let value = value.trim();
    value.is_empty()
        || value.chars().all(|c| c == '*' || c == '•')
        || PLACEHOLDER_KEYS
            .iter()
            .any(|p| value.eq_ignore_ascii_case(p))
}
