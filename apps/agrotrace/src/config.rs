//! # Configuration
//!
//! Optional TOML configuration file plus the `AGROTRACE_*` environment
//! variables read by the HTTP layer.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [engine]
//! harvest_lookback_days = 365
//! tie_break = "latest_inserted"
//! region_timeout_ms = 250
//!
//! [trigger]
//! queue_capacity = 1024
//! max_attempts = 5
//! retry_backoff_ms = 100
//!
//! [regions]
//! farmer-1 = "Kenya"
//!
//! [[tokens]]
//! token = "secret"
//! user = "farmer-1"
//!
//! [profiles.farmer-1]
//! practices = ["cover cropping"]
//! certifications = ["organic"]
//! ```

use agrotrace_core::TieBreak;
use agrotrace_core::TraceError;
use agrotrace_core::primitives::{DEFAULT_HARVEST_LOOKBACK_DAYS, MAX_HARVEST_LOOKBACK_DAYS};
use chrono::TimeDelta;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Maximum configuration file size (1 MiB).
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

/// Longest base delay between calculation redeliveries (one minute).
pub const MAX_RETRY_BACKOFF_MS: u64 = 60_000;

// =============================================================================
// SECTIONS
// =============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub trigger: TriggerConfig,
    /// Actor VTI id -> region name.
    pub regions: BTreeMap<String, String>,
    pub tokens: Vec<TokenConfig>,
    /// User VTI id -> externally owned profile data.
    pub profiles: BTreeMap<String, ProfileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub harvest_lookback_days: i64,
    pub tie_break: TieBreak,
    pub region_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            harvest_lookback_days: DEFAULT_HARVEST_LOOKBACK_DAYS,
            tie_break: TieBreak::default(),
            region_timeout_ms: 250,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn harvest_lookback(&self) -> TimeDelta {
        TimeDelta::try_days(self.harvest_lookback_days.clamp(0, MAX_HARVEST_LOOKBACK_DAYS))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn region_timeout(&self) -> Duration {
        Duration::from_millis(self.region_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TriggerConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 5,
            retry_backoff_ms: 100,
        }
    }
}

impl TriggerConfig {
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Bearer token issued to a user.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    pub token: String,
    pub user: String,
}

/// Practices and certifications shown on a user's dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    pub practices: Vec<String>,
    pub certifications: Vec<String>,
}

// =============================================================================
// LOADING
// =============================================================================

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, TraceError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| TraceError::Serialization(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file.
    pub fn load(path: &Path) -> Result<Self, TraceError> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| TraceError::Storage(format!("Cannot read {}: {e}", path.display())))?;
        if metadata.len() > MAX_CONFIG_SIZE {
            return Err(TraceError::validation(
                "config",
                format!("file exceeds {MAX_CONFIG_SIZE} bytes"),
            ));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| TraceError::Storage(format!("Cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Load `path` if given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, TraceError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    fn validate(&self) -> Result<(), TraceError> {
        if !(1..=MAX_HARVEST_LOOKBACK_DAYS).contains(&self.engine.harvest_lookback_days) {
            return Err(TraceError::validation(
                "engine.harvest_lookback_days",
                format!("must be between 1 and {MAX_HARVEST_LOOKBACK_DAYS}"),
            ));
        }
        if self.trigger.queue_capacity == 0 {
            return Err(TraceError::validation(
                "trigger.queue_capacity",
                "must be positive",
            ));
        }
        if self.trigger.max_attempts == 0 {
            return Err(TraceError::validation(
                "trigger.max_attempts",
                "must be at least 1",
            ));
        }
        if self.trigger.retry_backoff_ms > MAX_RETRY_BACKOFF_MS {
            return Err(TraceError::validation(
                "trigger.retry_backoff_ms",
                format!("must be at most {MAX_RETRY_BACKOFF_MS}"),
            ));
        }
        if self.tokens.iter().any(|t| t.token.is_empty()) {
            return Err(TraceError::validation("tokens.token", "must not be empty"));
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
