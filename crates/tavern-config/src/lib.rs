// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the tavern broker.
//!
//! This crate provides [`BrokerConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, merging overlays, and
//! producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A liveness timeout is unusually large.
    LargeTimeout {
        /// Field name.
        field: String,
        /// Timeout value in seconds.
        secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeTimeout { field, secs } => {
                write!(f, "'{field}' is unusually large ({secs}s)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the session broker.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct BrokerConfig {
    /// Socket address the server binds to.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Directory for persisted per-table JSON files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Directory for the content-addressed asset cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,

    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Base URL of the blob store used for presigned asset transfers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_base_url: Option<String>,

    /// Liveness and persistence timing knobs.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Asset cache retention policy.
    #[serde(default)]
    pub cache: CachePolicy,
}

fn default_bind() -> String {
    "127.0.0.1:8780".into()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data_dir: None,
            cache_dir: None,
            log_level: Some("info".into()),
            blob_base_url: None,
            timing: TimingConfig::default(),
            cache: CachePolicy::default(),
        }
    }
}

/// Keepalive, reaping, and save-debounce intervals.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TimingConfig {
    /// Interval between server keepalive pings, in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Interval between reaper sweeps, in seconds.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Age of `last_ping` beyond which a client is considered dead.
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,

    /// Debounce window for batched per-table saves, in milliseconds.
    #[serde(default = "default_save_debounce")]
    pub save_debounce_ms: u64,

    /// Lifetime of a presigned upload/download URL, in seconds.
    #[serde(default = "default_presign_expiry")]
    pub presign_expiry_secs: u64,
}

fn default_keepalive() -> u64 {
    20
}
fn default_reap_interval() -> u64 {
    30
}
fn default_client_timeout() -> u64 {
    60
}
fn default_save_debounce() -> u64 {
    300
}
fn default_presign_expiry() -> u64 {
    900
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive(),
            reap_interval_secs: default_reap_interval(),
            client_timeout_secs: default_client_timeout(),
            save_debounce_ms: default_save_debounce(),
            presign_expiry_secs: default_presign_expiry(),
        }
    }
}

/// Retention policy for the local asset cache.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CachePolicy {
    /// Entries older than this many days are removed first.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,

    /// Total cache size budget in mebibytes.
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
}

fn default_max_age_days() -> u64 {
    30
}
fn default_max_size_mb() -> u64 {
    512
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            max_size_mb: default_max_size_mb(),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Threshold above which a client timeout generates a warning.
const LARGE_TIMEOUT_THRESHOLD: u64 = 600;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`BrokerConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`BrokerConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<BrokerConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => BrokerConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`BrokerConfig`].
pub fn parse_toml(content: &str) -> Result<BrokerConfig, ConfigError> {
    toml::from_str::<BrokerConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `TAVERN_BIND`
/// - `TAVERN_LOG_LEVEL`
/// - `TAVERN_DATA_DIR`
/// - `TAVERN_CACHE_DIR`
/// - `TAVERN_BLOB_BASE_URL`
pub fn apply_env_overrides(config: &mut BrokerConfig) {
    if let Ok(val) = std::env::var("TAVERN_BIND") {
        config.bind = val;
    }
    if let Ok(val) = std::env::var("TAVERN_LOG_LEVEL") {
        config.log_level = Some(val);
    }
    if let Ok(val) = std::env::var("TAVERN_DATA_DIR") {
        config.data_dir = Some(val);
    }
    if let Ok(val) = std::env::var("TAVERN_CACHE_DIR") {
        config.cache_dir = Some(val);
    }
    if let Ok(val) = std::env::var("TAVERN_BLOB_BASE_URL") {
        config.blob_base_url = Some(val);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (bad log level, zero intervals, a reaper that can never fire
/// before the client timeout) are returned as a
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &BrokerConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.bind.trim().is_empty() {
        errors.push("bind address must not be empty".into());
    }

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    let t = &config.timing;
    if t.keepalive_secs == 0 {
        errors.push("timing.keepalive_secs must be > 0".into());
    }
    if t.reap_interval_secs == 0 {
        errors.push("timing.reap_interval_secs must be > 0".into());
    }
    if t.client_timeout_secs <= t.keepalive_secs {
        errors.push(format!(
            "timing.client_timeout_secs ({}) must exceed keepalive_secs ({})",
            t.client_timeout_secs, t.keepalive_secs
        ));
    } else if t.client_timeout_secs > LARGE_TIMEOUT_THRESHOLD {
        warnings.push(ConfigWarning::LargeTimeout {
            field: "timing.client_timeout_secs".into(),
            secs: t.client_timeout_secs,
        });
    }
    if t.presign_expiry_secs == 0 {
        errors.push("timing.presign_expiry_secs must be > 0".into());
    }

    if config.cache.max_size_mb == 0 {
        errors.push("cache.max_size_mb must be > 0".into());
    }

    // Advisory: missing optional fields.
    if config.data_dir.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "data_dir".into(),
            hint: "tables will not survive a restart".into(),
        });
    }
    if config.blob_base_url.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "blob_base_url".into(),
            hint: "asset transfers will use the local development signer".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations.  Values in `overlay` take precedence over `base`.
pub fn merge_configs(base: BrokerConfig, overlay: BrokerConfig) -> BrokerConfig {
    BrokerConfig {
        bind: if overlay.bind == default_bind() {
            base.bind
        } else {
            overlay.bind
        },
        data_dir: overlay.data_dir.or(base.data_dir),
        cache_dir: overlay.cache_dir.or(base.cache_dir),
        log_level: overlay.log_level.or(base.log_level),
        blob_base_url: overlay.blob_base_url.or(base.blob_base_url),
        timing: overlay.timing,
        cache: overlay.cache,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = BrokerConfig::default();
        let warnings = validate_config(&config).unwrap();
        // Missing data_dir and blob_base_url are advisory only.
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn parse_minimal_toml() {
        let config = parse_toml("bind = \"0.0.0.0:9000\"").unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.timing.keepalive_secs, 20);
        assert_eq!(config.cache.max_size_mb, 512);
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
            bind = "0.0.0.0:9000"
            data_dir = "/var/lib/tavern/tables"
            cache_dir = "/var/cache/tavern"
            log_level = "debug"
            blob_base_url = "https://blobs.example.net"

            [timing]
            keepalive_secs = 10
            reap_interval_secs = 15
            client_timeout_secs = 45
            save_debounce_ms = 500
            presign_expiry_secs = 600

            [cache]
            max_age_days = 7
            max_size_mb = 128
        "#;
        let config = parse_toml(toml).unwrap();
        assert_eq!(config.timing.client_timeout_secs, 45);
        assert_eq!(config.cache.max_age_days, 7);
        assert!(validate_config(&config).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_log_level() {
        let mut config = BrokerConfig::default();
        config.log_level = Some("loud".into());
        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("log_level")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_timeout_not_exceeding_keepalive() {
        let mut config = BrokerConfig::default();
        config.timing.keepalive_secs = 60;
        config.timing.client_timeout_secs = 60;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn warns_on_huge_client_timeout() {
        let mut config = BrokerConfig::default();
        config.timing.client_timeout_secs = 7200;
        let warnings = validate_config(&config).unwrap();
        assert!(warnings.iter().any(|w| matches!(
            w,
            ConfigWarning::LargeTimeout { secs: 7200, .. }
        )));
    }

    #[test]
    fn load_from_file_and_missing_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "bind = \"127.0.0.1:1234\"").unwrap();
        let config = load_config(Some(f.path())).unwrap();
        assert_eq!(config.bind, "127.0.0.1:1234");

        let missing = load_config(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn merge_prefers_overlay() {
        let base = BrokerConfig {
            data_dir: Some("/base/data".into()),
            log_level: Some("warn".into()),
            ..BrokerConfig::default()
        };
        let overlay = BrokerConfig {
            data_dir: Some("/overlay/data".into()),
            ..BrokerConfig::default()
        };
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.data_dir.as_deref(), Some("/overlay/data"));
        // The overlay's default log_level is Some("info"), so it wins.
        assert_eq!(merged.log_level.as_deref(), Some("info"));
    }
}
