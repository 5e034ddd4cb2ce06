// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for oc-memory.
//!
//! This crate provides [`MemoryConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, merging overlays, and
//! producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

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
    /// The extractor dispatcher URL's host is not on the SSRF allow-list.
    DispatcherHostNotAllowed {
        /// The offending host.
        host: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            Self::DispatcherHostNotAllowed { host } => {
                write!(f, "dispatcher host '{host}' is not on the extractor allow-list")
            }
        }
    }
}

/// Hosts the extractor's dispatcher URL is allowed to target, per the SSRF
/// protection requirement.
pub const ALLOWED_EXTRACTOR_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Suffix that, combined with [`ALLOWED_EXTRACTOR_HOSTS`], completes the
/// dispatcher allow-list (`*.opencode.ai`).
pub const ALLOWED_EXTRACTOR_HOST_SUFFIX: &str = ".opencode.ai";

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Whether `host` is on the extractor dispatcher's SSRF allow-list.
#[must_use]
pub fn is_allowed_extractor_host(host: &str) -> bool {
    ALLOWED_EXTRACTOR_HOSTS.contains(&host) || host.ends_with(ALLOWED_EXTRACTOR_HOST_SUFFIX)
}

/// Top-level runtime configuration for oc-memory.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Override for install discovery, normally derived from `~/.oc`.
    /// Mirrors `CLAUDE_MEM_GLOBAL_PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_path: Option<String>,

    /// Enables verbose debug logging. Mirrors `CLAUDE_MEM_DEBUG`.
    #[serde(default)]
    pub debug: bool,

    /// Project default for whether manifest injection runs at all. `None`
    /// means "use the per-project default"; `CLAUDE_MEM_INJECTION_ENABLED`
    /// overrides this unconditionally when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_enabled: Option<bool>,

    /// Log level override (`"debug"`, `"info"`, `"warn"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Extractor auth token. Mirrors `OPENCODE_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor_api_key: Option<String>,

    /// Extractor dispatcher endpoint, validated against the SSRF allow-list.
    /// Mirrors `OPENCODE_DISPATCHER_URL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor_dispatcher_url: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            global_path: None,
            debug: false,
            injection_enabled: None,
            log_level: Some("info".into()),
            extractor_api_key: None,
            extractor_dispatcher_url: None,
        }
    }
}

impl MemoryConfig {
    /// Resolve the effective `~/.oc` root: `global_path` if set, else
    /// `dirs::home_dir()/.oc`.
    #[must_use]
    pub fn global_root(&self) -> PathBuf {
        match &self.global_path {
            Some(p) => PathBuf::from(p),
            None => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".oc"),
        }
    }
}

/// Load a [`MemoryConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`MemoryConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
pub fn load_config(path: Option<&Path>) -> Result<MemoryConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => MemoryConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`MemoryConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] if the content is not valid TOML or
/// doesn't match the expected shape.
pub fn parse_toml(content: &str) -> Result<MemoryConfig, ConfigError> {
    toml::from_str::<MemoryConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply environment variable overrides.
///
/// Recognised variables: `CLAUDE_MEM_GLOBAL_PATH`, `CLAUDE_MEM_DEBUG`,
/// `CLAUDE_MEM_INJECTION_ENABLED`, `OPENCODE_API_KEY`,
/// `OPENCODE_DISPATCHER_URL`.
pub fn apply_env_overrides(config: &mut MemoryConfig) {
    if let Ok(val) = std::env::var("CLAUDE_MEM_GLOBAL_PATH") {
        config.global_path = Some(val);
    }
    if let Ok(val) = std::env::var("CLAUDE_MEM_DEBUG") {
        config.debug = val == "true" || val == "1";
    }
    if let Ok(val) = std::env::var("CLAUDE_MEM_INJECTION_ENABLED") {
        config.injection_enabled = Some(val == "true");
    }
    if let Ok(val) = std::env::var("OPENCODE_API_KEY") {
        config.extractor_api_key = Some(val);
    }
    if let Ok(val) = std::env::var("OPENCODE_DISPATCHER_URL") {
        config.extractor_dispatcher_url = Some(val);
    }
}

/// Detect which agent host environment this process is running under, per
/// `OPENCODE_ACTIVE`/`CLAUDE_CODE_SESSION`/`CLAUDE_SESSION_ID`.
#[must_use]
pub fn detect_host_source() -> Option<&'static str> {
    if std::env::var_os("OPENCODE_ACTIVE").is_some() {
        Some("opencode")
    } else if std::env::var_os("CLAUDE_CODE_SESSION").is_some()
        || std::env::var_os("CLAUDE_SESSION_ID").is_some()
    {
        Some("claude-code")
    } else {
        None
    }
}

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (invalid log level, disallowed dispatcher host) are returned
/// as a [`ConfigError::ValidationError`]; soft issues come back as warnings.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] if a hard constraint is violated.
pub fn validate_config(config: &MemoryConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    if let Some(ref url) = config.extractor_dispatcher_url {
        match url::host(url) {
            Some(host) if is_allowed_extractor_host(&host) => {}
            Some(host) => {
                warnings.push(ConfigWarning::DispatcherHostNotAllowed { host });
            }
            None => errors.push(format!("extractor_dispatcher_url '{url}' has no host")),
        }
    } else {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "extractor_dispatcher_url".into(),
            hint: "the extractor's direct-model-API strategy will be unavailable".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

/// Minimal host-extraction for the narrow `scheme://host[:port]/...` shapes
/// the dispatcher URL can take; not a general URL parser.
mod url {
    pub fn host(raw: &str) -> Option<String> {
        let after_scheme = raw.split_once("://").map_or(raw, |(_, rest)| rest);
        let host_port = after_scheme.split(['/', '?', '#']).next()?;
        let host = host_port.rsplit_once('@').map_or(host_port, |(_, h)| h);
        let host = host.split(':').next()?;
        if host.is_empty() {
            None
        } else {
            Some(host.to_string())
        }
    }
}

/// Merge two configurations. Values in `overlay` take precedence over `base`.
#[must_use]
pub fn merge_configs(base: MemoryConfig, overlay: MemoryConfig) -> MemoryConfig {
    MemoryConfig {
        global_path: overlay.global_path.or(base.global_path),
        debug: overlay.debug || base.debug,
        injection_enabled: overlay.injection_enabled.or(base.injection_enabled),
        log_level: overlay.log_level.or(base.log_level),
        extractor_api_key: overlay.extractor_api_key.or(base.extractor_api_key),
        extractor_dispatcher_url: overlay
            .extractor_dispatcher_url
            .or(base.extractor_dispatcher_url),
    }
}
