// crates/o11y-sandbox/src/config.rs
// ============================================================================
// Module: Sandbox Configuration
// Description: Worker binding configuration and its validated form.
// Purpose: Refuse to start a worker with missing or malformed endpoints.
// Dependencies: serde, thiserror, toml, url
// ============================================================================

//! ## Overview
//! [`SandboxConfig`] is the raw, possibly incomplete record a scenario builds
//! (or loads from TOML). [`SandboxConfig::validate`] turns it into
//! [`SandboxBindings`], the only form a launcher accepts.
//! Invariants:
//! - Platform API URL, telemetry URL and credential are present and non-empty.
//! - Both URLs are absolute `http`/`https` URLs with a host.
//! - Extra bindings never shadow the reserved binding names.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Binding carrying the platform API base URL.
pub const PLATFORM_API_URL_BINDING: &str = "CLOUDFLARE_API_URL";
/// Binding carrying the telemetry ingestion URL.
pub const METRICS_URL_BINDING: &str = "METRICS_URL";
/// Binding carrying the platform API credential.
pub const API_KEY_BINDING: &str = "CLOUDFLARE_API_KEY";
/// Path requested to run one scheduled execution.
pub const DEFAULT_SCHEDULED_PATH: &str = "/cdn-cgi/mf/scheduled";
/// Binding names reserved for the required settings.
const RESERVED_BINDINGS: [&str; 4] =
    [PLATFORM_API_URL_BINDING, METRICS_URL_BINDING, API_KEY_BINDING, "PORT"];
/// Maximum number of extra bindings.
const MAX_EXTRA_BINDINGS: usize = 64;
/// Maximum length of a binding name.
const MAX_BINDING_NAME_LENGTH: usize = 128;
/// Maximum length of a binding value.
const MAX_BINDING_VALUE_LENGTH: usize = 4096;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while validating sandbox configuration.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// TOML parsing failed.
    #[error("sandbox config parse error: {0}")]
    Parse(String),
    /// A required setting is absent.
    #[error("missing sandbox setting: {0}")]
    Missing(&'static str),
    /// A required setting is blank.
    #[error("sandbox setting {0} must be non-empty")]
    Empty(&'static str),
    /// A URL setting is not an absolute http(s) URL.
    #[error("sandbox setting {field} is not an absolute http(s) url: {reason}")]
    InvalidUrl {
        /// Setting name.
        field: &'static str,
        /// Parser or scheme error text.
        reason: String,
    },
    /// An extra binding is unusable.
    #[error("invalid sandbox binding: {0}")]
    InvalidBinding(String),
}

// ============================================================================
// SECTION: Raw Configuration
// ============================================================================

/// Sandbox settings as supplied by a scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Platform API base URL handed to the worker.
    #[serde(default)]
    pub platform_api_url: Option<String>,
    /// Telemetry ingestion URL handed to the worker.
    #[serde(default)]
    pub metrics_url: Option<String>,
    /// Platform API credential handed to the worker.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Additional worker bindings.
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
    /// Trigger path override.
    #[serde(default)]
    pub scheduled_path: Option<String>,
}

impl SandboxConfig {
    /// Creates a config with the three required settings.
    #[must_use]
    pub fn new(
        platform_api_url: impl Into<String>,
        metrics_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            platform_api_url: Some(platform_api_url.into()),
            metrics_url: Some(metrics_url.into()),
            api_key: Some(api_key.into()),
            bindings: BTreeMap::new(),
            scheduled_path: None,
        }
    }

    /// Adds an extra binding.
    #[must_use]
    pub fn with_binding(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    /// Parses a config from TOML text without validating it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Parse`] when the text is not valid TOML
    /// for this shape.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(content).map_err(|err| ConfigurationError::Parse(err.to_string()))
    }

    /// Validates the config and produces worker bindings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] when a required setting is missing,
    /// blank or malformed, or an extra binding is unusable.
    pub fn validate(&self) -> Result<SandboxBindings, ConfigurationError> {
        let platform_api_url =
            required_url(PLATFORM_API_URL_BINDING, self.platform_api_url.as_deref())?;
        let metrics_url = required_url(METRICS_URL_BINDING, self.metrics_url.as_deref())?;
        let api_key = required_text(API_KEY_BINDING, self.api_key.as_deref())?.to_string();
        if self.bindings.len() > MAX_EXTRA_BINDINGS {
            return Err(ConfigurationError::InvalidBinding("too many extra bindings".to_string()));
        }
        for (name, value) in &self.bindings {
            validate_binding(name, value)?;
        }
        let scheduled_path = match self.scheduled_path.as_deref().map(str::trim) {
            None => DEFAULT_SCHEDULED_PATH.to_string(),
            Some(path) if path.starts_with('/') => path.to_string(),
            Some(_) => {
                return Err(ConfigurationError::InvalidBinding(
                    "scheduled_path must start with '/'".to_string(),
                ));
            }
        };
        Ok(SandboxBindings {
            platform_api_url,
            metrics_url,
            api_key,
            extra: self.bindings.clone(),
            scheduled_path,
        })
    }
}

// ============================================================================
// SECTION: Validated Bindings
// ============================================================================

/// Validated worker bindings.
#[derive(Clone, PartialEq, Eq)]
pub struct SandboxBindings {
    /// Platform API base URL.
    platform_api_url: Url,
    /// Telemetry ingestion URL.
    metrics_url: Url,
    /// Platform API credential.
    api_key: String,
    /// Additional bindings.
    extra: BTreeMap<String, String>,
    /// Trigger path.
    scheduled_path: String,
}

impl fmt::Debug for SandboxBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxBindings")
            .field("platform_api_url", &self.platform_api_url.as_str())
            .field("metrics_url", &self.metrics_url.as_str())
            .field("api_key", &"<redacted>")
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .field("scheduled_path", &self.scheduled_path)
            .finish()
    }
}

impl SandboxBindings {
    /// Returns the platform API base URL.
    #[must_use]
    pub const fn platform_api_url(&self) -> &Url {
        &self.platform_api_url
    }

    /// Returns the telemetry ingestion URL.
    #[must_use]
    pub const fn metrics_url(&self) -> &Url {
        &self.metrics_url
    }

    /// Returns the platform API credential.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Returns the trigger path.
    #[must_use]
    pub fn scheduled_path(&self) -> &str {
        &self.scheduled_path
    }

    /// Returns every binding as `(name, value)` pairs: the reserved bindings
    /// first, then extras in name order.
    #[must_use]
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(3 + self.extra.len());
        env.push((PLATFORM_API_URL_BINDING.to_string(), self.platform_api_url.to_string()));
        env.push((METRICS_URL_BINDING.to_string(), self.metrics_url.to_string()));
        env.push((API_KEY_BINDING.to_string(), self.api_key.clone()));
        env.extend(self.extra.iter().map(|(name, value)| (name.clone(), value.clone())));
        env
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns a trimmed required setting.
fn required_text<'a>(
    field: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, ConfigurationError> {
    let value = value.ok_or(ConfigurationError::Missing(field))?.trim();
    if value.is_empty() {
        return Err(ConfigurationError::Empty(field));
    }
    if value.len() > MAX_BINDING_VALUE_LENGTH {
        return Err(ConfigurationError::InvalidBinding(format!("{field} exceeds max length")));
    }
    Ok(value)
}

/// Parses a required absolute http(s) URL.
fn required_url(field: &'static str, value: Option<&str>) -> Result<Url, ConfigurationError> {
    let text = required_text(field, value)?;
    let url = Url::parse(text).map_err(|err| ConfigurationError::InvalidUrl {
        field,
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigurationError::InvalidUrl {
            field,
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ConfigurationError::InvalidUrl {
            field,
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

/// Validates one extra binding.
fn validate_binding(name: &str, value: &str) -> Result<(), ConfigurationError> {
    if name.is_empty() || name.len() > MAX_BINDING_NAME_LENGTH {
        return Err(ConfigurationError::InvalidBinding(format!(
            "binding name {name:?} must be 1 to {MAX_BINDING_NAME_LENGTH} bytes"
        )));
    }
    if !name.bytes().all(|byte| byte.is_ascii_uppercase() || byte.is_ascii_digit() || byte == b'_')
    {
        return Err(ConfigurationError::InvalidBinding(format!(
            "binding name {name} must use A-Z, 0-9 and _"
        )));
    }
    if RESERVED_BINDINGS.contains(&name) {
        return Err(ConfigurationError::InvalidBinding(format!("binding name {name} is reserved")));
    }
    if value.len() > MAX_BINDING_VALUE_LENGTH {
        return Err(ConfigurationError::InvalidBinding(format!("binding {name} exceeds max length")));
    }
    Ok(())
}
