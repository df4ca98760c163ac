//! Flat environment configuration for the proxy.
//!
//! Configuration can be set via environment variables:
//! - `LLM_API_BASE` - Optional. Legacy upstream base URL. Defaults to
//!   `https://api.anthropic.com`.
//! - `LLM_API_KEY` - Optional. Legacy upstream credential. A warning is
//!   logged (not a hard failure) if unset, since the smart router may
//!   supply its own per-provider credentials instead.
//! - `LLM_API_PROVIDER` - Optional. `anthropic` or `openai`. Defaults to
//!   `anthropic`.
//! - `GUARD_URL` - Optional. External content-guard endpoint.
//! - `GUARD_ENABLED` - Optional. Defaults to `false`.
//! - `GUARD_THRESHOLD` - Optional. Defaults to `0.8`.
//! - `GUARD_STRIP_HIDDEN_UNICODE` - Optional. `true` strips hidden Unicode,
//!   `false` blocks on detection. Defaults to `true`.
//! - `SMART_ROUTER_ENABLED` - Optional. Defaults to `false`.
//! - `ROUTER_CONFIG_PATH` - Required when the smart router is enabled.
//! - `HOST` - Optional. Server bind host. Defaults to `0.0.0.0`.
//! - `PORT` - Optional. Server bind port. Defaults to `8080`.

use thiserror::Error;

use crate::guard::GuardMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Legacy (non-routed) upstream configuration.
#[derive(Debug, Clone)]
pub struct LegacyConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub provider: String,
}

/// Guard stage configuration.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub url: Option<String>,
    pub enabled: bool,
    pub threshold: f64,
    pub hidden_unicode_mode: GuardMode,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub legacy: LegacyConfig,
    pub guard: GuardConfig,
    pub router_enabled: bool,
    pub router_config_path: Option<String>,
    pub host: String,
    pub port: u16,
}

fn env_flag(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue(name.to_string(), other.to_string())),
        },
    }
}

impl AppConfig {
    /// Loads configuration from the process environment. Returns an error
    /// only for malformed values; an unset `LLM_API_KEY` is allowed through
    /// (the caller logs a warning), since a configured smart router can
    /// serve every tier without it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let legacy = LegacyConfig {
            api_base: std::env::var("LLM_API_BASE")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            api_key: std::env::var("LLM_API_KEY").ok(),
            provider: std::env::var("LLM_API_PROVIDER").unwrap_or_else(|_| "anthropic".to_string()),
        };

        let guard_enabled = env_flag("GUARD_ENABLED", false)?;
        let strip_hidden_unicode = env_flag("GUARD_STRIP_HIDDEN_UNICODE", true)?;
        let guard_threshold = match std::env::var("GUARD_THRESHOLD") {
            Err(_) => 0.8,
            Ok(v) => v
                .parse()
                .map_err(|e| ConfigError::InvalidValue("GUARD_THRESHOLD".to_string(), format!("{e}")))?,
        };
        let guard = GuardConfig {
            url: std::env::var("GUARD_URL").ok(),
            enabled: guard_enabled,
            threshold: guard_threshold,
            hidden_unicode_mode: if strip_hidden_unicode {
                GuardMode::Strip
            } else {
                GuardMode::Block
            },
        };

        let router_enabled = env_flag("SMART_ROUTER_ENABLED", false)?;
        let router_config_path = std::env::var("ROUTER_CONFIG_PATH").ok();
        if router_enabled && router_config_path.is_none() {
            return Err(ConfigError::MissingEnvVar("ROUTER_CONFIG_PATH".to_string()));
        }

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{e}")))?;

        Ok(Self {
            legacy,
            guard,
            router_enabled,
            router_config_path,
            host,
            port,
        })
    }
}
