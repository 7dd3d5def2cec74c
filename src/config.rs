//! Service configuration.
//!
//! Configuration is a flat key/value map, normally sourced from
//! environment variables (a `.env` file is honored for local
//! development).

use crate::errors::{KairosError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

const ENVIRONMENT_PREFIX: &str = "RESOURCE_ENVIRONMENT_";
const SMTP_PREFIX: &str = "SMTP_";

fn default_cache_timeout() -> u64 {
    if cfg!(debug_assertions) {
        20
    } else {
        300
    }
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    20
}

fn default_write_timeout() -> u64 {
    5
}

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity provider customer identifier.
    pub customer_id: String,

    /// Domain under which JIT group emails are created.
    pub domain: String,

    /// Source locator per environment name (file path or secret name).
    #[serde(default)]
    pub environments: BTreeMap<String, String>,

    /// Environment cache TTL in seconds.
    #[serde(default = "default_cache_timeout")]
    pub cache_timeout_seconds: u64,

    /// Connect timeout for outbound calls, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Read timeout for outbound calls, in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,

    /// Write timeout for outbound calls, in seconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,

    /// Options handed through to the mail notifier, keyed without the
    /// `SMTP_` prefix.
    #[serde(default, skip_serializing)]
    pub smtp_options: BTreeMap<String, String>,
}

impl AppConfig {
    /// Creates configuration from environment variables.
    ///
    /// Required:
    /// - `RESOURCE_CUSTOMER_ID`: IdP customer identifier
    /// - `RESOURCE_DOMAIN`: domain for JIT group emails
    ///
    /// Optional:
    /// - `RESOURCE_ENVIRONMENT_<name>`: source locator per environment
    ///   (`<name>` is lowercased; underscores become hyphens)
    /// - `RESOURCE_CACHE_TIMEOUT`: environment cache TTL in seconds
    /// - `BACKEND_CONNECT_TIMEOUT`, `BACKEND_READ_TIMEOUT`,
    ///   `BACKEND_WRITE_TIMEOUT`: per-call timeouts in seconds
    /// - `SMTP_*`: notifier options, passed through
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_map(env::vars().collect())
    }

    /// Creates configuration from an explicit key/value map.
    pub fn from_map(options: BTreeMap<String, String>) -> Result<Self> {
        let required = |key: &str| {
            options
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| KairosError::Configuration(format!("{key} not set")))
        };
        let seconds = |key: &str, default: u64| {
            options
                .get(key)
                .map(|v| {
                    v.trim().parse::<u64>().map_err(|_| {
                        KairosError::Configuration(format!("{key}: '{v}' is not a number"))
                    })
                })
                .transpose()
                .map(|v| v.unwrap_or(default))
        };

        let customer_id = required("RESOURCE_CUSTOMER_ID")?;
        let domain = required("RESOURCE_DOMAIN")?;

        let mut environments = BTreeMap::new();
        let mut smtp_options = BTreeMap::new();
        for (key, value) in &options {
            if let Some(name) = key.strip_prefix(ENVIRONMENT_PREFIX) {
                let name = name.to_ascii_lowercase().replace('_', "-");
                environments.insert(name, value.clone());
            } else if let Some(option) = key.strip_prefix(SMTP_PREFIX) {
                smtp_options.insert(option.to_ascii_lowercase(), value.clone());
            }
        }

        let config = Self {
            customer_id,
            domain,
            environments,
            cache_timeout_seconds: seconds("RESOURCE_CACHE_TIMEOUT", default_cache_timeout())?,
            connect_timeout_seconds: seconds("BACKEND_CONNECT_TIMEOUT", default_connect_timeout())?,
            read_timeout_seconds: seconds("BACKEND_READ_TIMEOUT", default_read_timeout())?,
            write_timeout_seconds: seconds("BACKEND_WRITE_TIMEOUT", default_write_timeout())?,
            smtp_options,
        };
        config.validate()?;
        Ok(config)
    }

    /// Returns the environment cache TTL as a Duration.
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_timeout_seconds)
    }

    /// Returns the connect timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Returns the read timeout as a Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    /// Returns the write timeout as a Duration.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.customer_id.is_empty() {
            return Err(KairosError::Configuration(
                "Customer id cannot be empty".into(),
            ));
        }

        if !self.domain.contains('.') || self.domain.contains('@') {
            return Err(KairosError::Configuration(format!(
                "'{}' is not a valid domain",
                self.domain
            )));
        }

        if self.cache_timeout_seconds == 0 {
            return Err(KairosError::Configuration(
                "Cache timeout must be greater than 0".into(),
            ));
        }

        for name in self.environments.keys() {
            if name.is_empty() {
                return Err(KairosError::Configuration(
                    "Environment name cannot be empty".into(),
                ));
            }
        }

        Ok(())
    }
}
