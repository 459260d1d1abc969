//! API configuration
//!
//! # Example
//!
//! ```
//! use api_request_core::config::ApiConfig;
//!
//! let config = ApiConfig::builder()
//!     .endpoint("https://api.example.com/v2")
//!     .language("de")
//!     .api_version(20240130)
//!     .build();
//!
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default API endpoint
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080/api";

/// Default locale sent as `Accept-Language`
pub const DEFAULT_LANGUAGE: &str = "en";

/// Default protocol version sent as `x-api-version`
pub const DEFAULT_API_VERSION: u32 = 1;

/// Default transport timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed
    #[error("Invalid value for {var}: {value}")]
    InvalidVar {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Settings shared by every request issued through an API context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL that request targets are joined onto
    pub endpoint: String,
    /// Locale sent as `Accept-Language`
    pub language: String,
    /// Protocol version sent as `x-api-version`
    pub api_version: u32,
    /// Transport timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            api_version: DEFAULT_API_VERSION,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ApiConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> ApiConfigBuilder {
        ApiConfigBuilder::default()
    }

    /// Load configuration from environment variables
    ///
    /// Reads `API_ENDPOINT`, `API_LANGUAGE`, `API_VERSION`, `API_TIMEOUT_SECS` and
    /// `API_TIMEOUT_MS` (which takes precedence over the seconds value).
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result is invalid
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("API_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(language) = lookup("API_LANGUAGE") {
            config.language = language;
        }
        if let Some(version) = lookup("API_VERSION") {
            config.api_version = parse_var("API_VERSION", &version)?;
        }
        if let Some(timeout) = lookup("API_TIMEOUT_SECS") {
            let secs: u64 = parse_var("API_TIMEOUT_SECS", &timeout)?;
            config.timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(timeout) = lookup("API_TIMEOUT_MS") {
            config.timeout_ms = parse_var("API_TIMEOUT_MS", &timeout)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "endpoint must be an http(s) URL, got {:?}",
                self.endpoint
            )));
        }

        if self.language.trim().is_empty() {
            return Err(ConfigError::Validation(
                "language must not be empty".to_string(),
            ));
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Transport timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn timeout_millis(timeout: Duration) -> u64 {
    let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 && !timeout.is_zero() {
        1
    } else {
        millis
    }
}

fn parse_var<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidVar {
        var: var.to_string(),
        value: value.to_string(),
    })
}

/// Builder for [`ApiConfig`].
#[derive(Debug, Clone, Default)]
pub struct ApiConfigBuilder {
    endpoint: Option<String>,
    language: Option<String>,
    api_version: Option<u32>,
    timeout: Option<Duration>,
}

impl ApiConfigBuilder {
    /// Set the base URL.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the locale.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Set the protocol version.
    #[must_use]
    pub const fn api_version(mut self, version: u32) -> Self {
        self.api_version = Some(version);
        self
    }

    /// Set the transport timeout.
    ///
    /// Stored with millisecond precision; a non-zero timeout never rounds down to zero.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ApiConfig {
        ApiConfig {
            endpoint: self
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            language: self
                .language
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            api_version: self.api_version.unwrap_or(DEFAULT_API_VERSION),
            timeout_ms: self.timeout.map_or(DEFAULT_TIMEOUT_MS, timeout_millis),
        }
    }
}
