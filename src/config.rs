//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8000)
    pub port: u16,
    /// Federation domain identifier (e.g., "splitter-1" or "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
    /// Public base URL when it differs from `protocol://domain`
    /// (e.g., "http://localhost:8000" for domain "splitter-1")
    #[serde(default)]
    pub public_url: Option<String>,
}

impl ServerConfig {
    /// Get the base URL for the instance, without a trailing slash
    pub fn base_url(&self) -> String {
        match self.public_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("{}://{}", self.protocol, self.domain),
        }
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Master switch for background sweeps
    pub enabled: bool,
    /// Attempts after which an outbox entry is abandoned
    pub max_retry_count: u32,
    /// Consecutive failures that open a domain circuit
    pub circuit_failure_threshold: u32,
    /// How long an open circuit stays open
    pub circuit_cooldown_seconds: u64,
    /// Retry sweep period
    pub retry_interval_seconds: u64,
    /// Reputation recalculation period
    pub reputation_interval_seconds: u64,
    /// Outbox entries per retry sweep
    pub retry_batch_size: u32,
    /// Parallel deliveries per fan-out
    pub delivery_concurrency: usize,
    /// Timeout for delivery POSTs
    pub delivery_timeout_seconds: u64,
    /// Timeout for WebFinger and actor fetches
    pub fetch_timeout_seconds: u64,
    /// Remote actor cache freshness window
    pub actor_cache_ttl_seconds: u64,
    /// RSA modulus size for a freshly generated instance key
    pub key_bits: usize,
    /// Reject inbox requests without a Signature header
    pub require_signatures: bool,
    /// Extra domain -> base URL entries merged over the built-in table
    #[serde(default)]
    pub known_instances: HashMap<String, String>,
}

impl FederationConfig {
    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_seconds)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn actor_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_cache_ttl_seconds)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retry_count: 6,
            circuit_failure_threshold: 5,
            circuit_cooldown_seconds: 300,
            retry_interval_seconds: 30,
            reputation_interval_seconds: 600,
            retry_batch_size: 25,
            delivery_concurrency: 10,
            delivery_timeout_seconds: 15,
            fetch_timeout_seconds: 10,
            actor_cache_ttl_seconds: 3600,
            key_bits: 2048,
            require_signatures: false,
            known_instances: HashMap::new(),
        }
    }
}

/// Administrative API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Bearer token accepted by /api/admin and the federation write routes
    pub api_token: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (SPLITTER__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let defaults = FederationConfig::default();
        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8000)?
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/splitter.db")?
            .set_default("federation.enabled", defaults.enabled)?
            .set_default("federation.max_retry_count", defaults.max_retry_count as i64)?
            .set_default(
                "federation.circuit_failure_threshold",
                defaults.circuit_failure_threshold as i64,
            )?
            .set_default(
                "federation.circuit_cooldown_seconds",
                defaults.circuit_cooldown_seconds as i64,
            )?
            .set_default(
                "federation.retry_interval_seconds",
                defaults.retry_interval_seconds as i64,
            )?
            .set_default(
                "federation.reputation_interval_seconds",
                defaults.reputation_interval_seconds as i64,
            )?
            .set_default("federation.retry_batch_size", defaults.retry_batch_size as i64)?
            .set_default(
                "federation.delivery_concurrency",
                defaults.delivery_concurrency as i64,
            )?
            .set_default(
                "federation.delivery_timeout_seconds",
                defaults.delivery_timeout_seconds as i64,
            )?
            .set_default(
                "federation.fetch_timeout_seconds",
                defaults.fetch_timeout_seconds as i64,
            )?
            .set_default(
                "federation.actor_cache_ttl_seconds",
                defaults.actor_cache_ttl_seconds as i64,
            )?
            .set_default("federation.key_bits", defaults.key_bits as i64)?
            .set_default("federation.require_signatures", defaults.require_signatures)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("SPLITTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        const MIN_KEY_BITS: usize = 1024;

        if self.admin.api_token.trim().is_empty() {
            return Err(AppError::Config(
                "admin.api_token must not be empty".to_string(),
            ));
        }

        if let Some(public_url) = &self.server.public_url {
            url::Url::parse(public_url).map_err(|e| {
                AppError::Config(format!("server.public_url is not a valid URL: {}", e))
            })?;
        }

        let federation = &self.federation;
        if federation.retry_interval_seconds == 0 || federation.reputation_interval_seconds == 0 {
            return Err(AppError::Config(
                "federation sweep intervals must be greater than 0".to_string(),
            ));
        }

        if federation.retry_batch_size == 0 || federation.delivery_concurrency == 0 {
            return Err(AppError::Config(
                "federation.retry_batch_size and federation.delivery_concurrency must be greater than 0"
                    .to_string(),
            ));
        }

        if federation.key_bits < MIN_KEY_BITS {
            return Err(AppError::Config(format!(
                "federation.key_bits must be at least {}",
                MIN_KEY_BITS
            )));
        }

        for (domain, base_url) in &federation.known_instances {
            url::Url::parse(base_url).map_err(|e| {
                AppError::Config(format!(
                    "federation.known_instances.{} is not a valid URL: {}",
                    domain, e
                ))
            })?;
        }

        Ok(())
    }
}
