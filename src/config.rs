//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub delivery: DeliveryConfig,
    pub jobs: JobsConfig,
    pub polls: PollsConfig,
    pub instance: InstanceConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Inbound federation settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Timeout for any outbound federation HTTP call
    pub request_timeout_secs: u64,
    /// How long a fetched remote key stays fresh
    pub key_cache_ttl_secs: u64,
    /// Accepted clock skew for the signed `Date` header
    pub signature_max_skew_secs: i64,
    /// Reject unsigned inbox POSTs with 401
    pub require_signature: bool,
    /// Allow outbound requests to loopback and private addresses
    pub allow_private_addresses: bool,
    /// How long Undo/Delete ordering records are kept
    pub tombstone_retention_secs: i64,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Outbound delivery settings
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts before a transiently failing task is dropped
    pub max_attempts: u32,
    /// First retry delay
    pub base_backoff_secs: u64,
    /// Upper bound for a single retry delay
    pub max_backoff_secs: u64,
    /// Consecutive permanent failures before an inbox is marked unreachable
    pub unreachable_threshold: u32,
    /// How long an unreachable inbox is skipped before delivery is retried
    pub unreachable_retry_secs: i64,
    /// Concurrent inbox POSTs per runner
    pub concurrency: usize,
    /// Idle poll interval of the delivery runner
    pub poll_interval_ms: u64,
}

/// Background job runner settings
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Idle poll interval of the job runner
    pub poll_interval_ms: u64,
    /// Jobs claimed per poll
    pub batch_size: u32,
}

/// Poll expiry settings
#[derive(Debug, Clone, Deserialize)]
pub struct PollsConfig {
    /// Delay after `expires_at` before the expiry notifier runs
    pub expiry_grace_secs: i64,
}

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Username of the instance actor used for relay subscriptions
    pub actor_username: String,
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
    /// 4. Environment variables (FEDCORE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "https")?
            .set_default("database.path", "data/fedcore.db")?
            .set_default("federation.request_timeout_secs", 10)?
            .set_default("federation.key_cache_ttl_secs", 3600)?
            .set_default("federation.signature_max_skew_secs", 300)?
            .set_default("federation.require_signature", true)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("federation.tombstone_retention_secs", 2592000)?
            .set_default("delivery.max_attempts", 16)?
            .set_default("delivery.base_backoff_secs", 30)?
            .set_default("delivery.max_backoff_secs", 86400)?
            .set_default("delivery.unreachable_threshold", 7)?
            .set_default("delivery.unreachable_retry_secs", 604800)?
            .set_default("delivery.concurrency", 10)?
            .set_default("delivery.poll_interval_ms", 1000)?
            .set_default("jobs.poll_interval_ms", 1000)?
            .set_default("jobs.batch_size", 50)?
            .set_default("polls.expiry_grace_secs", 300)?
            .set_default("instance.actor_username", "instance.actor")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDCORE")
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

    fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.server.domain.trim().is_empty() {
            return Err(AppError::Config("server.domain must be set".to_string()));
        }

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(AppError::Config(
                "server.protocol must be http or https".to_string(),
            ));
        }

        if self.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.delivery.concurrency == 0 {
            return Err(AppError::Config(
                "delivery.concurrency must be greater than 0".to_string(),
            ));
        }

        if self.delivery.base_backoff_secs > self.delivery.max_backoff_secs {
            return Err(AppError::Config(
                "delivery.base_backoff_secs must not exceed delivery.max_backoff_secs".to_string(),
            ));
        }

        if self.delivery.unreachable_retry_secs <= 0 {
            return Err(AppError::Config(
                "delivery.unreachable_retry_secs must be greater than 0".to_string(),
            ));
        }

        if self.federation.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "federation.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Configuration suitable for tests: in-memory friendly defaults around
    /// the given database path.
    pub fn for_tests(db_path: PathBuf) -> Self {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "local.test".to_string(),
                protocol: "https".to_string(),
            },
            database: DatabaseConfig { path: db_path },
            federation: FederationConfig {
                request_timeout_secs: 5,
                key_cache_ttl_secs: 3600,
                signature_max_skew_secs: 300,
                require_signature: true,
                allow_private_addresses: true,
                tombstone_retention_secs: 2592000,
            },
            delivery: DeliveryConfig {
                max_attempts: 3,
                base_backoff_secs: 1,
                max_backoff_secs: 60,
                unreachable_threshold: 2,
                unreachable_retry_secs: 3600,
                concurrency: 4,
                poll_interval_ms: 50,
            },
            jobs: JobsConfig {
                poll_interval_ms: 50,
                batch_size: 20,
            },
            polls: PollsConfig {
                expiry_grace_secs: 300,
            },
            instance: InstanceConfig {
                actor_username: "instance.actor".to_string(),
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}
