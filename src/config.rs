//! Configuration for a nonce manager: where the chain is, and where nonces are cached.
//!
//! Configuration is a JSON document. String values may reference environment variables
//! through [`LiteralOrEnv`], which keeps credentials such as Redis passwords out of the file:
//!
//! ```json
//! {
//!   "rpc": [{ "http": "$RPC_URL", "rate_limit": 25 }],
//!   "store": { "type": "redis", "url": "${REDIS_URL}", "lock_lease_ms": 10000 }
//! }
//! ```
//!
//! `store` defaults to `{ "type": "memory" }`.

use alloy_provider::RootProvider;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::backend::{BackendError, RpcBackend};
use crate::manager::NonceManager;
use crate::store::{AnyNonceStore, MemoryNonceStore, StoreError};

/// Environment variable holding the path of the configuration file.
pub const ENV_CONFIG: &str = "CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Manager configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// RPC endpoints used to query pending nonces and gas prices.
    #[serde(default)]
    rpc: Vec<RpcConfig>,
    #[serde(default)]
    store: StoreConfig,
}

/// RPC provider configuration for a single provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcConfig {
    /// HTTP URL for the RPC endpoint.
    pub http: LiteralOrEnv<Url>,
    /// Rate limit for requests per second (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
}

/// Where cached nonces and account locks live.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-process store; only callers sharing the manager are coordinated.
    #[default]
    Memory,
    /// Redis store; every process pointing at the same Redis is coordinated.
    Redis(RedisStoreConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisStoreConfig {
    pub url: LiteralOrEnv<Url>,
    /// Lease of an account lock, after which a crashed holder's lock is considered gone.
    #[serde(default = "config_defaults::default_lock_lease_ms")]
    pub lock_lease_ms: u64,
    /// Pause between attempts to take a contended lock.
    #[serde(default = "config_defaults::default_lock_retry_ms")]
    pub lock_retry_ms: u64,
}

impl RedisStoreConfig {
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }
}

pub mod config_defaults {
    pub const DEFAULT_LOCK_LEASE_MS: u64 = 10_000;
    pub const DEFAULT_LOCK_RETRY_MS: u64 = 50;

    pub fn default_lock_lease_ms() -> u64 {
        DEFAULT_LOCK_LEASE_MS
    }

    pub fn default_lock_retry_ms() -> u64 {
        DEFAULT_LOCK_RETRY_MS
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Failed to open nonce store: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to set up RPC backend: {0}")]
    Backend(#[from] BackendError),
    #[error("Store type {0:?} is not compiled in")]
    UnsupportedStore(&'static str),
}

impl Config {
    pub fn rpc(&self) -> &[RpcConfig] {
        &self.rpc
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    /// Load configuration from the file named by `$CONFIG`, or `./config.json`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(ENV_CONFIG).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(path)
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    /// Connects the configured store and RPC endpoints into a manager.
    pub async fn into_manager(
        self,
    ) -> Result<NonceManager<AnyNonceStore, RpcBackend<RootProvider>>, ConfigError> {
        let store = self.store.build().await?;
        let backend = RpcBackend::from_config(&self.rpc)?;
        Ok(NonceManager::new(store, backend))
    }
}

impl StoreConfig {
    /// Opens the configured store. Connects to Redis when the `redis` variant is chosen.
    pub async fn build(&self) -> Result<AnyNonceStore, ConfigError> {
        match self {
            StoreConfig::Memory => Ok(MemoryNonceStore::new().into()),
            #[cfg(feature = "redis")]
            StoreConfig::Redis(redis) => {
                let store = crate::store::RedisNonceStore::connect(&redis.url)
                    .await?
                    .with_lock_lease(redis.lock_lease())
                    .with_lock_retry(redis.lock_retry());
                tracing::info!(lock_lease = ?redis.lock_lease(), "Using Redis nonce store");
                Ok(store.into())
            }
            #[cfg(not(feature = "redis"))]
            StoreConfig::Redis(_) => Err(ConfigError::UnsupportedStore("redis")),
        }
    }
}

// ============================================================================
// Environment Variable Resolution
// ============================================================================

/// A transparent wrapper that resolves environment variables during deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"redis://127.0.0.1:6379"`
/// - Simple env var: `"$REDIS_URL"`
/// - Braced env var: `"${REDIS_URL}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn from_literal(value: T) -> Self {
        Self(value)
    }

    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Returns the variable name if `s` is `$VAR` or `${VAR}`.
    fn parse_env_var_syntax(s: &str) -> Option<&str> {
        if let Some(braced) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            Some(braced)
        } else {
            let name = s.strip_prefix('$')?;
            let is_name = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
            is_name.then_some(name)
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        let value = match Self::parse_env_var_syntax(&s) {
            Some(var_name) => env::var(var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{}' not found (referenced as '{}')",
                    var_name, s
                ))
            })?,
            None => s,
        };

        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {}", e)))?;

        Ok(LiteralOrEnv(parsed))
    }
}

impl<T> Serialize for LiteralOrEnv<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}
