//! Per-account transaction nonce allocation for EVM signers.
//!
//! Sending several transactions from one account concurrently requires each of them to carry
//! a distinct nonce, and none of them may reuse a nonce the chain has already seen. This crate
//! hands out such nonces, coordinating callers within one process or, through Redis, across
//! processes that share signer accounts.
//!
//! # Modules
//!
//! - [`manager`] — [`NonceManager`](manager::NonceManager): allocate, peek, reset, gas price suggestion.
//! - [`store`] — Where cached nonces and account locks live: in memory or in Redis.
//! - [`backend`] — The chain's view of an account, served by an alloy provider.
//! - [`config`] — JSON configuration with environment variable references.
//! - [`util`] — Telemetry setup.
//!
//! # Example
//!
//! ```ignore
//! let manager = Config::load()?.into_manager().await?;
//! let cancel = CancellationToken::new();
//! let nonce = manager.allocate(&cancel, signer).await?;
//! let gas_price = manager.suggest_gas_price(&cancel).await?;
//! ```

pub mod backend;
pub mod config;
pub mod manager;
pub mod store;
pub mod util;

pub use backend::{BackendError, NonceBackend, RpcBackend};
pub use config::{Config, ConfigError};
pub use manager::{NonceError, NonceManager};
pub use store::{AnyNonceStore, MemoryNonceStore, NonceStore, StoreError};
#[cfg(feature = "redis")]
pub use store::RedisNonceStore;
