//! Storage for cached next-nonce values and the per-account locks guarding them.
//!
//! A [`NonceStore`] hands out an exclusive lock per account and keeps the next nonce
//! the manager intends to use for that account. Two implementations are provided:
//!
//! - [`MemoryNonceStore`] keeps everything in the current process.
//! - [`RedisNonceStore`] keeps values in Redis and uses a lease-based advisory lock,
//!   so several processes can share one signer account (feature `redis`).
//!
//! [`AnyNonceStore`] picks one of them at runtime, typically from [`StoreConfig`](crate::config::StoreConfig).

use alloy_primitives::Address;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryNonceStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisLock, RedisNonceStore};

/// Errors raised by a [`NonceStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Corrupt nonce value {value:?} under key {key}")]
    Corrupt { key: String, value: String },
    #[error("Gave up waiting for the account lock")]
    Cancelled,
}

/// Cached nonce state plus the locking discipline around it.
///
/// Values are written unconditionally: correctness relies on the caller holding the
/// account lock returned by [`NonceStore::lock`] for the whole read-modify-write.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Proof of holding an account lock. Dropping it releases the lock.
    type Lock: Send;

    /// Waits until the lock for `account` is free, then takes it.
    ///
    /// Fails with [`StoreError::Cancelled`] if `cancel` fires while waiting. An acquisition
    /// attempt already in flight is completed rather than abandoned, so the lock may still be
    /// returned after `cancel` fired. Dropping the returned future must not leave the lock held.
    async fn lock(
        &self,
        account: Address,
        cancel: &CancellationToken,
    ) -> Result<Self::Lock, StoreError>;

    /// Releases a lock taken with [`NonceStore::lock`].
    async fn unlock(&self, lock: Self::Lock) -> Result<(), StoreError>;

    /// Returns the cached next nonce, or `None` if nothing was ever stored for `account`.
    async fn get_nonce(&self, account: Address) -> Result<Option<u64>, StoreError>;

    /// Overwrites the cached next nonce.
    async fn set_nonce(&self, account: Address, nonce: u64) -> Result<(), StoreError>;
}

/// A store selected at runtime.
#[derive(Clone, Debug)]
pub enum AnyNonceStore {
    Memory(MemoryNonceStore),
    #[cfg(feature = "redis")]
    Redis(RedisNonceStore),
}

/// Lock handed out by [`AnyNonceStore`].
pub enum AnyLock {
    Memory(<MemoryNonceStore as NonceStore>::Lock),
    #[cfg(feature = "redis")]
    Redis(RedisLock),
}

impl From<MemoryNonceStore> for AnyNonceStore {
    fn from(store: MemoryNonceStore) -> Self {
        AnyNonceStore::Memory(store)
    }
}

#[cfg(feature = "redis")]
impl From<RedisNonceStore> for AnyNonceStore {
    fn from(store: RedisNonceStore) -> Self {
        AnyNonceStore::Redis(store)
    }
}

#[async_trait]
impl NonceStore for AnyNonceStore {
    type Lock = AnyLock;

    async fn lock(
        &self,
        account: Address,
        cancel: &CancellationToken,
    ) -> Result<Self::Lock, StoreError> {
        match self {
            AnyNonceStore::Memory(store) => store.lock(account, cancel).await.map(AnyLock::Memory),
            #[cfg(feature = "redis")]
            AnyNonceStore::Redis(store) => store.lock(account, cancel).await.map(AnyLock::Redis),
        }
    }

    async fn unlock(&self, lock: Self::Lock) -> Result<(), StoreError> {
        match (self, lock) {
            (AnyNonceStore::Memory(store), AnyLock::Memory(lock)) => store.unlock(lock).await,
            #[cfg(feature = "redis")]
            (AnyNonceStore::Redis(store), AnyLock::Redis(lock)) => store.unlock(lock).await,
            // A lock from another variant cannot be released here; dropping it does that.
            #[cfg(feature = "redis")]
            (_, lock) => {
                drop(lock);
                Ok(())
            }
        }
    }

    async fn get_nonce(&self, account: Address) -> Result<Option<u64>, StoreError> {
        match self {
            AnyNonceStore::Memory(store) => store.get_nonce(account).await,
            #[cfg(feature = "redis")]
            AnyNonceStore::Redis(store) => store.get_nonce(account).await,
        }
    }

    async fn set_nonce(&self, account: Address, nonce: u64) -> Result<(), StoreError> {
        match self {
            AnyNonceStore::Memory(store) => store.set_nonce(account, nonce).await,
            #[cfg(feature = "redis")]
            AnyNonceStore::Redis(store) => store.set_nonce(account, nonce).await,
        }
    }
}
