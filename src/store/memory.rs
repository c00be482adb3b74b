use alloy_primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::{NonceStore, StoreError};

/// Nonce store living in the current process.
///
/// Cached values and lock registry are shared across all clones using `Arc<DashMap>`.
/// Each address gets its own `Mutex`, created on first use and kept for the lifetime
/// of the store, so locking one address never waits on another.
#[derive(Clone, Debug, Default)]
pub struct MemoryNonceStore {
    /// Next nonce per address.
    nonces: Arc<DashMap<Address, u64>>,
    /// Lock per address.
    locks: Arc<DashMap<Address, Arc<Mutex<()>>>>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, account: Address) -> Arc<Mutex<()>> {
        // Locks dashmap internally for a short duration to clone the `Arc`.
        // The dashmap shard must not be held across the await in `lock`.
        let entry = self
            .locks
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    type Lock = OwnedMutexGuard<()>;

    async fn lock(
        &self,
        account: Address,
        cancel: &CancellationToken,
    ) -> Result<Self::Lock, StoreError> {
        let mutex = self.lock_for(account);
        // Waiting on a tokio mutex is cancel safe: giving up only loses the place in the queue.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
            guard = mutex.lock_owned() => Ok(guard),
        }
    }

    async fn unlock(&self, lock: Self::Lock) -> Result<(), StoreError> {
        drop(lock);
        Ok(())
    }

    async fn get_nonce(&self, account: Address) -> Result<Option<u64>, StoreError> {
        Ok(self.nonces.get(&account).map(|nonce| *nonce))
    }

    async fn set_nonce(&self, account: Address, nonce: u64) -> Result<(), StoreError> {
        self.nonces.insert(account, nonce);
        Ok(())
    }
}
