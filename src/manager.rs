//! Nonce allocation.
//!
//! [`NonceManager`] hands out transaction nonces per account. It keeps the next nonce in a
//! [`NonceStore`] and cross-checks it against the chain's pending nonce on every allocation.
//!
//! # How it works
//!
//! For each [`NonceManager::allocate`] call, under the account lock:
//!
//! 1. read the cached next nonce;
//! 2. ask the chain for the pending nonce of the account;
//! 3. if nothing is cached, or the chain is strictly ahead of the cache, use the chain's value,
//!    otherwise use the cached one;
//! 4. store `nonce + 1` and return `nonce`.
//!
//! The chain being ahead means someone else sent transactions for the account, or this
//! process restarted; the chain being behind means our own transactions are not visible yet.
//! Either way the returned nonce is never lower than both sources, so it is never reused.
//!
//! # Cancellation
//!
//! Operations touching remote I/O take a [`CancellationToken`]. It is observed while waiting
//! for the account lock, while reading the cache and while querying the chain; when it fires
//! there, the operation fails with [`NonceError::Cancelled`] without writing the cached nonce,
//! and the account lock is released. The token is checked once more before the write, but the
//! write itself is never abandoned: a write dropped in flight may still land, and the caller
//! would lose the nonce it was never given. Once written, the nonce is returned.
//!
//! Dropping the operation future is also safe for the lock, which is released either way.

use alloy_primitives::Address;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, NonceBackend};
use crate::store::{NonceStore, StoreError};

/// Suggested gas prices are scaled by `GAS_PRICE_MULTIPLIER_NUMERATOR / GAS_PRICE_MULTIPLIER_DENOMINATOR`.
pub const GAS_PRICE_MULTIPLIER_NUMERATOR: u128 = 1500;
pub const GAS_PRICE_MULTIPLIER_DENOMINATOR: u128 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum NonceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Nonce space exhausted for {account}")]
    Overflow { account: Address },
    #[error("Gas price {0} overflows when scaled")]
    GasPriceOverflow(u128),
}

/// Allocates nonces per account over a [`NonceStore`] and a [`NonceBackend`].
///
/// Clones share the store, so share a manager (or its store) between every caller that
/// signs for the same accounts. There is no global instance.
#[derive(Clone, Debug)]
pub struct NonceManager<S, B> {
    store: S,
    backend: B,
}

impl<S, B> NonceManager<S, B>
where
    S: NonceStore,
    B: NonceBackend,
{
    pub fn new(store: S, backend: B) -> Self {
        Self { store, backend }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the nonce to use for the next transaction of `account`.
    ///
    /// Every call returns a different nonce, even if the previous one was never used.
    /// Use [`NonceManager::reset`] to drop nonces that were allocated but never landed.
    pub async fn allocate(
        &self,
        cancel: &CancellationToken,
        account: Address,
    ) -> Result<u64, NonceError> {
        self.with_lock(cancel, account, self.allocate_locked(cancel, account))
            .await
    }

    /// Returns the cached next nonce of `account`, `0` if none was ever stored.
    ///
    /// Does not consult the chain and changes nothing. Takes the account lock so it never
    /// observes an allocation halfway.
    ///
    /// The lock wait is not bounded. With a shared store such as Redis, where another process
    /// may hold the lock up to its lease, wrap the call in [`tokio::time::timeout`].
    pub async fn peek(&self, account: Address) -> Result<u64, NonceError> {
        let lock = self.store.lock(account, &CancellationToken::new()).await?;
        let result = self.store.get_nonce(account).await;
        self.release(account, lock).await;
        Ok(result?.unwrap_or(0))
    }

    /// Replaces the cached next nonce of `account` with the chain's pending nonce.
    ///
    /// This should be called when a transaction fails, as we cannot be certain of the
    /// actual on-chain state (the transaction may or may not have reached the mempool).
    /// Returns the nonce now cached.
    pub async fn reset(
        &self,
        cancel: &CancellationToken,
        account: Address,
    ) -> Result<u64, NonceError> {
        self.with_lock(cancel, account, self.reset_locked(cancel, account))
            .await
    }

    /// Returns the chain's suggested gas price scaled by 1.5.
    ///
    /// Computed in integers, so multiples of 1000 wei scale exactly. Nothing is cached.
    pub async fn suggest_gas_price(&self, cancel: &CancellationToken) -> Result<u128, NonceError> {
        let price = cancellable(cancel, self.backend.suggest_gas_price()).await??;
        scale_gas_price(price)
    }

    async fn allocate_locked(
        &self,
        cancel: &CancellationToken,
        account: Address,
    ) -> Result<u64, NonceError> {
        let cached = cancellable(cancel, self.store.get_nonce(account)).await??;
        let pending = cancellable(cancel, self.backend.pending_nonce_at(account)).await??;
        let nonce = match cached {
            Some(cached) if cached >= pending => cached,
            _ => {
                tracing::trace!(%account, ?cached, pending, "adopting pending nonce");
                pending
            }
        };
        let next = nonce
            .checked_add(1)
            .ok_or(NonceError::Overflow { account })?;
        if cancel.is_cancelled() {
            return Err(NonceError::Cancelled);
        }
        self.store.set_nonce(account, next).await?;
        tracing::trace!(%account, nonce, "allocated nonce");
        Ok(nonce)
    }

    async fn reset_locked(
        &self,
        cancel: &CancellationToken,
        account: Address,
    ) -> Result<u64, NonceError> {
        let pending = cancellable(cancel, self.backend.pending_nonce_at(account)).await??;
        if cancel.is_cancelled() {
            return Err(NonceError::Cancelled);
        }
        self.store.set_nonce(account, pending).await?;
        tracing::debug!(%account, pending, "reset nonce cache to pending nonce");
        Ok(pending)
    }

    /// Runs `operation` while holding the lock of `account`, releasing it on every exit path.
    async fn with_lock<T, F>(
        &self,
        cancel: &CancellationToken,
        account: Address,
        operation: F,
    ) -> Result<T, NonceError>
    where
        F: Future<Output = Result<T, NonceError>>,
    {
        let lock = match self.store.lock(account, cancel).await {
            Ok(lock) => lock,
            Err(StoreError::Cancelled) => return Err(NonceError::Cancelled),
            Err(error) => return Err(error.into()),
        };
        // The store may finish an acquisition that was already in flight when the token fired.
        if cancel.is_cancelled() {
            self.release(account, lock).await;
            return Err(NonceError::Cancelled);
        }
        let result = operation.await;
        self.release(account, lock).await;
        result
    }

    /// Unlocks `account`. Failure is not reported to the caller: the store's own expiry
    /// covers a lock that could not be released, and the operation result already stands.
    async fn release(&self, account: Address, lock: S::Lock) {
        if let Err(error) = self.store.unlock(lock).await {
            tracing::warn!(%account, %error, "failed to release account lock");
        }
    }
}

/// Scales a suggested gas price by [`GAS_PRICE_MULTIPLIER_NUMERATOR`] / [`GAS_PRICE_MULTIPLIER_DENOMINATOR`].
pub fn scale_gas_price(price: u128) -> Result<u128, NonceError> {
    price
        .checked_mul(GAS_PRICE_MULTIPLIER_NUMERATOR)
        .map(|scaled| scaled / GAS_PRICE_MULTIPLIER_DENOMINATOR)
        .ok_or(NonceError::GasPriceOverflow(price))
}

/// Awaits `future` unless `cancel` fires first.
async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    future: F,
) -> Result<F::Output, NonceError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NonceError::Cancelled),
        output = future => Ok(output),
    }
}
