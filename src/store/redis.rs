use alloy_primitives::Address;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{NonceStore, StoreError};

/// Deletes the lock only if it still carries our token.
///
/// A holder whose lease ran out must not remove the lock of whoever acquired it next.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(10);
pub const DEFAULT_LOCK_RETRY: Duration = Duration::from_millis(50);

/// Nonce store shared between processes through Redis.
///
/// Each account uses two keys:
/// - `nonce-account-0x<addr>`: next nonce as a decimal string,
/// - `nonce-lock-0x<addr>`: advisory lock holding a random token, set with `NX` and a lease.
///
/// The lock is advisory. If a holder dies without releasing it, the lease expires and the
/// next process proceeds. A holder that is merely slow past its lease loses exclusivity
/// without noticing: writes are not fenced.
#[derive(Clone)]
pub struct RedisNonceStore {
    conn: ConnectionManager,
    release_script: Arc<Script>,
    lock_lease: Duration,
    lock_retry: Duration,
}

impl fmt::Debug for RedisNonceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisNonceStore")
            .field("lock_lease", &self.lock_lease)
            .field("lock_retry", &self.lock_retry)
            .finish_non_exhaustive()
    }
}

/// Lock on one account held in Redis.
///
/// Release it with [`NonceStore::unlock`]. If it is dropped instead (e.g. the operation
/// future was cancelled), release is spawned onto the current tokio runtime; without a
/// runtime the lease expiry frees it. Release only deletes the key if it still carries
/// this lock's token, so dropping a lock that was never acquired is harmless.
pub struct RedisLock {
    inner: Option<HeldLock>,
}

struct HeldLock {
    key: String,
    token: String,
    conn: ConnectionManager,
    release_script: Arc<Script>,
}

impl HeldLock {
    async fn release(mut self) -> Result<bool, StoreError> {
        let deleted: i64 = self
            .release_script
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(deleted == 1)
    }
}

impl Drop for RedisLock {
    fn drop(&mut self) {
        let Some(held) = self.inner.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let key = held.key.clone();
                    if let Err(error) = held.release().await {
                        tracing::warn!(%key, %error, "failed to release dropped lock, waiting for lease expiry");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(key = %held.key, "lock dropped outside of a runtime, waiting for lease expiry");
            }
        }
    }
}

impl RedisNonceStore {
    /// Connects to Redis at `url` with the default lease and retry interval.
    pub async fn connect(url: &Url) -> Result<Self, StoreError> {
        let client = redis::Client::open(url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    /// Wraps an existing connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release_script: Arc::new(Script::new(RELEASE_LOCK_SCRIPT)),
            lock_lease: DEFAULT_LOCK_LEASE,
            lock_retry: DEFAULT_LOCK_RETRY,
        }
    }

    /// How long a lock stays valid if its holder never releases it.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    /// How long to wait between attempts on a contended lock.
    pub fn with_lock_retry(mut self, retry: Duration) -> Self {
        self.lock_retry = retry;
        self
    }

    pub fn lock_lease(&self) -> Duration {
        self.lock_lease
    }

    async fn try_acquire(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let lease_ms = u64::try_from(self.lock_lease.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

/// Key under which the next nonce of `account` is stored.
pub fn nonce_key(account: Address) -> String {
    format!("nonce-account-0x{}", hex::encode(account.as_slice()))
}

/// Key of the advisory lock for `account`.
pub fn lock_key(account: Address) -> String {
    format!("nonce-lock-0x{}", hex::encode(account.as_slice()))
}

fn lock_token() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}

#[async_trait]
impl NonceStore for RedisNonceStore {
    type Lock = RedisLock;

    async fn lock(
        &self,
        account: Address,
        cancel: &CancellationToken,
    ) -> Result<Self::Lock, StoreError> {
        // The guard exists before the first `SET` is sent: if this future is dropped while a
        // `SET` is in flight, its drop still deletes the key, provided it carries our token.
        let key = lock_key(account);
        let token = lock_token();
        let lock = RedisLock {
            inner: Some(HeldLock {
                key: key.clone(),
                token: token.clone(),
                conn: self.conn.clone(),
                release_script: Arc::clone(&self.release_script),
            }),
        };
        let mut contended = false;
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            // Not raced against `cancel`: the `SET` may land even if we stop waiting for it.
            if self.try_acquire(&key, &token).await? {
                return Ok(lock);
            }
            if !contended {
                tracing::debug!(%account, %key, "lock is held elsewhere, waiting");
                contended = true;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                _ = tokio::time::sleep(self.lock_retry) => {}
            }
        }
    }

    async fn unlock(&self, mut lock: Self::Lock) -> Result<(), StoreError> {
        let Some(held) = lock.inner.take() else {
            return Ok(());
        };
        let key = held.key.clone();
        if !held.release().await? {
            // Lease ran out while we held it; someone else may own the key by now.
            tracing::warn!(%key, "lock had already expired on release");
        }
        Ok(())
    }

    async fn get_nonce(&self, account: Address) -> Result<Option<u64>, StoreError> {
        let key = nonce_key(account);
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(&key).await?;
        match value {
            None => Ok(None),
            Some(value) => match value.parse::<u64>() {
                Ok(nonce) => Ok(Some(nonce)),
                Err(_) => Err(StoreError::Corrupt { key, value }),
            },
        }
    }

    async fn set_nonce(&self, account: Address, nonce: u64) -> Result<(), StoreError> {
        let key = nonce_key(account);
        let mut conn = self.conn.clone();
        let _: () = conn.set(&key, nonce.to_string()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, NonceBackend};
    use crate::manager::NonceManager;
    use crate::store::AnyNonceStore;
    use alloy_primitives::address;
    use std::collections::HashSet;

    #[test]
    fn test_keys_use_lowercase_hex() {
        let account = address!("00000000000000000000000000000000000000AB");
        assert_eq!(
            nonce_key(account),
            "nonce-account-0x00000000000000000000000000000000000000ab"
        );
        assert_eq!(
            lock_key(account),
            "nonce-lock-0x00000000000000000000000000000000000000ab"
        );
    }

    #[test]
    fn test_keys_differ_per_account() {
        let address1 = address!("0000000000000000000000000000000000000001");
        let address2 = address!("0000000000000000000000000000000000000002");
        assert_ne!(nonce_key(address1), nonce_key(address2));
        assert_ne!(lock_key(address1), lock_key(address2));
        assert_ne!(nonce_key(address1), lock_key(address1));
    }

    #[test]
    fn test_lock_tokens_are_unique() {
        let a = lock_token();
        let b = lock_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    async fn store_from_env() -> Option<RedisNonceStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        let url = Url::parse(&url).ok()?;
        RedisNonceStore::connect(&url).await.ok()
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_roundtrip_and_corrupt_value() {
        let store = store_from_env().await.expect("REDIS_URL must point to Redis");
        let account = Address::from(rand::random::<[u8; 20]>());

        assert_eq!(store.get_nonce(account).await.unwrap(), None);
        store.set_nonce(account, 0).await.unwrap();
        assert_eq!(store.get_nonce(account).await.unwrap(), Some(0));
        store.set_nonce(account, 41).await.unwrap();
        assert_eq!(store.get_nonce(account).await.unwrap(), Some(41));

        let mut conn = store.conn.clone();
        let _: () = conn.set(nonce_key(account), "not-a-number").await.unwrap();
        let result = store.get_nonce(account).await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_lock_is_exclusive_and_released() {
        let store = store_from_env().await.expect("REDIS_URL must point to Redis");
        let account = Address::from(rand::random::<[u8; 20]>());

        let lock = store.lock(account, &never()).await.unwrap();
        let second =
            tokio::time::timeout(Duration::from_millis(200), store.lock(account, &never())).await;
        assert!(second.is_err(), "second lock must wait for the first");

        store.unlock(lock).await.unwrap();
        let second =
            tokio::time::timeout(Duration::from_millis(500), store.lock(account, &never())).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_expired_lease_lets_next_holder_in() {
        let store = store_from_env()
            .await
            .expect("REDIS_URL must point to Redis")
            .with_lock_lease(Duration::from_millis(100))
            .with_lock_retry(Duration::from_millis(10));
        let account = Address::from(rand::random::<[u8; 20]>());

        let stale = store.lock(account, &never()).await.unwrap();
        let fresh = tokio::time::timeout(Duration::from_secs(2), store.lock(account, &never()))
            .await
            .expect("lease must expire")
            .unwrap();

        // The stale holder must not delete the fresh holder's lock.
        store.unlock(stale).await.unwrap();
        let third =
            tokio::time::timeout(Duration::from_millis(50), store.lock(account, &never())).await;
        assert!(third.is_err());
        store.unlock(fresh).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_cancelled_wait_leaves_holder_alone() {
        let store = store_from_env()
            .await
            .expect("REDIS_URL must point to Redis")
            .with_lock_retry(Duration::from_millis(10));
        let account = Address::from(rand::random::<[u8; 20]>());
        let cancel = CancellationToken::new();

        let held = store.lock(account, &never()).await.unwrap();
        let waiter = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { store.lock(account, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(StoreError::Cancelled)));

        // The abandoned waiter's guard must not have deleted the holder's key.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut conn = store.conn.clone();
        let exists: bool = conn.exists(lock_key(account)).await.unwrap();
        assert!(exists);
        store.unlock(held).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_dropped_acquisition_releases_the_key() {
        let store = store_from_env().await.expect("REDIS_URL must point to Redis");
        let account = Address::from(rand::random::<[u8; 20]>());

        // Resolve the acquisition but drop the lock without unlocking, as a cancelled
        // caller would.
        drop(store.lock(account, &never()).await.unwrap());
        let again = tokio::time::timeout(Duration::from_secs(1), store.lock(account, &never()))
            .await
            .expect("dropped lock must be released before its lease runs out")
            .unwrap();
        store.unlock(again).await.unwrap();
    }

    /// Same pending nonce for every account.
    struct FixedPending(u64);

    #[async_trait]
    impl NonceBackend for FixedPending {
        async fn pending_nonce_at(&self, _account: Address) -> Result<u64, BackendError> {
            Ok(self.0)
        }

        async fn suggest_gas_price(&self) -> Result<u128, BackendError> {
            Ok(1)
        }
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_managers_sharing_redis_allocate_unique_nonces() {
        const PER_MANAGER: u64 = 16;
        let account = Address::from(rand::random::<[u8; 20]>());
        let cancel = CancellationToken::new();

        // Two connections stand in for two processes signing for the same account.
        let mut managers = Vec::new();
        for _ in 0..2 {
            let store = store_from_env()
                .await
                .expect("REDIS_URL must point to Redis")
                .with_lock_retry(Duration::from_millis(5));
            managers.push(Arc::new(NonceManager::new(
                AnyNonceStore::from(store),
                FixedPending(100),
            )));
        }

        let handles = managers
            .iter()
            .flat_map(|manager| (0..PER_MANAGER).map(move |_| Arc::clone(manager)))
            .map(|manager| {
                let cancel = cancel.clone();
                tokio::spawn(async move { manager.allocate(&cancel, account).await.unwrap() })
            })
            .collect::<Vec<_>>();

        let mut nonces = HashSet::new();
        for handle in handles {
            assert!(nonces.insert(handle.await.unwrap()), "nonce handed out twice");
        }
        let total = 2 * PER_MANAGER;
        assert_eq!(nonces.len() as u64, total);
        assert_eq!(nonces.iter().min(), Some(&100));
        assert_eq!(nonces.iter().max(), Some(&(100 + total - 1)));
        assert_eq!(managers[0].peek(account).await.unwrap(), 100 + total);
    }
}
