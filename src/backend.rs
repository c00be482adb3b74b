//! The remote ledger as seen by the nonce manager.
//!
//! The manager needs exactly two reads from the chain: the pending nonce of an account
//! and a gas price suggestion. [`NonceBackend`] captures them; [`RpcBackend`] serves them
//! from any alloy [`Provider`].

use alloy_network::{Ethereum, Network};
use alloy_primitives::Address;
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_transport::TransportError;
use alloy_transport::layers::{FallbackLayer, ThrottleLayer};
use alloy_transport_http::Http;
use async_trait::async_trait;
use std::future::IntoFuture;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use tower::ServiceBuilder;
use tracing::Instrument;

use crate::config::RpcConfig;

/// Errors raised by a [`NonceBackend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("RPC transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("No HTTP RPC endpoint configured")]
    NoTransports,
    #[error("Backend error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Authoritative chain state consulted by the nonce manager.
#[async_trait]
pub trait NonceBackend: Send + Sync {
    /// Next nonce the chain expects for `account`, counting pending transactions.
    async fn pending_nonce_at(&self, account: Address) -> Result<u64, BackendError>;

    /// Suggested gas price, in wei.
    async fn suggest_gas_price(&self) -> Result<u128, BackendError>;
}

/// [`NonceBackend`] backed by a JSON-RPC provider.
#[derive(Clone, Debug)]
pub struct RpcBackend<P, N = Ethereum> {
    provider: P,
    _network: PhantomData<fn() -> N>,
}

impl<P, N> RpcBackend<P, N>
where
    P: Provider<N>,
    N: Network,
{
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            _network: PhantomData,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl RpcBackend<RootProvider> {
    /// Builds a provider over every HTTP endpoint in `rpc`.
    ///
    /// Each endpoint is throttled to its `rate_limit` (requests per second), and requests
    /// fall back across endpoints. Non-HTTP endpoints are skipped.
    pub fn from_config(rpc: &[RpcConfig]) -> Result<Self, BackendError> {
        let client = rpc_client(rpc)?;
        Ok(Self::new(RootProvider::new(client)))
    }
}

/// Builds an [`RpcClient`] throttled per endpoint with fallback between endpoints.
pub fn rpc_client(rpc: &[RpcConfig]) -> Result<RpcClient, BackendError> {
    let transports = rpc
        .iter()
        .filter_map(|provider_config| {
            let scheme = provider_config.http.scheme();
            let is_http = scheme == "http" || scheme == "https";
            if !is_http {
                tracing::warn!(rpc_url = %provider_config.http.as_str(), "Skipping non-HTTP transport");
                return None;
            }
            let rpc_url = provider_config.http.inner().clone();
            tracing::info!(rpc_url = %rpc_url, rate_limit = ?provider_config.rate_limit, "Using HTTP transport");
            let rate_limit = provider_config.rate_limit.unwrap_or(u32::MAX);
            let service = ServiceBuilder::new()
                .layer(ThrottleLayer::new(rate_limit))
                .service(Http::new(rpc_url));
            Some(service)
        })
        .collect::<Vec<_>>();
    let active = NonZeroUsize::new(transports.len()).ok_or(BackendError::NoTransports)?;
    let fallback = ServiceBuilder::new()
        .layer(FallbackLayer::default().with_active_transport_count(active))
        .service(transports);
    Ok(RpcClient::new(fallback, false))
}

#[async_trait]
impl<P, N> NonceBackend for RpcBackend<P, N>
where
    P: Provider<N> + Send + Sync,
    N: Network,
{
    async fn pending_nonce_at(&self, account: Address) -> Result<u64, BackendError> {
        let nonce = self
            .provider
            .get_transaction_count(account)
            .pending()
            .into_future()
            .instrument(tracing::debug_span!("get_transaction_count", %account))
            .await?;
        Ok(nonce)
    }

    async fn suggest_gas_price(&self) -> Result<u128, BackendError> {
        let price = self
            .provider
            .get_gas_price()
            .instrument(tracing::debug_span!("get_gas_price"))
            .await?;
        Ok(price)
    }
}
