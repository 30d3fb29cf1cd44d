//! Node access behind narrow traits.
//!
//! [`NodeProvider`] covers request/response calls, [`PushProvider`] covers
//! websocket subscriptions. Both speak the normalized types of
//! [`crate::types`] so the rest of the crate never sees raw ethers payloads
//! except at the subscription boundary.

use crate::asset_index::{AlchemyAssetIndex, AssetIndex};
use crate::error::ServiceError;
use crate::types::{Block, Network, Receipt, Transaction};
use async_trait::async_trait;
use core_logic::{transient_kind, ConfigError, MetricsCollector, NetworkConfig, ProviderError, TransientKind};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use futures::StreamExt;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SUBSCRIPTION_BUFFER: usize = 256;

const UNPREDICTABLE_GAS_PATTERNS: [&str; 5] = [
    "unpredictable_gas_limit",
    "execution reverted",
    "cannot estimate gas",
    "gas required exceeds",
    "always failing transaction",
];

/// Maps a transport or JSON-RPC failure onto [`ProviderError`].
pub fn classify_error(endpoint: &str, error: impl Display) -> ProviderError {
    let msg = error.to_string();
    let lower = msg.to_lowercase();

    if UNPREDICTABLE_GAS_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ProviderError::UnpredictableGas { reason: msg };
    }
    if lower.contains("method not found") || lower.contains("does not exist/is not available") {
        return ProviderError::Unsupported {
            endpoint: endpoint.to_string(),
            operation: msg,
        };
    }

    match transient_kind(&msg) {
        Some(TransientKind::Timeout) => ProviderError::Timeout {
            endpoint: endpoint.to_string(),
        },
        Some(TransientKind::RateLimited) => ProviderError::RateLimited {
            endpoint: endpoint.to_string(),
        },
        Some(TransientKind::Connection) => ProviderError::ConnectionRefused {
            endpoint: endpoint.to_string(),
            reason: msg,
        },
        None => ProviderError::Rpc {
            endpoint: endpoint.to_string(),
            msg,
        },
    }
}

#[async_trait]
pub trait NodeProvider: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn get_block_number(&self) -> Result<u64, ProviderError>;

    async fn get_block(&self, id: BlockId) -> Result<Option<Block>, ProviderError>;

    async fn get_balance(&self, address: Address) -> Result<U256, ProviderError>;

    /// Count of mined transactions sent from `address` at the latest block.
    async fn get_transaction_count(&self, address: Address) -> Result<u64, ProviderError>;

    async fn get_transaction(&self, hash: H256) -> Result<Option<Transaction>, ProviderError>;

    async fn get_transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>, ProviderError>;

    async fn estimate_gas(&self, request: &TypedTransaction) -> Result<U256, ProviderError>;

    /// `(max_fee_per_gas, max_priority_fee_per_gas)` suggested by the node.
    async fn estimate_fees(&self) -> Result<(U256, U256), ProviderError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ProviderError>;
}

/// Push topics the service subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionTopic {
    NewHeads,
    /// Full pending transactions sent from or to `address`.
    PendingTransactions { address: Address },
}

impl SubscriptionTopic {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionTopic::NewHeads => "newHeads",
            SubscriptionTopic::PendingTransactions { .. } => "alchemy_pendingTransactions",
        }
    }

    pub fn params(&self) -> serde_json::Value {
        match self {
            SubscriptionTopic::NewHeads => serde_json::json!(["newHeads"]),
            SubscriptionTopic::PendingTransactions { address } => serde_json::json!([
                "alchemy_pendingTransactions",
                {
                    "fromAddress": [address],
                    "toAddress": [address],
                    "hashesOnly": false,
                }
            ]),
        }
    }
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Raw payloads for `topic`. Dropping the receiver ends the subscription.
    async fn subscribe(
        &self,
        topic: SubscriptionTopic,
    ) -> Result<mpsc::Receiver<serde_json::Value>, ProviderError>;

    /// Resolves once `hash` has a receipt. Dropping the receiver disarms it.
    async fn once_confirmed(&self, hash: H256) -> Result<oneshot::Receiver<Receipt>, ProviderError>;
}

/// [`NodeProvider`] over an ethers provider.
#[derive(Debug, Clone)]
pub struct EthersNode<P> {
    provider: Arc<Provider<P>>,
    network: Network,
    endpoint: String,
}

impl EthersNode<Http> {
    pub fn connect_http(url: &str, network: Network) -> Result<Self, ConfigError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| ConfigError::InvalidUrl {
            field: format!("networks.{}.rpc_url", network.name),
            url: url.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "http client".to_string(),
                reason: e.to_string(),
            })?;
        let provider = Provider::new(Http::new_with_client(parsed, client));
        Ok(Self::new(Arc::new(provider), url, network))
    }
}

impl<P: JsonRpcClient + 'static> EthersNode<P> {
    pub fn new(provider: Arc<Provider<P>>, endpoint: impl Into<String>, network: Network) -> Self {
        Self {
            provider,
            network,
            endpoint: endpoint.into(),
        }
    }

    async fn call<T, E, F>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, E>> + Send,
        E: Display,
    {
        let start = Instant::now();
        let result = fut.await;
        MetricsCollector::global().record_rpc_latency(start.elapsed());
        result.map_err(|e| classify_error(&self.endpoint, e))
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> NodeProvider for EthersNode<P> {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn get_block_number(&self) -> Result<u64, ProviderError> {
        let number = self.call(self.provider.get_block_number()).await?;
        Ok(number.as_u64())
    }

    async fn get_block(&self, id: BlockId) -> Result<Option<Block>, ProviderError> {
        let block = self.call(self.provider.get_block(id)).await?;
        Ok(block.and_then(|b| Block::from_ethers(&b, &self.network)))
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ProviderError> {
        self.call(self.provider.get_balance(address, None)).await
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64, ProviderError> {
        let count = self
            .call(
                self.provider
                    .get_transaction_count(address, Some(BlockNumber::Latest.into())),
            )
            .await?;
        Ok(count.as_u64())
    }

    async fn get_transaction(&self, hash: H256) -> Result<Option<Transaction>, ProviderError> {
        let tx = self.call(self.provider.get_transaction(hash)).await?;
        Ok(tx.map(|t| Transaction::from_ethers(&t, &self.network)))
    }

    async fn get_transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>, ProviderError> {
        let receipt = self.call(self.provider.get_transaction_receipt(hash)).await?;
        Ok(receipt.as_ref().map(Receipt::from))
    }

    async fn estimate_gas(&self, request: &TypedTransaction) -> Result<U256, ProviderError> {
        self.call(self.provider.estimate_gas(request, None)).await
    }

    async fn estimate_fees(&self) -> Result<(U256, U256), ProviderError> {
        self.call(self.provider.estimate_eip1559_fees(None)).await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ProviderError> {
        let pending = self.call(self.provider.send_raw_transaction(raw)).await?;
        Ok(*pending)
    }
}

/// [`PushProvider`] over an ethers websocket provider.
#[derive(Debug, Clone)]
pub struct EthersPush {
    provider: Arc<Provider<Ws>>,
    endpoint: String,
}

impl EthersPush {
    pub async fn connect(url: &str) -> Result<Self, ProviderError> {
        let provider = Provider::<Ws>::connect(url)
            .await
            .map_err(|e| classify_error(url, e))?;
        Ok(Self {
            provider: Arc::new(provider),
            endpoint: url.to_string(),
        })
    }
}

#[async_trait]
impl PushProvider for EthersPush {
    async fn subscribe(
        &self,
        topic: SubscriptionTopic,
    ) -> Result<mpsc::Receiver<serde_json::Value>, ProviderError> {
        let provider = self.provider.clone();
        let endpoint = self.endpoint.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            let mut stream = match provider
                .subscribe::<_, serde_json::Value>(topic.params())
                .await
            {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(classify_error(&endpoint, e)));
                    return;
                }
            };
            debug!(target: "subscriptions", "Subscribed to {} on {}", topic.name(), endpoint);

            while let Some(payload) = stream.next().await {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(target: "subscriptions", "Subscription to {} on {} ended", topic.name(), endpoint);
        });

        ready_rx
            .await
            .map_err(|_| ProviderError::ConnectionRefused {
                endpoint: self.endpoint.clone(),
                reason: "subscription task exited".to_string(),
            })??;
        Ok(rx)
    }

    async fn once_confirmed(&self, hash: H256) -> Result<oneshot::Receiver<Receipt>, ProviderError> {
        let mut heads = self.subscribe(SubscriptionTopic::NewHeads).await?;
        let provider = self.provider.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    return;
                }
                match provider.get_transaction_receipt(hash).await {
                    Ok(Some(receipt)) => {
                        let _ = tx.send(Receipt::from(&receipt));
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(target: "subscriptions", "Receipt lookup for {:?} failed: {}", hash, e),
                }
                if heads.recv().await.is_none() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

/// Everything the service holds for one configured network.
#[derive(Clone)]
pub struct NetworkClients {
    pub network: Network,
    pub node: Arc<dyn NodeProvider>,
    /// Absent when the network has no websocket endpoint.
    pub push: Option<Arc<dyn PushProvider>>,
    pub assets: Arc<dyn AssetIndex>,
}

impl NetworkClients {
    pub fn new(
        network: Network,
        node: Arc<dyn NodeProvider>,
        push: Option<Arc<dyn PushProvider>>,
        assets: Arc<dyn AssetIndex>,
    ) -> Self {
        Self {
            network,
            node,
            push,
            assets,
        }
    }

    pub async fn connect(config: &NetworkConfig) -> Result<Self, ServiceError> {
        let network = Network::from(config);
        let node = EthersNode::connect_http(&config.rpc_url, network.clone())?;
        let assets = AlchemyAssetIndex::connect(config.asset_index_endpoint(), network.clone())?;

        let push: Option<Arc<dyn PushProvider>> = match &config.ws_url {
            Some(url) => Some(Arc::new(EthersPush::connect(url).await?)),
            None => None,
        };

        Ok(Self::new(network, Arc::new(node), push, Arc::new(assets)))
    }
}
