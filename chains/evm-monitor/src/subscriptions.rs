use crate::cache::ChainCache;
use crate::error::ServiceError;
use crate::nonce::NonceAllocator;
use crate::provider::{NetworkClients, SubscriptionTopic};
use crate::types::{AddressNetwork, Block, Network, Receipt, Transaction, TransactionSource};
use core_logic::{MetricsCollector, SubscriptionPayloadError};
use ethers::types::H256;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type WatchKey = (u64, H256);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    topic: &str,
    payload: serde_json::Value,
) -> Result<T, SubscriptionPayloadError> {
    serde_json::from_value(payload).map_err(|e| SubscriptionPayloadError::Malformed {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

/// Normalizes a `newHeads` payload.
pub fn block_from_payload(
    network: &Network,
    payload: serde_json::Value,
) -> Result<Block, SubscriptionPayloadError> {
    let head: ethers::types::Block<H256> = parse_payload("newHeads", payload)?;
    if head.hash.is_none() {
        return Err(SubscriptionPayloadError::MissingField {
            topic: "newHeads".to_string(),
            field: "hash".to_string(),
        });
    }
    Block::from_ethers(&head, network).ok_or_else(|| SubscriptionPayloadError::MissingField {
        topic: "newHeads".to_string(),
        field: "number".to_string(),
    })
}

/// Normalizes an `alchemy_pendingTransactions` payload.
pub fn transaction_from_payload(
    network: &Network,
    payload: serde_json::Value,
) -> Result<Transaction, SubscriptionPayloadError> {
    let tx: ethers::types::Transaction = parse_payload("alchemy_pendingTransactions", payload)?;
    Ok(Transaction::from_ethers(&tx, network))
}

/// Owns every push stream and confirmation watch of the service.
///
/// Cloning yields a handle to the same state.
#[derive(Clone)]
pub struct SubscriptionManager {
    cache: Arc<ChainCache>,
    nonces: Arc<NonceAllocator>,
    streams: Arc<Mutex<Vec<JoinHandle<()>>>>,
    pending_accounts: Arc<Mutex<HashSet<AddressNetwork>>>,
    watches: Arc<Mutex<HashMap<WatchKey, JoinHandle<()>>>>,
}

impl SubscriptionManager {
    pub fn new(cache: Arc<ChainCache>, nonces: Arc<NonceAllocator>) -> Self {
        Self {
            cache,
            nonces,
            streams: Arc::default(),
            pending_accounts: Arc::default(),
            watches: Arc::default(),
        }
    }

    pub async fn subscribe_new_heads(&self, clients: &NetworkClients) -> Result<(), ServiceError> {
        let Some(push) = &clients.push else {
            debug!(target: "subscriptions", "No push endpoint for {}; heads come from polling", clients.network);
            return Ok(());
        };
        let payloads = push.subscribe(SubscriptionTopic::NewHeads).await?;
        let manager = self.clone();
        let network = clients.network.clone();

        let handle = tokio::spawn(async move {
            manager
                .consume(payloads, "newHeads", |payload| {
                    let manager = manager.clone();
                    let network = network.clone();
                    async move { manager.handle_new_head(&network, payload).await }
                })
                .await;
        });
        lock(&self.streams).push(handle);
        info!(target: "subscriptions", "Subscribed to new heads on {}", clients.network);
        Ok(())
    }

    /// Subscribes to pending transactions of `address`. Subscribing twice is
    /// a no-op.
    pub async fn subscribe_pending_transactions(
        &self,
        clients: &NetworkClients,
        account: &AddressNetwork,
    ) -> Result<(), ServiceError> {
        let Some(push) = &clients.push else {
            return Ok(());
        };
        if !lock(&self.pending_accounts).insert(account.clone()) {
            return Ok(());
        }

        let payloads = match push
            .subscribe(SubscriptionTopic::PendingTransactions {
                address: account.address,
            })
            .await
        {
            Ok(payloads) => payloads,
            Err(e) => {
                lock(&self.pending_accounts).remove(account);
                return Err(e.into());
            }
        };

        let manager = self.clone();
        let clients = clients.clone();
        let handle = tokio::spawn(async move {
            manager
                .consume(payloads, "alchemy_pendingTransactions", |payload| {
                    let manager = manager.clone();
                    let clients = clients.clone();
                    async move { manager.handle_pending_transaction(&clients, payload).await }
                })
                .await;
        });
        lock(&self.streams).push(handle);
        info!(target: "subscriptions", "Watching pending transactions of {}", account);
        Ok(())
    }

    async fn consume<F, Fut>(
        &self,
        mut payloads: mpsc::Receiver<serde_json::Value>,
        topic: &'static str,
        handler: F,
    ) where
        F: Fn(serde_json::Value) -> Fut,
        Fut: std::future::Future<Output = Result<(), ServiceError>>,
    {
        while let Some(payload) = payloads.recv().await {
            match handler(payload).await {
                Ok(()) => {}
                Err(ServiceError::Payload(e)) => {
                    warn!(target: "subscriptions", "Dropping {} payload: {}", topic, e);
                    MetricsCollector::global().record_dropped_payload();
                }
                Err(e) => warn!(target: "subscriptions", "Handling {} payload failed: {}", topic, e),
            }
        }
        debug!(target: "subscriptions", "{} stream closed", topic);
    }

    pub async fn handle_new_head(
        &self,
        network: &Network,
        payload: serde_json::Value,
    ) -> Result<(), ServiceError> {
        let block = block_from_payload(network, payload)?;
        self.cache.save_block(block).await
    }

    pub async fn handle_pending_transaction(
        &self,
        clients: &NetworkClients,
        payload: serde_json::Value,
    ) -> Result<(), ServiceError> {
        let transaction = transaction_from_payload(&clients.network, payload)?;
        if let Some(nonce) = transaction.nonce {
            self.nonces
                .observe(clients.network.chain_id, transaction.from, nonce.low_u64())
                .await;
        }

        let hash = transaction.hash;
        let saved = self
            .cache
            .save_transaction(transaction, TransactionSource::Push)
            .await?;
        if saved.is_pending() {
            self.watch_confirmation(clients, hash).await?;
        }
        Ok(())
    }

    /// Arms a one-shot watch that merges the receipt of `hash` into the
    /// cache once it is mined. Returns `false` when already armed.
    pub async fn watch_confirmation(
        &self,
        clients: &NetworkClients,
        hash: H256,
    ) -> Result<bool, ServiceError> {
        let Some(push) = &clients.push else {
            return Ok(false);
        };
        let key = (clients.network.chain_id, hash);
        if lock(&self.watches).contains_key(&key) {
            return Ok(false);
        }

        let confirmation = push.once_confirmed(hash).await?;
        let manager = self.clone();
        let clients = clients.clone();

        let mut watches = lock(&self.watches);
        if watches.contains_key(&key) {
            return Ok(false);
        }
        let handle = tokio::spawn(async move {
            if let Ok(receipt) = confirmation.await {
                if let Err(e) = manager.handle_receipt(&clients, receipt).await {
                    warn!(target: "subscriptions", "Applying receipt for {:?} failed: {}", hash, e);
                }
            }
            lock(&manager.watches).remove(&key);
        });
        watches.insert(key, handle);
        debug!(target: "subscriptions", "Armed confirmation watch for {:?}", hash);
        Ok(true)
    }

    pub fn disarm(&self, chain_id: u64, hash: H256) {
        if let Some(handle) = lock(&self.watches).remove(&(chain_id, hash)) {
            handle.abort();
        }
    }

    pub fn is_watching(&self, chain_id: u64, hash: H256) -> bool {
        lock(&self.watches).contains_key(&(chain_id, hash))
    }

    async fn handle_receipt(
        &self,
        clients: &NetworkClients,
        receipt: Receipt,
    ) -> Result<(), ServiceError> {
        let hash = receipt.transaction_hash;
        let cached = self.cache.store().get_transaction(&clients.network, hash).await?;
        let transaction = match cached {
            Some(transaction) => transaction,
            None => clients
                .node
                .get_transaction(hash)
                .await?
                .ok_or_else(|| ServiceError::NotFound {
                    entity: "transaction",
                    key: format!("{:?}", hash),
                    chain_id: clients.network.chain_id,
                })?,
        };
        self.cache.apply_receipt(transaction, &receipt).await?;
        Ok(())
    }

    /// Ends every stream and disarms every watch.
    pub fn shutdown(&self) {
        for handle in lock(&self.streams).drain(..) {
            handle.abort();
        }
        for (_, handle) in lock(&self.watches).drain() {
            handle.abort();
        }
        lock(&self.pending_accounts).clear();
    }
}
