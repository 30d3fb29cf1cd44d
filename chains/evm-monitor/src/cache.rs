use crate::error::ServiceError;
use crate::events::{topics, EventBus, TransactionEvent};
use crate::provider::NodeProvider;
use crate::store::Store;
use crate::types::{Block, Network, Receipt, Transaction, TransactionSource};
use core_logic::MetricsCollector;
use ethers::types::{BlockId, H256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error};

type TransactionKey = (u64, H256);
type WriteSlot = Arc<AsyncMutex<()>>;

/// Write path shared by subscriptions, retrieval and broadcast.
///
/// Every write persists first and publishes second. A failure in one step
/// does not skip the other; the first failure is returned afterwards.
/// Writes of the same transaction are serialized so that a merge never
/// works from a stale read.
pub struct ChainCache {
    store: Arc<dyn Store>,
    events: EventBus,
    writes: Mutex<HashMap<TransactionKey, WriteSlot>>,
}

impl ChainCache {
    pub fn new(store: Arc<dyn Store>, events: EventBus) -> Self {
        Self {
            store,
            events,
            writes: Mutex::new(HashMap::new()),
        }
    }

    fn write_slot(&self, key: TransactionKey) -> WriteSlot {
        let mut writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        writes.entry(key).or_default().clone()
    }

    /// Drops the slot once no other writer holds it.
    fn release_slot(&self, key: TransactionKey, slot: WriteSlot) {
        let mut writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&slot) <= 2 {
            writes.remove(&key);
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn save_block(&self, block: Block) -> Result<(), ServiceError> {
        let persisted = self.store.add_block(&block).await;
        match &persisted {
            Ok(()) => MetricsCollector::global().record_block_saved(),
            Err(e) => {
                error!(
                    "Failed to persist block {} on {}: {}",
                    block.height, block.network, e
                );
                MetricsCollector::global().record_save_failure();
            }
        }

        self.events.emit::<topics::Block>(block);
        persisted.map_err(ServiceError::from)
    }

    /// Merges `transaction` over the stored view, persists and publishes it.
    pub async fn save_transaction(
        &self,
        transaction: Transaction,
        source: TransactionSource,
    ) -> Result<Transaction, ServiceError> {
        let key = (transaction.network.chain_id, transaction.hash);
        let slot = self.write_slot(key);
        let saved = {
            let _guard = slot.lock().await;
            self.merge_and_save(transaction, source).await
        };
        self.release_slot(key, slot);
        saved
    }

    async fn merge_and_save(
        &self,
        transaction: Transaction,
        source: TransactionSource,
    ) -> Result<Transaction, ServiceError> {
        let (merged, persisted) = match self
            .store
            .get_transaction(&transaction.network, transaction.hash)
            .await
        {
            Ok(existing) => {
                let merged = match existing {
                    Some(stored) => transaction.merged_over(&stored),
                    None => transaction,
                };
                let persisted = self.store.add_or_update_transaction(&merged, source).await;
                (merged, persisted)
            }
            Err(e) => (transaction, Err(e)),
        };

        match &persisted {
            Ok(()) => MetricsCollector::global().record_transaction_saved(),
            Err(e) => {
                error!(
                    "Failed to persist transaction {:?} on {}: {}",
                    merged.hash, merged.network, e
                );
                MetricsCollector::global().record_save_failure();
            }
        }

        let published = self.publish_transaction(&merged).await;
        if let Err(e) = &published {
            error!(
                "Failed to publish transaction {:?} on {}: {}",
                merged.hash, merged.network, e
            );
        }

        persisted?;
        published?;
        Ok(merged)
    }

    async fn publish_transaction(&self, transaction: &Transaction) -> Result<(), ServiceError> {
        let accounts = self.store.get_accounts_to_track().await?;
        let for_accounts = accounts
            .into_iter()
            .filter(|a| {
                a.network.chain_id == transaction.network.chain_id && transaction.involves(a.address)
            })
            .collect();

        self.events.emit::<topics::Transaction>(TransactionEvent {
            transaction: transaction.clone(),
            for_accounts,
        });
        Ok(())
    }

    /// Fetches the full transaction and, once mined, its receipt.
    pub async fn retrieve_transaction(
        &self,
        node: &dyn NodeProvider,
        network: &Network,
        hash: H256,
    ) -> Result<Transaction, ServiceError> {
        let transaction = node
            .get_transaction(hash)
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                entity: "transaction",
                key: format!("{:?}", hash),
                chain_id: network.chain_id,
            })?;
        let saved = self
            .save_transaction(transaction, TransactionSource::Node)
            .await?;
        if saved.is_pending() {
            return Ok(saved);
        }

        match node.get_transaction_receipt(hash).await? {
            Some(receipt) => self.apply_receipt(saved, &receipt).await,
            None => Ok(saved),
        }
    }

    pub async fn apply_receipt(
        &self,
        transaction: Transaction,
        receipt: &Receipt,
    ) -> Result<Transaction, ServiceError> {
        debug!(
            "Applying receipt for {:?} (block {:?})",
            transaction.hash, receipt.block_height
        );
        self.save_transaction(transaction.with_receipt(receipt), TransactionSource::Node)
            .await
    }

    /// Cached block, falling back to the node on a miss.
    pub async fn get_block(
        &self,
        node: &dyn NodeProvider,
        network: &Network,
        hash: H256,
    ) -> Result<Block, ServiceError> {
        if let Some(block) = self.store.get_block(network, hash).await? {
            return Ok(block);
        }

        let block = node
            .get_block(BlockId::Hash(hash))
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                entity: "block",
                key: format!("{:?}", hash),
                chain_id: network.chain_id,
            })?;
        self.save_block(block.clone()).await?;
        Ok(block)
    }

    /// Cached transaction, falling back to the node on a miss.
    pub async fn get_transaction(
        &self,
        node: &dyn NodeProvider,
        network: &Network,
        hash: H256,
    ) -> Result<Transaction, ServiceError> {
        match self.store.get_transaction(network, hash).await? {
            Some(transaction) => Ok(transaction),
            None => self.retrieve_transaction(node, network, hash).await,
        }
    }
}
