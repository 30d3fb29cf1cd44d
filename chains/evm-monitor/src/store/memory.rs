use super::Store;
use crate::types::{AccountBalance, AddressNetwork, Block, Network, Transaction, TransactionSource};
use async_trait::async_trait;
use core_logic::PersistenceError;
use ethers::types::H256;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    accounts: Vec<AddressNetwork>,
    blocks: HashMap<(u64, H256), Block>,
    transactions: HashMap<(u64, H256), (Transaction, TransactionSource)>,
    lookups: HashMap<AddressNetwork, Vec<(u64, u64)>>,
    /// Latest balance per account and asset.
    balances: HashMap<(AddressNetwork, String), AccountBalance>,
}

/// In-process [`Store`]. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source recorded with the latest write of a transaction.
    pub async fn transaction_source(&self, network: &Network, hash: H256) -> Option<TransactionSource> {
        let state = self.state.read().await;
        state
            .transactions
            .get(&(network.chain_id, hash))
            .map(|(_, source)| *source)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_account_to_track(&self, account: &AddressNetwork) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        if !state.accounts.contains(account) {
            state.accounts.push(account.clone());
        }
        Ok(())
    }

    async fn get_accounts_to_track(&self) -> Result<Vec<AddressNetwork>, PersistenceError> {
        Ok(self.state.read().await.accounts.clone())
    }

    async fn add_block(&self, block: &Block) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        state
            .blocks
            .insert((block.network.chain_id, block.hash), block.clone());
        Ok(())
    }

    async fn get_block(&self, network: &Network, hash: H256) -> Result<Option<Block>, PersistenceError> {
        let state = self.state.read().await;
        Ok(state.blocks.get(&(network.chain_id, hash)).cloned())
    }

    async fn get_latest_block(&self, network: &Network) -> Result<Option<Block>, PersistenceError> {
        let state = self.state.read().await;
        Ok(state
            .blocks
            .values()
            .filter(|b| b.network.chain_id == network.chain_id)
            .max_by_key(|b| b.height)
            .cloned())
    }

    async fn add_or_update_transaction(
        &self,
        transaction: &Transaction,
        source: TransactionSource,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        state.transactions.insert(
            (transaction.network.chain_id, transaction.hash),
            (transaction.clone(), source),
        );
        Ok(())
    }

    async fn get_transaction(
        &self,
        network: &Network,
        hash: H256,
    ) -> Result<Option<Transaction>, PersistenceError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .get(&(network.chain_id, hash))
            .map(|(tx, _)| tx.clone()))
    }

    async fn record_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
        start_block: u64,
        end_block: u64,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        state
            .lookups
            .entry(account.clone())
            .or_default()
            .push((start_block, end_block));
        Ok(())
    }

    async fn get_oldest_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
    ) -> Result<Option<u64>, PersistenceError> {
        let state = self.state.read().await;
        Ok(state
            .lookups
            .get(account)
            .and_then(|ranges| ranges.iter().map(|(start, _)| *start).min()))
    }

    async fn get_newest_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
    ) -> Result<Option<u64>, PersistenceError> {
        let state = self.state.read().await;
        Ok(state
            .lookups
            .get(account)
            .and_then(|ranges| ranges.iter().map(|(_, end)| *end).max()))
    }

    async fn add_account_balance(&self, balance: &AccountBalance) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let key = (balance.address_network.clone(), balance.asset.clone());
        let newer = |b: &AccountBalance| {
            (balance.block_height, balance.retrieved_at) >= (b.block_height, b.retrieved_at)
        };
        if state.balances.get(&key).map_or(true, newer) {
            state.balances.insert(key, balance.clone());
        }
        Ok(())
    }

    async fn get_latest_account_balance(
        &self,
        account: &AddressNetwork,
        asset: &str,
    ) -> Result<Option<AccountBalance>, PersistenceError> {
        let state = self.state.read().await;
        Ok(state
            .balances
            .get(&(account.clone(), asset.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;

    fn account() -> AddressNetwork {
        AddressNetwork::new(Address::repeat_byte(1), Network::new("sepolia", 11155111, "ETH"))
    }

    #[tokio::test]
    async fn test_accounts_are_deduplicated() {
        let store = MemoryStore::new();
        store.add_account_to_track(&account()).await.unwrap();
        store.add_account_to_track(&account()).await.unwrap();

        assert_eq!(store.get_accounts_to_track().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_watermarks() {
        let store = MemoryStore::new();
        let account = account();
        assert_eq!(
            store.get_oldest_account_asset_transfer_lookup(&account).await.unwrap(),
            None
        );

        store
            .record_account_asset_transfer_lookup(&account, 900, 1_000)
            .await
            .unwrap();
        store
            .record_account_asset_transfer_lookup(&account, 800, 900)
            .await
            .unwrap();

        assert_eq!(
            store.get_oldest_account_asset_transfer_lookup(&account).await.unwrap(),
            Some(800)
        );
        assert_eq!(
            store.get_newest_account_asset_transfer_lookup(&account).await.unwrap(),
            Some(1_000)
        );
    }

    #[tokio::test]
    async fn test_only_latest_balance_is_kept() {
        let store = MemoryStore::new();
        let balance = |amount: u64, block_height: u64| AccountBalance {
            address_network: account(),
            asset: "ETH".to_string(),
            amount: amount.into(),
            block_height,
            retrieved_at: 1_700_000_000,
        };
        for (amount, height) in [(1, 10), (3, 30), (2, 20)] {
            store.add_account_balance(&balance(amount, height)).await.unwrap();
        }

        let latest = store
            .get_latest_account_balance(&account(), "ETH")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.amount.as_u64(), 3);
        assert_eq!(store.state.read().await.balances.len(), 1);
        assert!(store
            .get_latest_account_balance(&account(), "USDC")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_latest_block_per_network() {
        let store = MemoryStore::new();
        let sepolia = Network::new("sepolia", 11155111, "ETH");
        let mainnet = Network::new("ethereum", 1, "ETH");
        for (height, network) in [(5, &sepolia), (9, &mainnet), (7, &sepolia)] {
            let block = Block {
                hash: H256::from_low_u64_be(height),
                parent_hash: H256::zero(),
                height,
                timestamp: 0,
                base_fee_per_gas: None,
                network: network.clone(),
            };
            store.add_block(&block).await.unwrap();
        }

        let latest = store.get_latest_block(&sepolia).await.unwrap().unwrap();
        assert_eq!(latest.height, 7);
    }
}
