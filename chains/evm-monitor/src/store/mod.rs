//! Persistence of tracked accounts and cached chain data.
//!
//! [`MemoryStore`] keeps everything in process, [`SqliteStore`] survives
//! restarts.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::types::{AccountBalance, AddressNetwork, Block, Network, Transaction, TransactionSource};
use async_trait::async_trait;
use core_logic::PersistenceError;
use ethers::types::H256;

#[async_trait]
pub trait Store: Send + Sync {
    async fn add_account_to_track(&self, account: &AddressNetwork) -> Result<(), PersistenceError>;

    async fn get_accounts_to_track(&self) -> Result<Vec<AddressNetwork>, PersistenceError>;

    /// Inserts or replaces the block keyed by `(network, hash)`.
    async fn add_block(&self, block: &Block) -> Result<(), PersistenceError>;

    async fn get_block(&self, network: &Network, hash: H256) -> Result<Option<Block>, PersistenceError>;

    /// Highest cached block on `network`.
    async fn get_latest_block(&self, network: &Network) -> Result<Option<Block>, PersistenceError>;

    /// Inserts or replaces the transaction keyed by `(network, hash)`.
    async fn add_or_update_transaction(
        &self,
        transaction: &Transaction,
        source: TransactionSource,
    ) -> Result<(), PersistenceError>;

    async fn get_transaction(
        &self,
        network: &Network,
        hash: H256,
    ) -> Result<Option<Transaction>, PersistenceError>;

    async fn record_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
        start_block: u64,
        end_block: u64,
    ) -> Result<(), PersistenceError>;

    /// Lowest `start_block` of any recorded lookup.
    async fn get_oldest_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
    ) -> Result<Option<u64>, PersistenceError>;

    /// Highest `end_block` of any recorded lookup.
    async fn get_newest_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
    ) -> Result<Option<u64>, PersistenceError>;

    async fn add_account_balance(&self, balance: &AccountBalance) -> Result<(), PersistenceError>;

    async fn get_latest_account_balance(
        &self,
        account: &AddressNetwork,
        asset: &str,
    ) -> Result<Option<AccountBalance>, PersistenceError>;
}
