use super::Store;
use crate::types::{AccountBalance, AddressNetwork, Block, Network, Transaction, TransactionSource};
use async_trait::async_trait;
use core_logic::PersistenceError;
use ethers::types::H256;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS accounts (
        chain_id INTEGER NOT NULL,
        address TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (chain_id, address)
    );",
    "CREATE TABLE IF NOT EXISTS blocks (
        chain_id INTEGER NOT NULL,
        hash TEXT NOT NULL,
        height INTEGER NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (chain_id, hash)
    );",
    "CREATE TABLE IF NOT EXISTS transactions (
        chain_id INTEGER NOT NULL,
        hash TEXT NOT NULL,
        source TEXT NOT NULL,
        data TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (chain_id, hash)
    );",
    "CREATE TABLE IF NOT EXISTS asset_transfer_lookups (
        id INTEGER PRIMARY KEY,
        chain_id INTEGER NOT NULL,
        address TEXT NOT NULL,
        start_block INTEGER NOT NULL,
        end_block INTEGER NOT NULL,
        recorded_at INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS balances (
        id INTEGER PRIMARY KEY,
        chain_id INTEGER NOT NULL,
        address TEXT NOT NULL,
        asset TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        data TEXT NOT NULL,
        retrieved_at INTEGER NOT NULL
    );",
];

const INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS idx_blocks_height ON blocks(chain_id, height);",
    "CREATE INDEX IF NOT EXISTS idx_lookups_account ON asset_transfer_lookups(chain_id, address);",
    "CREATE INDEX IF NOT EXISTS idx_balances_account ON balances(chain_id, address, asset);",
];

fn address_key(account: &AddressNetwork) -> String {
    format!("{:?}", account.address)
}

fn hash_key(hash: H256) -> String {
    format!("{:?}", hash)
}

fn encode<T: Serialize>(entity: &str, value: &T) -> Result<String, PersistenceError> {
    serde_json::to_string(value).map_err(|e| PersistenceError::WriteFailed {
        entity: entity.to_string(),
        msg: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, data: &str) -> Result<T, PersistenceError> {
    serde_json::from_str(data).map_err(|e| PersistenceError::Corrupt {
        key: key.to_string(),
        msg: e.to_string(),
    })
}

fn write_failed(entity: &str) -> impl Fn(sqlx::Error) -> PersistenceError + '_ {
    move |e| PersistenceError::WriteFailed {
        entity: entity.to_string(),
        msg: e.to_string(),
    }
}

fn read_failed(entity: &str) -> impl Fn(sqlx::Error) -> PersistenceError + '_ {
    move |e| PersistenceError::ReadFailed {
        entity: entity.to_string(),
        msg: e.to_string(),
    }
}

/// [`Store`] on a SQLite file in WAL mode.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;
    pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

    pub async fn open(db_path: &str) -> Result<Self, PersistenceError> {
        if !Path::new(db_path).exists() {
            std::fs::File::create(db_path).map_err(|e| PersistenceError::MigrationFailed {
                msg: format!("cannot create {}: {}", db_path, e),
            })?;
            info!("Created new database file: {}", db_path);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_millis(Self::DEFAULT_TIMEOUT_MS))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous=NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite://{}", db_path))
            .await
            .map_err(|e| PersistenceError::MigrationFailed { msg: e.to_string() })?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(
            "Database initialized with pool size {} (WAL Mode)",
            Self::DEFAULT_MAX_CONNECTIONS
        );
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), PersistenceError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|_| PersistenceError::PoolExhausted {
                max_size: Self::DEFAULT_MAX_CONNECTIONS,
            })?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| PersistenceError::MigrationFailed { msg: e.to_string() })?;
        }

        for idx_sql in INDEXES {
            if let Err(e) = sqlx::query(idx_sql).execute(&mut *conn).await {
                debug!("Index creation skipped (may exist): {}", e);
            }
        }
        Ok(())
    }

    async fn lookup_bound(
        &self,
        account: &AddressNetwork,
        query: &str,
    ) -> Result<Option<u64>, PersistenceError> {
        let bound: Option<i64> = sqlx::query_scalar(query)
            .bind(account.network.chain_id as i64)
            .bind(address_key(account))
            .fetch_one(&self.pool)
            .await
            .map_err(read_failed("asset_transfer_lookups"))?;
        Ok(bound.map(|b| b as u64))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn add_account_to_track(&self, account: &AddressNetwork) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO accounts (chain_id, address, data, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(chain_id, address) DO NOTHING",
        )
        .bind(account.network.chain_id as i64)
        .bind(address_key(account))
        .bind(encode("account", account)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(write_failed("account"))?;
        Ok(())
    }

    async fn get_accounts_to_track(&self) -> Result<Vec<AddressNetwork>, PersistenceError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT address, data FROM accounts ORDER BY created_at, address")
                .fetch_all(&self.pool)
                .await
                .map_err(read_failed("accounts"))?;
        rows.iter()
            .map(|(address, data)| decode(address, data))
            .collect()
    }

    async fn add_block(&self, block: &Block) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO blocks (chain_id, hash, height, data) VALUES (?, ?, ?, ?)
             ON CONFLICT(chain_id, hash) DO UPDATE SET height = excluded.height, data = excluded.data",
        )
        .bind(block.network.chain_id as i64)
        .bind(hash_key(block.hash))
        .bind(block.height as i64)
        .bind(encode("block", block)?)
        .execute(&self.pool)
        .await
        .map_err(write_failed("block"))?;
        Ok(())
    }

    async fn get_block(&self, network: &Network, hash: H256) -> Result<Option<Block>, PersistenceError> {
        let key = hash_key(hash);
        let data: Option<String> =
            sqlx::query_scalar("SELECT data FROM blocks WHERE chain_id = ? AND hash = ?")
                .bind(network.chain_id as i64)
                .bind(&key)
                .fetch_optional(&self.pool)
                .await
                .map_err(read_failed("block"))?;
        data.map(|d| decode(&key, &d)).transpose()
    }

    async fn get_latest_block(&self, network: &Network) -> Result<Option<Block>, PersistenceError> {
        let data: Option<String> = sqlx::query_scalar(
            "SELECT data FROM blocks WHERE chain_id = ? ORDER BY height DESC LIMIT 1",
        )
        .bind(network.chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_failed("block"))?;
        data.map(|d| decode("latest block", &d)).transpose()
    }

    async fn add_or_update_transaction(
        &self,
        transaction: &Transaction,
        source: TransactionSource,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO transactions (chain_id, hash, source, data, updated_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(chain_id, hash) DO UPDATE SET
                source = excluded.source,
                data = excluded.data,
                updated_at = excluded.updated_at",
        )
        .bind(transaction.network.chain_id as i64)
        .bind(hash_key(transaction.hash))
        .bind(source.as_str())
        .bind(encode("transaction", transaction)?)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(write_failed("transaction"))?;
        Ok(())
    }

    async fn get_transaction(
        &self,
        network: &Network,
        hash: H256,
    ) -> Result<Option<Transaction>, PersistenceError> {
        let key = hash_key(hash);
        let data: Option<String> =
            sqlx::query_scalar("SELECT data FROM transactions WHERE chain_id = ? AND hash = ?")
                .bind(network.chain_id as i64)
                .bind(&key)
                .fetch_optional(&self.pool)
                .await
                .map_err(read_failed("transaction"))?;
        data.map(|d| decode(&key, &d)).transpose()
    }

    async fn record_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
        start_block: u64,
        end_block: u64,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO asset_transfer_lookups (chain_id, address, start_block, end_block, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(account.network.chain_id as i64)
        .bind(address_key(account))
        .bind(start_block as i64)
        .bind(end_block as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(write_failed("asset_transfer_lookup"))?;
        Ok(())
    }

    async fn get_oldest_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
    ) -> Result<Option<u64>, PersistenceError> {
        self.lookup_bound(
            account,
            "SELECT MIN(start_block) FROM asset_transfer_lookups WHERE chain_id = ? AND address = ?",
        )
        .await
    }

    async fn get_newest_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
    ) -> Result<Option<u64>, PersistenceError> {
        self.lookup_bound(
            account,
            "SELECT MAX(end_block) FROM asset_transfer_lookups WHERE chain_id = ? AND address = ?",
        )
        .await
    }

    async fn add_account_balance(&self, balance: &AccountBalance) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO balances (chain_id, address, asset, block_height, data, retrieved_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(balance.address_network.network.chain_id as i64)
        .bind(address_key(&balance.address_network))
        .bind(&balance.asset)
        .bind(balance.block_height as i64)
        .bind(encode("balance", balance)?)
        .bind(balance.retrieved_at)
        .execute(&self.pool)
        .await
        .map_err(write_failed("balance"))?;
        Ok(())
    }

    async fn get_latest_account_balance(
        &self,
        account: &AddressNetwork,
        asset: &str,
    ) -> Result<Option<AccountBalance>, PersistenceError> {
        let data: Option<String> = sqlx::query_scalar(
            "SELECT data FROM balances WHERE chain_id = ? AND address = ? AND asset = ?
             ORDER BY block_height DESC, retrieved_at DESC LIMIT 1",
        )
        .bind(account.network.chain_id as i64)
        .bind(address_key(account))
        .bind(asset)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_failed("balance"))?;
        data.map(|d| decode("balance", &d)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, U256};
    use tempfile::tempdir;

    fn network() -> Network {
        Network::new("sepolia", 11155111, "ETH")
    }

    #[tokio::test]
    async fn test_transaction_upsert_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        let path = path.to_str().unwrap();

        let mut tx = Transaction::new(H256::repeat_byte(1), Address::repeat_byte(2), network());
        tx.value = Some(U256::from(10));
        {
            let store = SqliteStore::open(path).await.unwrap();
            store
                .add_or_update_transaction(&tx, TransactionSource::Push)
                .await
                .unwrap();
            tx.block_height = Some(77);
            store
                .add_or_update_transaction(&tx, TransactionSource::Node)
                .await
                .unwrap();
        }

        let store = SqliteStore::open(path).await.unwrap();
        let stored = store.get_transaction(&network(), tx.hash).await.unwrap().unwrap();
        assert_eq!(stored, tx);
        assert!(store
            .get_transaction(&network(), H256::repeat_byte(3))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_accounts_and_lookups() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        let store = SqliteStore::open(path.to_str().unwrap()).await.unwrap();
        let account = AddressNetwork::new(Address::repeat_byte(5), network());

        store.add_account_to_track(&account).await.unwrap();
        store.add_account_to_track(&account).await.unwrap();
        assert_eq!(store.get_accounts_to_track().await.unwrap(), vec![account.clone()]);

        assert_eq!(
            store.get_oldest_account_asset_transfer_lookup(&account).await.unwrap(),
            None
        );
        store
            .record_account_asset_transfer_lookup(&account, 1_000, 2_000)
            .await
            .unwrap();
        store
            .record_account_asset_transfer_lookup(&account, 500, 1_000)
            .await
            .unwrap();
        assert_eq!(
            store.get_oldest_account_asset_transfer_lookup(&account).await.unwrap(),
            Some(500)
        );
        assert_eq!(
            store.get_newest_account_asset_transfer_lookup(&account).await.unwrap(),
            Some(2_000)
        );
    }

    #[tokio::test]
    async fn test_latest_balance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        let store = SqliteStore::open(path.to_str().unwrap()).await.unwrap();
        let account = AddressNetwork::new(Address::repeat_byte(5), network());

        for (height, amount) in [(10u64, 1u64), (12, 3), (11, 2)] {
            store
                .add_account_balance(&AccountBalance {
                    address_network: account.clone(),
                    asset: "ETH".to_string(),
                    amount: U256::from(amount),
                    block_height: height,
                    retrieved_at: height as i64,
                })
                .await
                .unwrap();
        }

        let latest = store
            .get_latest_account_balance(&account, "ETH")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.amount, U256::from(3));
    }
}
