//! EVM Monitor - multi-network chain data service built on ethers
//!
//! Tracks accounts across several EVM networks, keeps a local cache of blocks
//! and transactions up to date, backfills asset-transfer history and helps
//! prepare and broadcast transactions.
//!
//! # Architecture
//!
//! - **[`ChainService`]**: facade owning every component below, with a
//!   create/start/stop lifecycle
//! - **[`NodeProvider`] / [`PushProvider`]**: request/response and
//!   websocket access to a node
//! - **[`AssetIndex`]**: transfer history from `alchemy_getAssetTransfers`
//! - **[`Store`]**: persistence, in memory or SQLite
//! - **[`EventBus`]**: typed publish/subscribe of blocks, transactions,
//!   balances, transfers and block prices
//! - **[`NonceAllocator`]**: per-account nonce counter seeded from the node
//! - **[`RetrievalQueue`]**: deduplicated FIFO of hashes awaiting a fetch
//! - **[`HistoricLoader`]**: windowed backward scans of transfer history
//!
//! # Quick Start
//!
//! ```bash
//! cargo run -p evm-monitor -- --config chains/evm-monitor/config.toml \
//!     --track 0x00000000219ab540356cBB839Cbe05303d7705Fa@1
//! ```
//!
//! # Consuming events
//!
//! ```rust,no_run
//! use evm_monitor::{topics, ChainService};
//!
//! # async fn example(service: &ChainService) {
//! let mut blocks = service.events().subscribe::<topics::Block>();
//! while let Ok(block) = blocks.recv().await {
//!     println!("{} #{}", block.network, block.height);
//! }
//! # }
//! ```

pub mod alarms;
pub mod asset_index;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod historic;
pub mod nonce;
pub mod populator;
pub mod provider;
pub mod queue;
pub mod service;
pub mod store;
pub mod subscriptions;
pub mod types;

pub use asset_index::{AlchemyAssetIndex, AssetIndex};
pub use config::MonitorConfig;
pub use error::ServiceError;
pub use events::{topics, AssetTransfersEvent, EventBus, EventKind, Topic, TransactionEvent};
pub use historic::{ContinuationOutcome, HistoricLoader};
pub use nonce::NonceAllocator;
pub use populator::{PartialTransactionRequest, PopulatedRequest, TransactionRequest};
pub use provider::{NetworkClients, NodeProvider, PushProvider, SubscriptionTopic};
pub use queue::RetrievalQueue;
pub use service::ChainService;
pub use store::{MemoryStore, SqliteStore, Store};
pub use types::{
    AccountBalance, AddressNetwork, AssetTransfer, Block, BlockPrices, Network, Receipt,
    SignedTransaction, Transaction, TransactionSource, TransferDirection,
};
