//! Scripted node, push and asset-index doubles for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use core_logic::{MonitorSettings, PersistenceError, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, BlockNumber, Bytes, H256, U256};
use evm_monitor::provider::{NetworkClients, NodeProvider, PushProvider, SubscriptionTopic};
use evm_monitor::store::Store;
use evm_monitor::types::{
    AccountBalance, AddressNetwork, AssetTransfer, Block, Network, Receipt, Transaction,
    TransactionSource,
};
use evm_monitor::{AssetIndex, ChainService, MemoryStore};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

pub const CHAIN_ID: u64 = 11155111;

pub fn network() -> Network {
    Network::new("sepolia", CHAIN_ID, "ETH")
}

pub fn account(byte: u8) -> AddressNetwork {
    AddressNetwork::new(Address::repeat_byte(byte), network())
}

pub fn block(height: u64) -> Block {
    Block {
        hash: H256::from_low_u64_be(height),
        parent_hash: H256::from_low_u64_be(height.saturating_sub(1)),
        height,
        timestamp: 1_700_000_000 + height * 12,
        base_fee_per_gas: Some(U256::from(7)),
        network: network(),
    }
}

pub fn transaction(byte: u8, from: Address) -> Transaction {
    let mut tx = Transaction::new(H256::repeat_byte(byte), from, network());
    tx.to = Some(Address::repeat_byte(0xee));
    tx.nonce = Some(U256::from(3));
    tx.value = Some(U256::from(1_000));
    tx
}

pub fn mined(mut tx: Transaction, height: u64) -> Transaction {
    tx.block_hash = Some(H256::from_low_u64_be(height));
    tx.block_height = Some(height);
    tx
}

pub fn receipt_for(hash: H256, height: u64) -> Receipt {
    Receipt {
        transaction_hash: hash,
        block_hash: Some(H256::from_low_u64_be(height)),
        block_height: Some(height),
        status: Some(1),
        gas_used: Some(U256::from(21_000)),
        effective_gas_price: Some(U256::from(9)),
    }
}

pub fn transfer(byte: u8, height: u64) -> AssetTransfer {
    AssetTransfer {
        tx_hash: H256::repeat_byte(byte),
        asset: "ETH".to_string(),
        amount: U256::from(5),
        counterparty: Some(Address::repeat_byte(0xcc)),
        direction: evm_monitor::TransferDirection::Incoming,
        block_height: height,
    }
}

fn rpc_error(msg: &str) -> ProviderError {
    ProviderError::Rpc {
        endpoint: "mock".to_string(),
        msg: msg.to_string(),
    }
}

/// What `estimate_gas` answers.
#[derive(Debug, Clone)]
pub enum GasEstimate {
    Value(U256),
    Unpredictable(String),
    Fail(ProviderError),
}

#[derive(Debug)]
struct NodeState {
    block_number: u64,
    latest: Option<Block>,
    blocks: HashMap<H256, Block>,
    balances: HashMap<Address, U256>,
    tx_counts: HashMap<Address, u64>,
    transactions: HashMap<H256, Transaction>,
    receipts: HashMap<H256, Receipt>,
    failing_transactions: HashSet<H256>,
    gas_estimate: GasEstimate,
    fees: (U256, U256),
    send_error: Option<ProviderError>,
    unreachable: bool,
    sent: Vec<Bytes>,
    estimated: Vec<TypedTransaction>,
    transaction_lookups: Vec<H256>,
    count_lookups: usize,
}

/// Scripted [`NodeProvider`].
#[derive(Debug)]
pub struct MockNode {
    state: Mutex<NodeState>,
}

impl MockNode {
    pub fn new(block_number: u64) -> Self {
        Self {
            state: Mutex::new(NodeState {
                block_number,
                latest: Some(block(block_number)),
                blocks: HashMap::new(),
                balances: HashMap::new(),
                tx_counts: HashMap::new(),
                transactions: HashMap::new(),
                receipts: HashMap::new(),
                failing_transactions: HashSet::new(),
                gas_estimate: GasEstimate::Value(U256::from(100_000)),
                fees: (U256::from(30), U256::from(2)),
                send_error: None,
                unreachable: false,
                sent: Vec::new(),
                estimated: Vec::new(),
                transaction_lookups: Vec::new(),
                count_lookups: 0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    pub fn set_head(&self, height: u64) {
        let mut state = self.state();
        state.block_number = height;
        state.latest = Some(block(height));
    }

    pub fn add_block(&self, block: Block) {
        self.state().blocks.insert(block.hash, block);
    }

    pub fn set_balance(&self, address: Address, amount: u64) {
        self.state().balances.insert(address, U256::from(amount));
    }

    pub fn set_transaction_count(&self, address: Address, count: u64) {
        self.state().tx_counts.insert(address, count);
    }

    pub fn add_transaction(&self, tx: Transaction) {
        self.state().transactions.insert(tx.hash, tx);
    }

    pub fn add_receipt(&self, receipt: Receipt) {
        self.state().receipts.insert(receipt.transaction_hash, receipt);
    }

    pub fn fail_transaction(&self, hash: H256) {
        self.state().failing_transactions.insert(hash);
    }

    pub fn heal_transaction(&self, hash: H256) {
        self.state().failing_transactions.remove(&hash);
    }

    pub fn set_gas_estimate(&self, estimate: GasEstimate) {
        self.state().gas_estimate = estimate;
    }

    pub fn fail_send(&self, error: ProviderError) {
        self.state().send_error = Some(error);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.state().sent.clone()
    }

    pub fn estimated(&self) -> Vec<TypedTransaction> {
        self.state().estimated.clone()
    }

    pub fn transaction_lookups(&self) -> Vec<H256> {
        self.state().transaction_lookups.clone()
    }

    pub fn count_lookups(&self) -> usize {
        self.state().count_lookups
    }

    fn reachable(&self) -> Result<(), ProviderError> {
        if self.state().unreachable {
            return Err(ProviderError::ConnectionRefused {
                endpoint: "mock".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NodeProvider for MockNode {
    fn endpoint(&self) -> &str {
        "mock"
    }

    async fn get_block_number(&self) -> Result<u64, ProviderError> {
        self.reachable()?;
        Ok(self.state().block_number)
    }

    async fn get_block(&self, id: BlockId) -> Result<Option<Block>, ProviderError> {
        self.reachable()?;
        let state = self.state();
        Ok(match id {
            BlockId::Hash(hash) => state.blocks.get(&hash).cloned(),
            BlockId::Number(BlockNumber::Number(n)) => state
                .blocks
                .values()
                .find(|b| b.height == n.as_u64())
                .cloned(),
            BlockId::Number(_) => state.latest.clone(),
        })
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ProviderError> {
        self.reachable()?;
        Ok(self.state().balances.get(&address).copied().unwrap_or_default())
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64, ProviderError> {
        self.reachable()?;
        let mut state = self.state();
        state.count_lookups += 1;
        Ok(state.tx_counts.get(&address).copied().unwrap_or_default())
    }

    async fn get_transaction(&self, hash: H256) -> Result<Option<Transaction>, ProviderError> {
        self.reachable()?;
        let mut state = self.state();
        state.transaction_lookups.push(hash);
        if state.failing_transactions.contains(&hash) {
            return Err(rpc_error("header not found"));
        }
        Ok(state.transactions.get(&hash).cloned())
    }

    async fn get_transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>, ProviderError> {
        self.reachable()?;
        Ok(self.state().receipts.get(&hash).cloned())
    }

    async fn estimate_gas(&self, request: &TypedTransaction) -> Result<U256, ProviderError> {
        self.reachable()?;
        let mut state = self.state();
        state.estimated.push(request.clone());
        match &state.gas_estimate {
            GasEstimate::Value(value) => Ok(*value),
            GasEstimate::Unpredictable(reason) => Err(ProviderError::UnpredictableGas {
                reason: reason.clone(),
            }),
            GasEstimate::Fail(error) => Err(error.clone()),
        }
    }

    async fn estimate_fees(&self) -> Result<(U256, U256), ProviderError> {
        self.reachable()?;
        Ok(self.state().fees)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ProviderError> {
        self.reachable()?;
        let mut state = self.state();
        if let Some(error) = state.send_error.clone() {
            return Err(error);
        }
        state.sent.push(raw.clone());
        Ok(H256::from(ethers::utils::keccak256(&raw)))
    }
}

/// [`PushProvider`] whose streams are fed by the test.
#[derive(Debug, Default)]
pub struct MockPush {
    streams: Mutex<HashMap<SubscriptionTopic, Vec<mpsc::Sender<serde_json::Value>>>>,
    confirmations: Mutex<HashMap<H256, oneshot::Sender<Receipt>>>,
    topics: Mutex<Vec<SubscriptionTopic>>,
    refuse: AtomicBool,
}

impl MockPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_subscriptions(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Every topic subscribed so far, in order.
    pub fn topics(&self) -> Vec<SubscriptionTopic> {
        self.topics.lock().unwrap().clone()
    }

    /// Delivers `payload` to every open stream of `topic`. Returns the number
    /// of streams reached.
    pub async fn push(&self, topic: &SubscriptionTopic, payload: serde_json::Value) -> usize {
        let senders = self
            .streams
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default();
        let mut delivered = 0;
        for sender in senders {
            if sender.send(payload.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn is_watching(&self, hash: H256) -> bool {
        self.confirmations
            .lock()
            .unwrap()
            .get(&hash)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Resolves the confirmation of `receipt.transaction_hash`.
    pub fn confirm(&self, receipt: Receipt) -> bool {
        match self.confirmations.lock().unwrap().remove(&receipt.transaction_hash) {
            Some(tx) => tx.send(receipt).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl PushProvider for MockPush {
    async fn subscribe(
        &self,
        topic: SubscriptionTopic,
    ) -> Result<mpsc::Receiver<serde_json::Value>, ProviderError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ProviderError::ConnectionRefused {
                endpoint: "mock-ws".to_string(),
                reason: "websocket closed".to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(16);
        self.topics.lock().unwrap().push(topic.clone());
        self.streams.lock().unwrap().entry(topic).or_default().push(tx);
        Ok(rx)
    }

    async fn once_confirmed(&self, hash: H256) -> Result<oneshot::Receiver<Receipt>, ProviderError> {
        let (tx, rx) = oneshot::channel();
        self.confirmations.lock().unwrap().insert(hash, tx);
        Ok(rx)
    }
}

/// [`AssetIndex`] answering from a script, then with empty results.
#[derive(Debug, Default)]
pub struct MockAssetIndex {
    script: Mutex<VecDeque<Result<Vec<AssetTransfer>, ProviderError>>>,
    calls: Mutex<Vec<(u64, u64)>>,
}

impl MockAssetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, result: Result<Vec<AssetTransfer>, ProviderError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn fail_times(&self, times: usize) {
        for _ in 0..times {
            self.respond(Err(ProviderError::Timeout {
                endpoint: "mock-index".to_string(),
            }));
        }
    }

    /// `(from_block, to_block)` of every call.
    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssetIndex for MockAssetIndex {
    async fn get_asset_transfers(
        &self,
        _account: &AddressNetwork,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<AssetTransfer>, ProviderError> {
        self.calls.lock().unwrap().push((from_block, to_block));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// [`MemoryStore`] whose writes can be switched off.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, entity: &str) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteFailed {
                entity: entity.to_string(),
                msg: "disk full".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn add_account_to_track(&self, account: &AddressNetwork) -> Result<(), PersistenceError> {
        self.check("account")?;
        self.inner.add_account_to_track(account).await
    }

    async fn get_accounts_to_track(&self) -> Result<Vec<AddressNetwork>, PersistenceError> {
        self.inner.get_accounts_to_track().await
    }

    async fn add_block(&self, block: &Block) -> Result<(), PersistenceError> {
        self.check("block")?;
        self.inner.add_block(block).await
    }

    async fn get_block(&self, network: &Network, hash: H256) -> Result<Option<Block>, PersistenceError> {
        self.inner.get_block(network, hash).await
    }

    async fn get_latest_block(&self, network: &Network) -> Result<Option<Block>, PersistenceError> {
        self.inner.get_latest_block(network).await
    }

    async fn add_or_update_transaction(
        &self,
        transaction: &Transaction,
        source: TransactionSource,
    ) -> Result<(), PersistenceError> {
        self.check("transaction")?;
        self.inner.add_or_update_transaction(transaction, source).await
    }

    async fn get_transaction(
        &self,
        network: &Network,
        hash: H256,
    ) -> Result<Option<Transaction>, PersistenceError> {
        self.inner.get_transaction(network, hash).await
    }

    async fn record_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
        start_block: u64,
        end_block: u64,
    ) -> Result<(), PersistenceError> {
        self.check("asset_transfer_lookup")?;
        self.inner
            .record_account_asset_transfer_lookup(account, start_block, end_block)
            .await
    }

    async fn get_oldest_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
    ) -> Result<Option<u64>, PersistenceError> {
        self.inner.get_oldest_account_asset_transfer_lookup(account).await
    }

    async fn get_newest_account_asset_transfer_lookup(
        &self,
        account: &AddressNetwork,
    ) -> Result<Option<u64>, PersistenceError> {
        self.inner.get_newest_account_asset_transfer_lookup(account).await
    }

    async fn add_account_balance(&self, balance: &AccountBalance) -> Result<(), PersistenceError> {
        self.check("balance")?;
        self.inner.add_account_balance(balance).await
    }

    async fn get_latest_account_balance(
        &self,
        account: &AddressNetwork,
        asset: &str,
    ) -> Result<Option<AccountBalance>, PersistenceError> {
        self.inner.get_latest_account_balance(account, asset).await
    }
}

/// A service over one scripted network.
pub struct Harness {
    pub service: ChainService,
    pub node: Arc<MockNode>,
    pub push: Arc<MockPush>,
    pub assets: Arc<MockAssetIndex>,
    pub store: Arc<dyn Store>,
}

impl Harness {
    pub fn new(head: u64) -> Self {
        Self::with_store(head, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(head: u64, store: Arc<dyn Store>) -> Self {
        let node = Arc::new(MockNode::new(head));
        let push = Arc::new(MockPush::new());
        let assets = Arc::new(MockAssetIndex::new());
        let clients = NetworkClients::new(
            network(),
            node.clone(),
            Some(push.clone() as Arc<dyn PushProvider>),
            assets.clone(),
        );
        let service = ChainService::new(MonitorSettings::default(), vec![clients], store.clone());
        Self {
            service,
            node,
            push,
            assets,
            store,
        }
    }
}

/// Yields until spawned handlers have had a chance to run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Polls `condition` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}

/// Next payload on `rx`, failing the test after two seconds.
pub async fn next_event<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> T {
    tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within two seconds")
        .expect("event channel closed")
}

/// A `newHeads` notification as sent by the node.
pub fn head_payload(height: u64) -> serde_json::Value {
    serde_json::json!({
        "hash": format!("{:?}", H256::from_low_u64_be(height)),
        "parentHash": format!("{:?}", H256::from_low_u64_be(height - 1)),
        "number": format!("{:#x}", height),
        "timestamp": "0x6553f100",
        "baseFeePerGas": "0x7",
        "miner": format!("{:?}", Address::zero()),
        "gasLimit": "0x1c9c380",
        "gasUsed": "0x0",
        "extraData": "0x",
        "logsBloom": format!("0x{}", "0".repeat(512)),
        "stateRoot": format!("{:?}", H256::zero()),
        "transactionsRoot": format!("{:?}", H256::zero()),
        "receiptsRoot": format!("{:?}", H256::zero()),
        "sha3Uncles": format!("{:?}", H256::zero()),
        "difficulty": "0x0",
        "nonce": "0x0000000000000000"
    })
}

/// An `alchemy_pendingTransactions` notification for a full transaction.
pub fn pending_payload(hash: H256, from: Address, nonce: u64) -> serde_json::Value {
    serde_json::json!({
        "hash": format!("{:?}", hash),
        "nonce": format!("{:#x}", nonce),
        "blockHash": null,
        "blockNumber": null,
        "transactionIndex": null,
        "from": format!("{:?}", from),
        "to": format!("{:?}", Address::repeat_byte(0xee)),
        "value": "0xde0b6b3a7640000",
        "gasPrice": "0x3b9aca00",
        "gas": "0x5208",
        "input": "0x",
        "v": "0x1",
        "r": "0x1",
        "s": "0x1",
        "type": "0x2",
        "maxFeePerGas": "0x77359400",
        "maxPriorityFeePerGas": "0x3b9aca00",
        "chainId": "0xaa36a7"
    })
}
