use crate::alarms::AlarmScheduler;
use crate::cache::ChainCache;
use crate::error::ServiceError;
use crate::events::{topics, EventBus};
use crate::historic::{ContinuationOutcome, HistoricLoader};
use crate::nonce::NonceAllocator;
use crate::populator::{
    GasPolicy, PartialTransactionRequest, PopulatedRequest, TransactionPopulator, TransactionRequest,
};
use crate::provider::NetworkClients;
use crate::queue::RetrievalQueue;
use crate::store::Store;
use crate::subscriptions::SubscriptionManager;
use crate::types::{
    AccountBalance, AddressNetwork, Block, BlockPrices, Network, SignedTransaction, Transaction,
    TransactionSource,
};
use core_logic::{with_retry, MonitorSettings, NetworkConfig, RetryConfig};
use ethers::types::{BlockId, BlockNumber, H256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

impl Lifecycle {
    fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Created => "not started",
            Lifecycle::Started => "running",
            Lifecycle::Stopped => "stopped",
        }
    }
}

struct ServiceInner {
    settings: MonitorSettings,
    networks: BTreeMap<u64, NetworkClients>,
    store: Arc<dyn Store>,
    events: EventBus,
    cache: Arc<ChainCache>,
    queue: Arc<RetrievalQueue>,
    historic: HistoricLoader,
    subscriptions: SubscriptionManager,
    populator: TransactionPopulator,
}

/// Multi-network chain data service.
///
/// Created, started once and stopped once. Read-through and transaction
/// operations work in any state; background work only runs while started.
pub struct ChainService {
    inner: Arc<ServiceInner>,
    lifecycle: Mutex<Lifecycle>,
    alarms: tokio::sync::Mutex<Option<AlarmScheduler>>,
}

impl ChainService {
    pub fn new(
        settings: MonitorSettings,
        networks: Vec<NetworkClients>,
        store: Arc<dyn Store>,
    ) -> Self {
        let events = EventBus::default();
        let cache = Arc::new(ChainCache::new(store.clone(), events.clone()));
        let nonces = Arc::new(NonceAllocator::new());
        let queue = Arc::new(RetrievalQueue::new());
        let historic = HistoricLoader::new(&settings, store.clone(), events.clone(), queue.clone());
        let subscriptions = SubscriptionManager::new(cache.clone(), nonces.clone());
        let populator = TransactionPopulator::new(nonces, GasPolicy::from_settings(&settings));

        let networks = networks
            .into_iter()
            .map(|clients| (clients.network.chain_id, clients))
            .collect();

        Self {
            inner: Arc::new(ServiceInner {
                settings,
                networks,
                store,
                events,
                cache,
                queue,
                historic,
                subscriptions,
                populator,
            }),
            lifecycle: Mutex::new(Lifecycle::Created),
            alarms: tokio::sync::Mutex::new(None),
        }
    }

    /// Connects to every configured network.
    pub async fn connect(
        settings: MonitorSettings,
        networks: &[NetworkConfig],
        store: Arc<dyn Store>,
    ) -> Result<Self, ServiceError> {
        let mut clients = Vec::with_capacity(networks.len());
        for config in networks {
            clients.push(NetworkClients::connect(config).await?);
            info!(target: "chain_service", "Connected to {} ({})", config.name, config.chain_id);
        }
        Ok(Self::new(settings, clients, store))
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn networks(&self) -> Vec<Network> {
        self.inner
            .networks
            .values()
            .map(|c| c.network.clone())
            .collect()
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle, action: &'static str) -> Result<(), ServiceError> {
        let mut state = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return Err(ServiceError::Lifecycle {
                action,
                state: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Fetches heads, opens subscriptions and starts the periodic jobs.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.transition(Lifecycle::Created, Lifecycle::Started, "start")?;
        info!(
            target: "chain_service",
            "Starting chain service on {} networks",
            self.inner.networks.len()
        );

        for clients in self.inner.networks.values() {
            self.inner.initialize_network(clients).await;
        }
        self.inner.resume_tracked_accounts().await;

        let settings = &self.inner.settings;
        let mut alarms = AlarmScheduler::new();

        let inner = self.inner.clone();
        alarms.schedule(
            "queued_transactions",
            settings.queued_transaction_period(),
            false,
            move || {
                let inner = inner.clone();
                async move { inner.run_retrieval_cycle().await }
            },
        );

        let inner = self.inner.clone();
        alarms.schedule(
            "historic_asset_transfers",
            settings.historic_backfill_period(),
            true,
            move || {
                let inner = inner.clone();
                async move { inner.run_backfill_cycle().await }
            },
        );

        let inner = self.inner.clone();
        alarms.schedule(
            "gas_prices",
            settings.gas_price_poll_period(),
            false,
            move || {
                let inner = inner.clone();
                async move { inner.poll_block_prices().await }
            },
        );

        *self.alarms.lock().await = Some(alarms);
        info!(target: "chain_service", "Chain service started");
        Ok(())
    }

    /// Ends subscriptions and periodic jobs. A stopped service cannot be
    /// started again.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.transition(Lifecycle::Started, Lifecycle::Stopped, "stop")?;

        let alarms = self.alarms.lock().await.take();
        if let Some(alarms) = alarms {
            alarms.shutdown().await;
        }
        self.inner.subscriptions.shutdown();
        info!(target: "chain_service", "Chain service stopped");
        Ok(())
    }

    /// Starts tracking an account: persists it, publishes it, fetches its
    /// balance, watches its pending transactions and loads recent history.
    /// Tracking an account twice is a no-op.
    pub async fn add_account_to_track(&self, account: AddressNetwork) -> Result<(), ServiceError> {
        let clients = self.inner.clients(account.network.chain_id)?;
        let account = AddressNetwork::new(account.address, clients.network.clone());

        let tracked = self.inner.store.get_accounts_to_track().await?;
        if tracked.contains(&account) {
            debug!(target: "chain_service", "{} is already tracked", account);
            return Ok(());
        }

        self.inner.store.add_account_to_track(&account).await?;
        self.inner
            .events
            .emit::<topics::NewAccountToTrack>(account.clone());
        info!(target: "chain_service", "Tracking {}", account);

        if let Err(e) = self.inner.refresh_balance(clients, &account).await {
            warn!(target: "chain_service", "Initial balance of {} unavailable: {}", account, e);
        }
        if let Err(e) = self
            .inner
            .subscriptions
            .subscribe_pending_transactions(clients, &account)
            .await
        {
            warn!(target: "chain_service", "Cannot watch pending transactions of {}: {}", account, e);
        }
        self.inner.historic.load_recent(clients, &account).await;
        Ok(())
    }

    pub async fn get_accounts_to_track(&self) -> Result<Vec<AddressNetwork>, ServiceError> {
        Ok(self.inner.store.get_accounts_to_track().await?)
    }

    /// Current native balance from the node, or the last stored one when
    /// the node is unreachable.
    pub async fn get_latest_base_account_balance(
        &self,
        account: &AddressNetwork,
    ) -> Result<AccountBalance, ServiceError> {
        let clients = self.inner.clients(account.network.chain_id)?;
        let account = AddressNetwork::new(account.address, clients.network.clone());

        match self.inner.refresh_balance(clients, &account).await {
            Ok(balance) => Ok(balance),
            Err(ServiceError::Provider(e)) => {
                warn!(target: "chain_service", "Balance refresh for {} failed: {}", account, e);
                self.inner
                    .store
                    .get_latest_account_balance(&account, &clients.network.base_asset)
                    .await?
                    .ok_or(ServiceError::Provider(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Height of the newest cached block, asking the node when nothing is
    /// cached yet.
    pub async fn get_block_height(&self, network: &Network) -> Result<u64, ServiceError> {
        let clients = self.inner.clients(network.chain_id)?;
        if let Some(block) = self.inner.store.get_latest_block(&clients.network).await? {
            return Ok(block.height);
        }
        Ok(clients.node.get_block_number().await?)
    }

    pub async fn get_block_data(&self, network: &Network, hash: H256) -> Result<Block, ServiceError> {
        let clients = self.inner.clients(network.chain_id)?;
        self.inner
            .cache
            .get_block(clients.node.as_ref(), &clients.network, hash)
            .await
    }

    pub async fn get_transaction(
        &self,
        network: &Network,
        hash: H256,
    ) -> Result<Transaction, ServiceError> {
        let clients = self.inner.clients(network.chain_id)?;
        self.inner
            .cache
            .get_transaction(clients.node.as_ref(), &clients.network, hash)
            .await
    }

    /// Merges a transaction view into the cache and publishes the result.
    pub async fn save_transaction(
        &self,
        transaction: Transaction,
        source: TransactionSource,
    ) -> Result<Transaction, ServiceError> {
        self.inner.clients(transaction.network.chain_id)?;
        self.inner.cache.save_transaction(transaction, source).await
    }

    /// Queues `hash` for a full fetch. Returns `false` if already queued.
    pub fn queue_transaction_hash(&self, network: &Network, hash: H256) -> Result<bool, ServiceError> {
        let clients = self.inner.clients(network.chain_id)?;
        Ok(self.inner.queue.enqueue(&clients.network, hash))
    }

    pub async fn populate_partial_transaction_request(
        &self,
        network: &Network,
        partial: PartialTransactionRequest,
    ) -> Result<PopulatedRequest, ServiceError> {
        let clients = self.inner.clients(network.chain_id)?;
        self.inner
            .populator
            .populate(clients.node.as_ref(), &clients.network, partial)
            .await
    }

    pub async fn populate_nonce(
        &self,
        request: TransactionRequest,
    ) -> Result<TransactionRequest, ServiceError> {
        let clients = self.inner.clients(request.network.chain_id)?;
        self.inner
            .populator
            .populate_nonce(clients.node.as_ref(), request)
            .await
    }

    pub async fn release_nonce(&self, request: &TransactionRequest) {
        self.inner.populator.release_nonce(request).await
    }

    /// Submits a signed transaction. On success a confirmation watch is
    /// armed and a local copy is cached.
    pub async fn broadcast_signed_transaction(
        &self,
        signed: SignedTransaction,
    ) -> Result<H256, ServiceError> {
        let clients = self.inner.clients(signed.transaction.network.chain_id)?;
        let hash = signed.hash();

        let (submitted, armed) = tokio::join!(
            clients.node.send_raw_transaction(signed.raw.clone()),
            self.inner.subscriptions.watch_confirmation(clients, hash),
        );

        if let Err(source) = submitted {
            error!(
                target: "chain_service",
                "Broadcast of {:?} on {} failed: {}",
                hash, clients.network, source
            );
            if matches!(armed, Ok(true)) {
                self.inner.subscriptions.disarm(clients.network.chain_id, hash);
            }
            return Err(ServiceError::Broadcast { hash, source });
        }
        if let Err(e) = armed {
            warn!(target: "chain_service", "No confirmation watch for {:?}: {}", hash, e);
        }

        self.inner
            .cache
            .save_transaction(signed.transaction, TransactionSource::Local)
            .await?;
        info!(target: "chain_service", "Broadcast {:?} on {}", hash, clients.network);
        Ok(hash)
    }

    /// Runs one retrieval-queue drain on every network.
    pub async fn run_retrieval_cycle(&self) {
        self.inner.run_retrieval_cycle().await
    }

    /// Runs one historic continuation step for every tracked account.
    pub async fn run_backfill_cycle(&self) {
        self.inner.run_backfill_cycle().await
    }

    /// Publishes fresh block prices for every network.
    pub async fn poll_block_prices(&self) {
        self.inner.poll_block_prices().await
    }
}

impl ServiceInner {
    fn clients(&self, chain_id: u64) -> Result<&NetworkClients, ServiceError> {
        self.networks
            .get(&chain_id)
            .ok_or(ServiceError::UnknownNetwork { chain_id })
    }

    async fn initialize_network(&self, clients: &NetworkClients) {
        let node = clients.node.clone();
        let retry = RetryConfig::new(2, 500).with_max_delay(2_000);
        let latest = with_retry(retry, "initial block fetch", || {
            let node = node.clone();
            async move {
                node.get_block(BlockId::Number(BlockNumber::Latest))
                    .await
                    .map_err(anyhow::Error::from)
            }
        })
        .await;

        match latest {
            Ok(Some(block)) => {
                info!(target: "chain_service", "{} is at block {}", clients.network, block.height);
                if let Err(e) = self.cache.save_block(block).await {
                    warn!(target: "chain_service", "Cannot cache head of {}: {}", clients.network, e);
                }
            }
            Ok(None) => warn!(target: "chain_service", "{} returned no latest block", clients.network),
            Err(e) => warn!(target: "chain_service", "Cannot reach {}: {:#}", clients.network, e),
        }

        if let Err(e) = self.subscriptions.subscribe_new_heads(clients).await {
            warn!(target: "chain_service", "New head subscription on {} failed: {}", clients.network, e);
        }
    }

    async fn resume_tracked_accounts(&self) {
        let accounts = match self.store.get_accounts_to_track().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(target: "chain_service", "Cannot load tracked accounts: {}", e);
                return;
            }
        };

        for account in accounts {
            let Ok(clients) = self.clients(account.network.chain_id) else {
                warn!(target: "chain_service", "{} belongs to an unconfigured network", account);
                continue;
            };
            if let Err(e) = self
                .subscriptions
                .subscribe_pending_transactions(clients, &account)
                .await
            {
                warn!(target: "chain_service", "Cannot watch pending transactions of {}: {}", account, e);
            }
        }
    }

    async fn refresh_balance(
        &self,
        clients: &NetworkClients,
        account: &AddressNetwork,
    ) -> Result<AccountBalance, ServiceError> {
        let block_height = clients.node.get_block_number().await?;
        let amount = clients.node.get_balance(account.address).await?;
        let balance = AccountBalance {
            address_network: account.clone(),
            asset: clients.network.base_asset.clone(),
            amount,
            block_height,
            retrieved_at: chrono::Utc::now().timestamp(),
        };

        let persisted = self.store.add_account_balance(&balance).await;
        if let Err(e) = &persisted {
            error!(target: "chain_service", "Failed to persist balance of {}: {}", account, e);
        }
        self.events.emit::<topics::AccountBalance>(balance.clone());
        persisted?;
        Ok(balance)
    }

    async fn run_retrieval_cycle(&self) {
        let batch_size = self.settings.retrieval_batch_size;
        for clients in self.networks.values() {
            if self.queue.is_empty(&clients.network) {
                continue;
            }
            self.queue
                .drain(&clients.network, batch_size, |hash| async move {
                    self.cache
                        .retrieve_transaction(clients.node.as_ref(), &clients.network, hash)
                        .await
                        .map(|_| ())
                })
                .await;
        }
    }

    async fn run_backfill_cycle(&self) {
        let accounts = match self.store.get_accounts_to_track().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!(target: "historic", "Cannot load tracked accounts: {}", e);
                return;
            }
        };

        for account in accounts {
            let Ok(clients) = self.clients(account.network.chain_id) else {
                continue;
            };
            match self.historic.load_continuation(clients, &account).await {
                Ok(ContinuationOutcome::Scanned { start, end, transfers }) => debug!(
                    target: "historic",
                    "Backfilled {} blocks {}..={} ({} transfers)",
                    account, start, end, transfers
                ),
                Ok(_) => {}
                Err(e) => warn!(target: "historic", "Backfill of {} failed: {}", account, e),
            }
        }
    }

    async fn poll_block_prices(&self) {
        for clients in self.networks.values() {
            match self.fetch_block_prices(clients).await {
                Ok(prices) => {
                    debug!(
                        target: "chain_service",
                        "Block prices on {} at {}: max fee {}, priority fee {}",
                        clients.network,
                        prices.block_number,
                        prices.max_fee_per_gas,
                        prices.max_priority_fee_per_gas
                    );
                    self.events.emit::<topics::BlockPrices>(prices);
                }
                Err(e) => warn!(target: "chain_service", "Gas price poll on {} failed: {}", clients.network, e),
            }
        }
    }

    async fn fetch_block_prices(&self, clients: &NetworkClients) -> Result<BlockPrices, ServiceError> {
        let block = clients
            .node
            .get_block(BlockId::Number(BlockNumber::Latest))
            .await?
            .ok_or_else(|| ServiceError::NotFound {
                entity: "block",
                key: "latest".to_string(),
                chain_id: clients.network.chain_id,
            })?;
        let (max_fee_per_gas, max_priority_fee_per_gas) = clients.node.estimate_fees().await?;

        let prices = BlockPrices {
            network: clients.network.clone(),
            block_number: block.height,
            base_fee_per_gas: block.base_fee_per_gas,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            retrieved_at: chrono::Utc::now().timestamp(),
        };

        // Without a push endpoint this poll is the only source of new heads.
        if clients.push.is_none() {
            if let Err(e) = self.cache.save_block(block).await {
                warn!(target: "chain_service", "Cannot cache head of {}: {}", clients.network, e);
            }
        }
        Ok(prices)
    }
}
