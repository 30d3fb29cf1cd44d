use crate::error::ServiceError;
use crate::events::{topics, AssetTransfersEvent, EventBus};
use crate::provider::NetworkClients;
use crate::queue::RetrievalQueue;
use crate::store::Store;
use crate::types::{AddressNetwork, AssetTransfer};
use core_logic::{with_shrinking_window, MetricsCollector, MonitorSettings, ShrinkingWindow};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a continuation step did for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationOutcome {
    Scanned { start: u64, end: u64, transfers: usize },
    DepthCapReached,
    GenesisReached,
}

/// Backfills asset transfers for tracked accounts.
///
/// Scanned ranges form one contiguous interval per account that only grows
/// outward, recorded as lookups in the store.
pub struct HistoricLoader {
    store: Arc<dyn Store>,
    events: EventBus,
    queue: Arc<RetrievalQueue>,
    window: u64,
    head_skip: u64,
    depth_cap: u64,
    backoff: ShrinkingWindow,
}

impl HistoricLoader {
    pub fn new(
        settings: &MonitorSettings,
        store: Arc<dyn Store>,
        events: EventBus,
        queue: Arc<RetrievalQueue>,
    ) -> Self {
        Self {
            store,
            events,
            queue,
            window: settings.historic_window_blocks,
            head_skip: settings.head_skip_blocks,
            depth_cap: settings.history_depth_cap(),
            backoff: ShrinkingWindow::new(
                settings.historic_scan_attempts,
                settings.window_shrink_factor,
            ),
        }
    }

    /// Scans the most recent window below the head for a newly tracked
    /// account, shrinking the window on failure. Gives up silently after
    /// the last attempt.
    pub async fn load_recent(&self, clients: &NetworkClients, account: &AddressNetwork) {
        match self.store.get_newest_account_asset_transfer_lookup(account).await {
            Ok(Some(newest)) => {
                debug!(
                    target: "historic",
                    "Skipping recent load for {}: history already scanned up to {}",
                    account, newest
                );
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target: "historic", "Cannot read lookups for {}: {}", account, e);
                return;
            }
        }

        let head = match clients.node.get_block_number().await {
            Ok(head) => head,
            Err(e) => {
                warn!(target: "historic", "Cannot load recent transfers for {}: {}", account, e);
                return;
            }
        };
        let end = head.saturating_sub(self.head_skip);

        let result = with_shrinking_window(
            self.backoff,
            self.window,
            "recent asset transfer scan",
            |e| {
                !e.downcast_ref::<ServiceError>()
                    .is_some_and(|e| e.is_unsupported())
            },
            |window| async move {
                let start = end.saturating_sub(window);
                self.scan(clients, account, start, end)
                    .await
                    .map_err(anyhow::Error::from)
            },
        )
        .await;

        match result {
            Ok(transfers) => info!(
                target: "historic",
                "Loaded {} recent transfers for {}",
                transfers.len(),
                account
            ),
            Err(e) => warn!(target: "historic", "Giving up recent load for {}: {:#}", account, e),
        }
    }

    /// Extends the scanned interval of `account` one window further back.
    pub async fn load_continuation(
        &self,
        clients: &NetworkClients,
        account: &AddressNetwork,
    ) -> Result<ContinuationOutcome, ServiceError> {
        let oldest = self.store.get_oldest_account_asset_transfer_lookup(account).await?;
        let newest = self.store.get_newest_account_asset_transfer_lookup(account).await?;

        let (oldest, newest) = match (oldest, newest) {
            (Some(oldest), Some(newest)) => (oldest, newest),
            _ => {
                let head = clients.node.get_block_number().await?;
                let head = head.saturating_sub(self.head_skip);
                (head, head)
            }
        };

        if newest.saturating_sub(oldest) >= self.depth_cap {
            debug!(target: "historic", "History depth cap reached for {}", account);
            return Ok(ContinuationOutcome::DepthCapReached);
        }
        if oldest == 0 {
            debug!(target: "historic", "History of {} scanned to genesis", account);
            return Ok(ContinuationOutcome::GenesisReached);
        }

        let start = oldest.saturating_sub(self.window);
        let transfers = self.scan(clients, account, start, oldest).await?;
        Ok(ContinuationOutcome::Scanned {
            start,
            end: oldest,
            transfers: transfers.len(),
        })
    }

    async fn scan(
        &self,
        clients: &NetworkClients,
        account: &AddressNetwork,
        start: u64,
        end: u64,
    ) -> Result<Vec<AssetTransfer>, ServiceError> {
        debug!(target: "historic", "Scanning {} blocks {}..={}", account, start, end);
        let transfers = match clients.assets.get_asset_transfers(account, start, end).await {
            Ok(transfers) => transfers,
            Err(e) => {
                MetricsCollector::global().record_backfill_scan(None);
                return Err(e.into());
            }
        };
        MetricsCollector::global().record_backfill_scan(Some(transfers.len()));

        self.store
            .record_account_asset_transfer_lookup(account, start, end)
            .await?;

        self.events.emit::<topics::AssetTransfers>(AssetTransfersEvent {
            address_network: account.clone(),
            asset_transfers: transfers.clone(),
        });

        let queued = transfers
            .iter()
            .filter(|t| self.queue.enqueue(&account.network, t.tx_hash))
            .count();
        if queued > 0 {
            debug!(target: "historic", "Queued {} transactions of {}", queued, account);
        }
        Ok(transfers)
    }
}
