use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Websocket endpoint for push subscriptions. Without it the network is
    /// only served through polling.
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Endpoint answering `alchemy_getAssetTransfers`. Defaults to `rpc_url`.
    #[serde(default)]
    pub asset_index_url: Option<String>,
    /// Symbol of the native asset, e.g. `ETH` or `MATIC`.
    #[serde(default = "default_base_asset")]
    pub base_asset: String,
}

fn default_base_asset() -> String {
    "ETH".to_string()
}

impl NetworkConfig {
    pub fn asset_index_endpoint(&self) -> &str {
        self.asset_index_url.as_deref().unwrap_or(&self.rpc_url)
    }
}

/// Operational constants of the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Hashes fetched per retrieval-queue drain.
    pub retrieval_batch_size: usize,
    pub queued_transaction_period_secs: u64,
    pub historic_backfill_period_secs: u64,
    pub gas_price_poll_period_secs: u64,
    /// Blocks covered by one historic transfer scan.
    pub historic_window_blocks: u64,
    /// Blocks left unscanned at the head so indexers can catch up.
    pub head_skip_blocks: u64,
    /// Windows of history scanned per account before backfill stops.
    pub historic_lookup_cap: u64,
    /// Scan attempts, each with a window shrunk by `window_shrink_factor`.
    pub historic_scan_attempts: u32,
    pub window_shrink_factor: u64,
    pub minimum_gas_limit: u64,
    /// Added on top of a gas estimate, in percent.
    pub gas_margin_percent: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            retrieval_batch_size: 5,
            queued_transaction_period_secs: 60,
            historic_backfill_period_secs: 60,
            gas_price_poll_period_secs: 120,
            historic_window_blocks: 128_000,
            head_skip_blocks: 20,
            historic_lookup_cap: 10,
            historic_scan_attempts: 3,
            window_shrink_factor: 2,
            minimum_gas_limit: 21_000,
            gas_margin_percent: 10,
        }
    }
}

impl MonitorSettings {
    pub fn queued_transaction_period(&self) -> Duration {
        Duration::from_secs(self.queued_transaction_period_secs)
    }

    pub fn historic_backfill_period(&self) -> Duration {
        Duration::from_secs(self.historic_backfill_period_secs)
    }

    pub fn gas_price_poll_period(&self) -> Duration {
        Duration::from_secs(self.gas_price_poll_period_secs)
    }

    /// Depth of history after which continuation scans stop.
    pub fn history_depth_cap(&self) -> u64 {
        self.historic_window_blocks
            .saturating_mul(self.historic_lookup_cap)
    }
}
