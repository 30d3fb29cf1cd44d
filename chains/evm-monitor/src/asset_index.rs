use crate::provider::classify_error;
use crate::types::{AddressNetwork, AssetTransfer, Network, TransferDirection};
use async_trait::async_trait;
use core_logic::{ConfigError, MetricsCollector, ProviderError};
use ethers::providers::{Http, JsonRpcClient, Provider};
use ethers::types::{Address, H256, U256, U64};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const MAX_PAGES: usize = 50;
const PAGE_SIZE: u64 = 1_000;
const TRANSFER_CATEGORIES: [&str; 5] = ["external", "internal", "erc20", "erc721", "erc1155"];

/// Indexing service answering "which transfers touched this address".
#[async_trait]
pub trait AssetIndex: Send + Sync {
    /// Transfers sent from or received by the account in
    /// `[from_block, to_block]`, both ends inclusive.
    async fn get_asset_transfers(
        &self,
        account: &AddressNetwork,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<AssetTransfer>, ProviderError>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransfersPage {
    #[serde(default)]
    transfers: Vec<RawTransfer>,
    page_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransfer {
    hash: H256,
    block_num: U64,
    from: Address,
    to: Option<Address>,
    asset: Option<String>,
    #[serde(default)]
    raw_contract: RawContract,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawContract {
    value: Option<U256>,
    address: Option<Address>,
}

impl RawTransfer {
    fn normalize(self, account: Address) -> AssetTransfer {
        let (direction, counterparty) = if self.from == account {
            (TransferDirection::Outgoing, self.to)
        } else {
            (TransferDirection::Incoming, Some(self.from))
        };
        let asset = self
            .asset
            .or_else(|| self.raw_contract.address.map(|a| format!("{:?}", a)))
            .unwrap_or_default();

        AssetTransfer {
            tx_hash: self.hash,
            asset,
            amount: self.raw_contract.value.unwrap_or_default(),
            counterparty,
            direction,
            block_height: self.block_num.as_u64(),
        }
    }
}

/// [`AssetIndex`] backed by `alchemy_getAssetTransfers`.
#[derive(Debug, Clone)]
pub struct AlchemyAssetIndex<P = Http> {
    provider: Arc<Provider<P>>,
    network: Network,
    endpoint: String,
}

impl AlchemyAssetIndex<Http> {
    pub fn connect(url: &str, network: Network) -> Result<Self, ConfigError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| ConfigError::InvalidUrl {
            field: format!("networks.{}.asset_index_url", network.name),
            url: url.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "http client".to_string(),
                reason: e.to_string(),
            })?;
        let provider = Provider::new(Http::new_with_client(parsed, client));
        Ok(Self::new(Arc::new(provider), url, network))
    }
}

impl<P: JsonRpcClient + 'static> AlchemyAssetIndex<P> {
    pub fn new(provider: Arc<Provider<P>>, endpoint: impl Into<String>, network: Network) -> Self {
        Self {
            provider,
            network,
            endpoint: endpoint.into(),
        }
    }

    async fn fetch_direction(
        &self,
        account: Address,
        from_block: u64,
        to_block: u64,
        outgoing: bool,
    ) -> Result<Vec<AssetTransfer>, ProviderError> {
        let mut transfers = Vec::new();
        let mut page_key: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut params = serde_json::json!({
                "fromBlock": format!("{:#x}", from_block),
                "toBlock": format!("{:#x}", to_block),
                "category": TRANSFER_CATEGORIES,
                "excludeZeroValue": false,
                "maxCount": format!("{:#x}", PAGE_SIZE),
            });
            let side = if outgoing { "fromAddress" } else { "toAddress" };
            params[side] = serde_json::json!(account);
            if let Some(key) = &page_key {
                params["pageKey"] = serde_json::json!(key);
            }

            let start = Instant::now();
            let page: TransfersPage = self
                .provider
                .request("alchemy_getAssetTransfers", [params])
                .await
                .map_err(|e| classify_error(&self.endpoint, e))?;
            MetricsCollector::global().record_rpc_latency(start.elapsed());

            transfers.extend(page.transfers.into_iter().map(|t| t.normalize(account)));
            match page.page_key {
                Some(key) => page_key = Some(key),
                None => return Ok(transfers),
            }
        }

        // Never hand back a partial range.
        warn!(
            target: "historic",
            "Transfers of {:?} on {} in {}..={} exceed {} pages",
            account, self.network, from_block, to_block, MAX_PAGES
        );
        Err(ProviderError::InvalidResponse {
            endpoint: self.endpoint.clone(),
            reason: format!("page limit of {} reached for blocks {}..={}", MAX_PAGES, from_block, to_block),
        })
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> AssetIndex for AlchemyAssetIndex<P> {
    async fn get_asset_transfers(
        &self,
        account: &AddressNetwork,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<AssetTransfer>, ProviderError> {
        let mut transfers = self
            .fetch_direction(account.address, from_block, to_block, true)
            .await?;
        let incoming = self
            .fetch_direction(account.address, from_block, to_block, false)
            .await?;

        // Self-transfers show up on both sides.
        for transfer in incoming {
            if !transfers.iter().any(|t| t.tx_hash == transfer.tx_hash && t.asset == transfer.asset) {
                transfers.push(transfer);
            }
        }
        transfers.sort_by_key(|t| t.block_height);
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_direction() {
        let account = Address::repeat_byte(1);
        let page: TransfersPage = serde_json::from_value(serde_json::json!({
            "transfers": [
                {
                    "hash": format!("{:?}", H256::repeat_byte(7)),
                    "blockNum": "0x10",
                    "from": format!("{:?}", account),
                    "to": format!("{:?}", Address::repeat_byte(2)),
                    "asset": "ETH",
                    "rawContract": { "value": "0x64", "address": null }
                },
                {
                    "hash": format!("{:?}", H256::repeat_byte(8)),
                    "blockNum": "0x11",
                    "from": format!("{:?}", Address::repeat_byte(3)),
                    "to": format!("{:?}", account),
                    "asset": null,
                    "rawContract": {
                        "value": "0x1",
                        "address": format!("{:?}", Address::repeat_byte(9))
                    }
                }
            ]
        }))
        .unwrap();
        assert!(page.page_key.is_none());

        let transfers: Vec<AssetTransfer> =
            page.transfers.into_iter().map(|t| t.normalize(account)).collect();

        assert_eq!(transfers[0].direction, TransferDirection::Outgoing);
        assert_eq!(transfers[0].counterparty, Some(Address::repeat_byte(2)));
        assert_eq!(transfers[0].amount, U256::from(100));
        assert_eq!(transfers[0].block_height, 16);

        assert_eq!(transfers[1].direction, TransferDirection::Incoming);
        assert_eq!(transfers[1].counterparty, Some(Address::repeat_byte(3)));
        assert_eq!(transfers[1].asset, format!("{:?}", Address::repeat_byte(9)));
    }

    fn page(byte: u8, page_key: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "transfers": [{
                "hash": format!("{:?}", H256::repeat_byte(byte)),
                "blockNum": "0x10",
                "from": format!("{:?}", Address::repeat_byte(3)),
                "to": format!("{:?}", Address::repeat_byte(1)),
                "asset": "ETH",
                "rawContract": { "value": "0x1", "address": null }
            }],
            "pageKey": page_key
        })
    }

    fn account() -> AddressNetwork {
        AddressNetwork::new(
            Address::repeat_byte(1),
            Network::new("sepolia", 11155111, "ETH"),
        )
    }

    #[tokio::test]
    async fn test_follows_page_keys_in_both_directions() {
        let (provider, mock) = Provider::mocked();
        // Responses are served last-in first-out.
        mock.push(page(0x0b, None)).unwrap();
        mock.push(page(0x0a, None)).unwrap();
        mock.push(page(0x09, Some("next"))).unwrap();
        let index = AlchemyAssetIndex::new(Arc::new(provider), "mock", account().network);

        let transfers = index.get_asset_transfers(&account(), 0, 128_000).await.unwrap();

        let hashes: Vec<H256> = transfers.iter().map(|t| t.tx_hash).collect();
        assert_eq!(hashes.len(), 3);
        assert!(hashes.contains(&H256::repeat_byte(0x0b)));
    }

    #[tokio::test]
    async fn test_page_limit_is_an_error() {
        let (provider, mock) = Provider::mocked();
        for i in 0..(MAX_PAGES + 10) {
            mock.push(page(i as u8, Some("more"))).unwrap();
        }
        let index = AlchemyAssetIndex::new(Arc::new(provider), "mock", account().network);

        let result = index.get_asset_transfers(&account(), 0, 128_000).await;

        assert!(matches!(result, Err(ProviderError::InvalidResponse { .. })));
    }
}
