//! Normalized chain data shared by the cache, the event bus and the store.

use crate::error::ServiceError;
use core_logic::NetworkConfig;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::rlp::Rlp;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub chain_id: u64,
    pub base_asset: String,
}

impl Network {
    pub fn new(name: impl Into<String>, chain_id: u64, base_asset: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain_id,
            base_asset: base_asset.into(),
        }
    }
}

impl From<&NetworkConfig> for Network {
    fn from(config: &NetworkConfig) -> Self {
        Network::new(&config.name, config.chain_id, &config.base_asset)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.chain_id)
    }
}

/// An address on a specific network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressNetwork {
    pub address: Address,
    pub network: Network,
}

impl AddressNetwork {
    pub fn new(address: Address, network: Network) -> Self {
        Self { address, network }
    }
}

impl fmt::Display for AddressNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.address, self.network.chain_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: H256,
    pub parent_hash: H256,
    pub height: u64,
    pub timestamp: u64,
    pub base_fee_per_gas: Option<U256>,
    pub network: Network,
}

impl Block {
    /// Returns `None` for pending blocks, which carry neither hash nor number.
    pub fn from_ethers<T>(block: &ethers::types::Block<T>, network: &Network) -> Option<Self> {
        Some(Block {
            hash: block.hash?,
            parent_hash: block.parent_hash,
            height: block.number?.as_u64(),
            timestamp: block.timestamp.low_u64(),
            base_fee_per_gas: block.base_fee_per_gas,
            network: network.clone(),
        })
    }
}

/// Where the latest view of a cached transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionSource {
    /// Broadcast by this service.
    Local,
    /// Pushed by a subscription.
    Push,
    /// Fetched from the node by hash.
    Node,
}

impl TransactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionSource::Local => "local",
            TransactionSource::Push => "push",
            TransactionSource::Node => "node",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(TransactionSource::Local),
            "push" => Some(TransactionSource::Push),
            "node" => Some(TransactionSource::Node),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: H256,
    pub block_hash: Option<H256>,
    pub block_height: Option<u64>,
    pub status: Option<u64>,
    pub gas_used: Option<U256>,
    pub effective_gas_price: Option<U256>,
}

impl From<&ethers::types::TransactionReceipt> for Receipt {
    fn from(receipt: &ethers::types::TransactionReceipt) -> Self {
        Receipt {
            transaction_hash: receipt.transaction_hash,
            block_hash: receipt.block_hash,
            block_height: receipt.block_number.map(|n| n.as_u64()),
            status: receipt.status.map(|s| s.as_u64()),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
        }
    }
}

/// A possibly partial view of a transaction.
///
/// Everything except the identity (`hash`, `from`, `network`) is optional so
/// that views from different sources can be merged field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: Option<U256>,
    pub value: Option<U256>,
    pub gas_limit: Option<U256>,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub input: Option<Bytes>,
    pub tx_type: Option<u64>,
    pub chain_id: Option<u64>,
    pub block_hash: Option<H256>,
    pub block_height: Option<u64>,
    pub status: Option<u64>,
    pub gas_used: Option<U256>,
    pub effective_gas_price: Option<U256>,
    pub asset: Option<String>,
    pub network: Network,
}

impl Transaction {
    pub fn new(hash: H256, from: Address, network: Network) -> Self {
        Transaction {
            hash,
            from,
            to: None,
            nonce: None,
            value: None,
            gas_limit: None,
            gas_price: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            input: None,
            tx_type: None,
            chain_id: None,
            block_hash: None,
            block_height: None,
            status: None,
            gas_used: None,
            effective_gas_price: None,
            asset: None,
            network,
        }
    }

    pub fn from_ethers(tx: &ethers::types::Transaction, network: &Network) -> Self {
        Transaction {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            nonce: Some(tx.nonce),
            value: Some(tx.value),
            gas_limit: Some(tx.gas),
            gas_price: tx.gas_price,
            max_fee_per_gas: tx.max_fee_per_gas,
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
            input: Some(tx.input.clone()),
            tx_type: tx.transaction_type.map(|t| t.as_u64()),
            chain_id: tx.chain_id.map(|c| c.low_u64()).or(Some(network.chain_id)),
            block_hash: tx.block_hash,
            block_height: tx.block_number.map(|n| n.as_u64()),
            status: None,
            gas_used: None,
            effective_gas_price: None,
            asset: Some(network.base_asset.clone()),
            network: network.clone(),
        }
    }

    /// Overlays `self` on `existing`: fields present here win, fields absent
    /// here keep their stored value.
    pub fn merged_over(self, existing: &Transaction) -> Transaction {
        Transaction {
            hash: self.hash,
            from: self.from,
            to: self.to.or(existing.to),
            nonce: self.nonce.or(existing.nonce),
            value: self.value.or(existing.value),
            gas_limit: self.gas_limit.or(existing.gas_limit),
            gas_price: self.gas_price.or(existing.gas_price),
            max_fee_per_gas: self.max_fee_per_gas.or(existing.max_fee_per_gas),
            max_priority_fee_per_gas: self
                .max_priority_fee_per_gas
                .or(existing.max_priority_fee_per_gas),
            input: self.input.or_else(|| existing.input.clone()),
            tx_type: self.tx_type.or(existing.tx_type),
            chain_id: self.chain_id.or(existing.chain_id),
            block_hash: self.block_hash.or(existing.block_hash),
            block_height: self.block_height.or(existing.block_height),
            status: self.status.or(existing.status),
            gas_used: self.gas_used.or(existing.gas_used),
            effective_gas_price: self.effective_gas_price.or(existing.effective_gas_price),
            asset: self.asset.or_else(|| existing.asset.clone()),
            network: self.network,
        }
    }

    pub fn with_receipt(mut self, receipt: &Receipt) -> Transaction {
        self.block_hash = receipt.block_hash.or(self.block_hash);
        self.block_height = receipt.block_height.or(self.block_height);
        self.status = receipt.status.or(self.status);
        self.gas_used = receipt.gas_used.or(self.gas_used);
        self.effective_gas_price = receipt.effective_gas_price.or(self.effective_gas_price);
        self
    }

    /// Not yet included in a block.
    pub fn is_pending(&self) -> bool {
        self.block_hash.is_none()
    }

    pub fn involves(&self, address: Address) -> bool {
        self.from == address || self.to == Some(address)
    }
}

/// A signed, RLP-encoded transaction ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub transaction: Transaction,
    pub signature: Signature,
}

impl SignedTransaction {
    pub fn new(
        request: &TypedTransaction,
        signature: Signature,
        network: &Network,
    ) -> Result<Self, ServiceError> {
        let raw = request.rlp_signed(&signature);
        Self::decode(raw, network)
    }

    /// Decodes a raw signed transaction and recovers its sender.
    pub fn decode(raw: Bytes, network: &Network) -> Result<Self, ServiceError> {
        let rlp = Rlp::new(raw.as_ref());
        let (request, signature) = TypedTransaction::decode_signed(&rlp).map_err(|e| {
            ServiceError::InvalidSignedTransaction {
                reason: e.to_string(),
            }
        })?;
        let from = signature.recover(request.sighash()).map_err(|e| {
            ServiceError::InvalidSignedTransaction {
                reason: format!("cannot recover sender: {}", e),
            }
        })?;

        let mut transaction = Transaction::new(request.hash(&signature), from, network.clone());
        transaction.to = request.to().and_then(|to| to.as_address().copied());
        transaction.nonce = request.nonce().copied();
        transaction.value = request.value().copied();
        transaction.gas_limit = request.gas().copied();
        transaction.input = request.data().cloned();
        transaction.chain_id = request
            .chain_id()
            .map(|id| id.as_u64())
            .or(Some(network.chain_id));
        transaction.asset = Some(network.base_asset.clone());
        match &request {
            TypedTransaction::Legacy(inner) => {
                transaction.tx_type = Some(0);
                transaction.gas_price = inner.gas_price;
            }
            TypedTransaction::Eip2930(inner) => {
                transaction.tx_type = Some(1);
                transaction.gas_price = inner.tx.gas_price;
            }
            TypedTransaction::Eip1559(inner) => {
                transaction.tx_type = Some(2);
                transaction.max_fee_per_gas = inner.max_fee_per_gas;
                transaction.max_priority_fee_per_gas = inner.max_priority_fee_per_gas;
            }
        }

        Ok(SignedTransaction {
            raw,
            transaction,
            signature,
        })
    }

    pub fn hash(&self) -> H256 {
        self.transaction.hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

/// A transfer of any asset touching a tracked account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTransfer {
    pub tx_hash: H256,
    pub asset: String,
    /// Raw amount in the asset's smallest unit.
    pub amount: U256,
    pub counterparty: Option<Address>,
    pub direction: TransferDirection,
    pub block_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub address_network: AddressNetwork,
    pub asset: String,
    pub amount: U256,
    pub block_height: u64,
    pub retrieved_at: i64,
}

/// Fee snapshot published by the gas price poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPrices {
    pub network: Network,
    pub block_number: u64,
    pub base_fee_per_gas: Option<U256>,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub retrieved_at: i64,
}
