use crate::error::ServiceError;
use crate::nonce::NonceAllocator;
use crate::provider::NodeProvider;
use crate::types::Network;
use core_logic::{MonitorSettings, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// A transaction request as handed in by a caller. Anything left out is
/// filled by [`TransactionPopulator::populate`].
#[derive(Debug, Clone, Default)]
pub struct PartialTransactionRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub value: Option<U256>,
    pub input: Option<Bytes>,
    pub gas_limit: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub nonce: Option<U256>,
}

/// An EIP-1559 request with every field needed for signing except
/// possibly the nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub gas_limit: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub nonce: Option<U256>,
    pub network: Network,
}

impl TransactionRequest {
    pub fn to_typed_transaction(&self) -> TypedTransaction {
        let mut request = Eip1559TransactionRequest::new()
            .from(self.from)
            .value(self.value)
            .data(self.input.clone())
            .gas(self.gas_limit)
            .max_fee_per_gas(self.max_fee_per_gas)
            .max_priority_fee_per_gas(self.max_priority_fee_per_gas)
            .chain_id(self.network.chain_id);
        if let Some(to) = self.to {
            request = request.to(to);
        }
        if let Some(nonce) = self.nonce {
            request = request.nonce(nonce);
        }
        request.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulatedRequest {
    pub request: TransactionRequest,
    /// Set when the node could not estimate gas, usually because the
    /// transaction would revert.
    pub gas_estimation_warning: Option<String>,
}

/// Gas limit rule applied to a fresh estimate.
#[derive(Debug, Clone, Copy)]
pub struct GasPolicy {
    pub minimum_gas_limit: u64,
    pub margin_percent: u64,
}

impl GasPolicy {
    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self {
            minimum_gas_limit: settings.minimum_gas_limit,
            margin_percent: settings.gas_margin_percent,
        }
    }

    /// A caller limit at or above the minimum is kept as is; otherwise the
    /// estimate plus margin is used.
    pub fn resolve(&self, caller_limit: Option<U256>, estimate: U256) -> U256 {
        match caller_limit {
            Some(limit) if limit >= U256::from(self.minimum_gas_limit) => limit,
            _ => estimate * U256::from(100 + self.margin_percent) / U256::from(100),
        }
    }
}

pub struct TransactionPopulator {
    nonces: Arc<NonceAllocator>,
    gas: GasPolicy,
}

impl TransactionPopulator {
    pub fn new(nonces: Arc<NonceAllocator>, gas: GasPolicy) -> Self {
        Self { nonces, gas }
    }

    /// Fills fees and gas limit. The nonce is left as given.
    pub async fn populate(
        &self,
        node: &dyn NodeProvider,
        network: &Network,
        partial: PartialTransactionRequest,
    ) -> Result<PopulatedRequest, ServiceError> {
        let (suggested_max_fee, suggested_priority_fee) = match (
            partial.max_fee_per_gas,
            partial.max_priority_fee_per_gas,
        ) {
            (Some(max_fee), Some(priority_fee)) => (max_fee, priority_fee),
            _ => node.estimate_fees().await?,
        };

        let mut request = TransactionRequest {
            from: partial.from,
            to: partial.to,
            value: partial.value.unwrap_or_default(),
            input: partial.input.unwrap_or_default(),
            gas_limit: partial.gas_limit.unwrap_or_default(),
            max_fee_per_gas: partial.max_fee_per_gas.unwrap_or(suggested_max_fee),
            max_priority_fee_per_gas: partial
                .max_priority_fee_per_gas
                .unwrap_or(suggested_priority_fee),
            nonce: partial.nonce,
            network: network.clone(),
        };

        let mut estimation = request.to_typed_transaction();
        if let TypedTransaction::Eip1559(inner) = &mut estimation {
            inner.gas = None;
            inner.nonce = None;
        }

        let mut gas_estimation_warning = None;
        match node.estimate_gas(&estimation).await {
            Ok(estimate) => {
                request.gas_limit = self.gas.resolve(partial.gas_limit, estimate);
                debug!(
                    "Gas estimate {} for {:?}, using limit {}",
                    estimate, request.from, request.gas_limit
                );
            }
            Err(ProviderError::UnpredictableGas { reason }) => {
                warn!(
                    "Gas estimation failed for {:?} on {}: {}",
                    request.from, network, reason
                );
                gas_estimation_warning = Some(format!(
                    "Gas estimation failed, the transaction is likely to revert: {}",
                    reason
                ));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(PopulatedRequest {
            request,
            gas_estimation_warning,
        })
    }

    /// Assigns the next nonce of `request.from`.
    pub async fn populate_nonce(
        &self,
        node: &dyn NodeProvider,
        mut request: TransactionRequest,
    ) -> Result<TransactionRequest, ServiceError> {
        let nonce = self
            .nonces
            .allocate(request.network.chain_id, request.from, node)
            .await?;
        request.nonce = Some(U256::from(nonce));
        Ok(request)
    }

    /// Returns the nonce of an unsent request to the allocator.
    pub async fn release_nonce(&self, request: &TransactionRequest) {
        match request.nonce {
            Some(nonce) => {
                self.nonces
                    .release(request.network.chain_id, request.from, nonce.low_u64())
                    .await
            }
            None => debug!("Request from {:?} carries no nonce to release", request.from),
        }
    }
}
