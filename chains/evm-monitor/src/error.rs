use core_logic::{ConfigError, PersistenceError, ProviderError, SubscriptionPayloadError};
use ethers::types::H256;
use thiserror::Error;

/// Errors surfaced by [`crate::ChainService`] operations.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Cannot {action}: service is {state}")]
    Lifecycle {
        action: &'static str,
        state: &'static str,
    },

    #[error("No connection configured for chain {chain_id}")]
    UnknownNetwork { chain_id: u64 },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The node rejected a signed transaction.
    #[error("Broadcast of {hash:?} failed: {source}")]
    Broadcast {
        hash: H256,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Payload(#[from] SubscriptionPayloadError),

    #[error("{entity} {key} not found on chain {chain_id}")]
    NotFound {
        entity: &'static str,
        key: String,
        chain_id: u64,
    },

    #[error("Invalid signed transaction: {reason}")]
    InvalidSignedTransaction { reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServiceError {
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            ServiceError::Provider(ProviderError::Unsupported { .. })
        )
    }
}
