use crate::provider::NodeProvider;
use core_logic::ProviderError;
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

type NonceKey = (u64, Address);

/// Next nonce to hand out. `None` until seeded from the node.
type NonceSlot = Arc<AsyncMutex<Option<u64>>>;

/// Hands out nonces per `(chain_id, address)` without asking the node
/// every time.
///
/// The first allocation seeds from the node's mined transaction count,
/// later ones count up locally. Allocation for one key is serialized, so
/// two concurrent callers never receive the same nonce.
#[derive(Debug, Default)]
pub struct NonceAllocator {
    slots: Mutex<HashMap<NonceKey, NonceSlot>>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: NonceKey) -> NonceSlot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key).or_default().clone()
    }

    fn existing_slot(&self, key: &NonceKey) -> Option<NonceSlot> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(key).cloned()
    }

    pub async fn allocate(
        &self,
        chain_id: u64,
        address: Address,
        node: &dyn NodeProvider,
    ) -> Result<u64, ProviderError> {
        let slot = self.slot((chain_id, address));
        let mut next = slot.lock().await;

        let nonce = match *next {
            Some(nonce) => nonce,
            None => {
                let count = node.get_transaction_count(address).await?;
                debug!(
                    target: "nonce_allocator",
                    "Seeded nonce for {:?} on chain {} from transaction count {}",
                    address, chain_id, count
                );
                count
            }
        };
        *next = Some(nonce + 1);
        Ok(nonce)
    }

    /// Gives `nonce` back so the next allocation reuses it.
    ///
    /// Everything allocated above `nonce` is considered freed as well.
    pub async fn release(&self, chain_id: u64, address: Address, nonce: u64) {
        let Some(slot) = self.existing_slot(&(chain_id, address)) else {
            debug!(
                target: "nonce_allocator",
                "Ignoring release of nonce {} for {:?}: nothing allocated",
                nonce, address
            );
            return;
        };
        let mut next = slot.lock().await;

        if let Some(current) = *next {
            if nonce < current {
                if nonce + 1 < current {
                    warn!(
                        target: "nonce_allocator",
                        "Released nonce {} for {:?} on chain {} below last allocated {}",
                        nonce, address, chain_id, current - 1
                    );
                }
                *next = Some(nonce);
            }
        }
    }

    /// Accounts for a nonce used outside this allocator, e.g. seen in the
    /// mempool. Only advances a record that already exists.
    pub async fn observe(&self, chain_id: u64, address: Address, nonce: u64) {
        let Some(slot) = self.existing_slot(&(chain_id, address)) else {
            return;
        };
        let mut next = slot.lock().await;

        if let Some(current) = *next {
            if nonce >= current {
                debug!(
                    target: "nonce_allocator",
                    "Advancing nonce for {:?} on chain {} past observed {}",
                    address, chain_id, nonce
                );
                *next = Some(nonce + 1);
            }
        }
    }

    /// Nonce the next allocation would return, if the record is seeded.
    pub async fn peek_next(&self, chain_id: u64, address: Address) -> Option<u64> {
        let slot = self.existing_slot(&(chain_id, address))?;
        let next = slot.lock().await;
        *next
    }
}
