//! Typed publish/subscribe for everything the service learns about chains.
//!
//! Each topic is a marker type in [`topics`] tied to its payload type, so a
//! subscriber always receives exactly the payload published on its topic.
//! Publishing with no subscribers is not an error.

use crate::types::{AccountBalance, AddressNetwork, AssetTransfer, Block, BlockPrices, Transaction};
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewAccountToTrack,
    AccountBalance,
    AssetTransfers,
    Block,
    Transaction,
    BlockPrices,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::NewAccountToTrack => "newAccountToTrack",
            EventKind::AccountBalance => "accountBalance",
            EventKind::AssetTransfers => "assetTransfers",
            EventKind::Block => "block",
            EventKind::Transaction => "transaction",
            EventKind::BlockPrices => "blockPrices",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetTransfersEvent {
    pub address_network: AddressNetwork,
    pub asset_transfers: Vec<AssetTransfer>,
}

/// A cached transaction and the tracked accounts it involves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEvent {
    pub transaction: Transaction,
    pub for_accounts: Vec<AddressNetwork>,
}

mod sealed {
    pub trait Sealed {}
}

pub trait Topic: sealed::Sealed + 'static {
    type Payload: Clone + Send + 'static;
    const KIND: EventKind;

    #[doc(hidden)]
    fn sender(bus: &EventBus) -> &broadcast::Sender<Self::Payload>;
}

pub mod topics {
    use super::*;

    macro_rules! topic {
        ($name:ident, $payload:ty, $field:ident) => {
            pub struct $name;

            impl sealed::Sealed for $name {}

            impl Topic for $name {
                type Payload = $payload;
                const KIND: EventKind = EventKind::$name;

                fn sender(bus: &EventBus) -> &broadcast::Sender<$payload> {
                    &bus.$field
                }
            }
        };
    }

    topic!(NewAccountToTrack, AddressNetwork, new_account_to_track);
    topic!(AccountBalance, crate::types::AccountBalance, account_balance);
    topic!(AssetTransfers, AssetTransfersEvent, asset_transfers);
    topic!(Block, crate::types::Block, block);
    topic!(Transaction, TransactionEvent, transaction);
    topic!(BlockPrices, crate::types::BlockPrices, block_prices);
}

/// Cloning yields a handle to the same channels.
#[derive(Debug, Clone)]
pub struct EventBus {
    new_account_to_track: broadcast::Sender<AddressNetwork>,
    account_balance: broadcast::Sender<AccountBalance>,
    asset_transfers: broadcast::Sender<AssetTransfersEvent>,
    block: broadcast::Sender<Block>,
    transaction: broadcast::Sender<TransactionEvent>,
    block_prices: broadcast::Sender<BlockPrices>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            new_account_to_track: broadcast::channel(capacity).0,
            account_balance: broadcast::channel(capacity).0,
            asset_transfers: broadcast::channel(capacity).0,
            block: broadcast::channel(capacity).0,
            transaction: broadcast::channel(capacity).0,
            block_prices: broadcast::channel(capacity).0,
        }
    }

    /// Publishes `payload` and returns how many subscribers received it.
    pub fn emit<T: Topic>(&self, payload: T::Payload) -> usize {
        match T::sender(self).send(payload) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("No subscribers for {}", T::KIND);
                0
            }
        }
    }

    pub fn subscribe<T: Topic>(&self) -> broadcast::Receiver<T::Payload> {
        T::sender(self).subscribe()
    }

    pub fn subscriber_count<T: Topic>(&self) -> usize {
        T::sender(self).receiver_count()
    }
}
