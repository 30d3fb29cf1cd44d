use crate::types::Network;
use core_logic::MetricsCollector;
use ethers::types::H256;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PendingHashes {
    order: VecDeque<H256>,
    members: HashSet<H256>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub fetched: usize,
    pub requeued: usize,
}

/// FIFO of transaction hashes awaiting a full fetch, one per network.
///
/// A hash is held at most once per network.
#[derive(Debug, Default)]
pub struct RetrievalQueue {
    queues: Mutex<HashMap<u64, PendingHashes>>,
}

impl RetrievalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the hash was already queued.
    pub fn enqueue(&self, network: &Network, hash: H256) -> bool {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.entry(network.chain_id).or_default();
        if !queue.members.insert(hash) {
            return false;
        }
        queue.order.push_back(hash);
        true
    }

    /// Removes up to `max` hashes from the front.
    pub fn take(&self, network: &Network, max: usize) -> Vec<H256> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = queues.get_mut(&network.chain_id) else {
            return Vec::new();
        };
        let count = max.min(queue.order.len());
        let batch: Vec<H256> = queue.order.drain(..count).collect();
        for hash in &batch {
            queue.members.remove(hash);
        }
        batch
    }

    pub fn len(&self, network: &Network) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .get(&network.chain_id)
            .map(|q| q.order.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, network: &Network) -> bool {
        self.len(network) == 0
    }

    /// Fetches one batch in order. Failed hashes go back to the tail.
    pub async fn drain<F, Fut, E>(&self, network: &Network, batch_size: usize, mut fetch: F) -> DrainSummary
    where
        F: FnMut(H256) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let batch = self.take(network, batch_size);
        let mut summary = DrainSummary::default();
        let metrics = MetricsCollector::global();

        for hash in batch {
            match fetch(hash).await {
                Ok(()) => {
                    summary.fetched += 1;
                    metrics.record_retrieval(true);
                }
                Err(e) => {
                    warn!(
                        target: "retrieval_queue",
                        "Retrieval of {:?} on {} failed, requeueing: {}",
                        hash, network, e
                    );
                    self.enqueue(network, hash);
                    summary.requeued += 1;
                    metrics.record_retrieval(false);
                }
            }
        }

        if summary.fetched + summary.requeued > 0 {
            debug!(
                target: "retrieval_queue",
                "Drained {} on {} ({} requeued, {} left)",
                summary.fetched,
                network,
                summary.requeued,
                self.len(network)
            );
        }
        summary
    }
}
