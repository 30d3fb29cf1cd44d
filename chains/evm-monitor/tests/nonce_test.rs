mod common;

use common::{MockNode, CHAIN_ID};
use ethers::types::Address;
use evm_monitor::NonceAllocator;
use futures::future::join_all;
use std::collections::HashSet;

fn sender() -> Address {
    Address::repeat_byte(0x11)
}

#[tokio::test]
async fn test_first_allocation_seeds_from_transaction_count() {
    let node = MockNode::new(100);
    node.set_transaction_count(sender(), 7);
    let nonces = NonceAllocator::new();

    assert_eq!(nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap(), 7);
    assert_eq!(nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap(), 8);
    assert_eq!(nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap(), 9);
    assert_eq!(node.count_lookups(), 1);
}

#[tokio::test]
async fn test_concurrent_allocations_are_distinct() {
    let node = MockNode::new(100);
    node.set_transaction_count(sender(), 3);
    let nonces = NonceAllocator::new();

    let allocated: Vec<u64> = join_all((0..20).map(|_| nonces.allocate(CHAIN_ID, sender(), &node)))
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let distinct: HashSet<u64> = allocated.iter().copied().collect();
    assert_eq!(distinct.len(), 20);
    assert_eq!(distinct, (3..23).collect());
    assert_eq!(node.count_lookups(), 1);
}

#[tokio::test]
async fn test_release_then_reallocate_returns_same_nonce() {
    let node = MockNode::new(100);
    node.set_transaction_count(sender(), 5);
    let nonces = NonceAllocator::new();

    let nonce = nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap();
    nonces.release(CHAIN_ID, sender(), nonce).await;

    assert_eq!(nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap(), nonce);
}

#[tokio::test]
async fn test_release_below_current_collapses_range() {
    let node = MockNode::new(100);
    node.set_transaction_count(sender(), 4);
    let nonces = NonceAllocator::new();

    for expected in 4..7 {
        assert_eq!(nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap(), expected);
    }
    assert_eq!(nonces.peek_next(CHAIN_ID, sender()).await, Some(7));

    nonces.release(CHAIN_ID, sender(), 4).await;

    let next = nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap();
    assert_ne!(next, 8);
    assert_eq!(next, 4);
}

#[tokio::test]
async fn test_release_above_current_is_ignored() {
    let node = MockNode::new(100);
    node.set_transaction_count(sender(), 2);
    let nonces = NonceAllocator::new();

    nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap();
    nonces.release(CHAIN_ID, sender(), 10).await;

    assert_eq!(nonces.peek_next(CHAIN_ID, sender()).await, Some(3));
}

#[tokio::test]
async fn test_observe_advances_seeded_record_only() {
    let node = MockNode::new(100);
    node.set_transaction_count(sender(), 2);
    let nonces = NonceAllocator::new();

    nonces.observe(CHAIN_ID, sender(), 9).await;
    assert_eq!(nonces.peek_next(CHAIN_ID, sender()).await, None);

    nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap();
    nonces.observe(CHAIN_ID, sender(), 9).await;
    assert_eq!(nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap(), 10);

    nonces.observe(CHAIN_ID, sender(), 4).await;
    assert_eq!(nonces.peek_next(CHAIN_ID, sender()).await, Some(11));
}

#[tokio::test]
async fn test_keys_are_independent() {
    let node = MockNode::new(100);
    let other = Address::repeat_byte(0x22);
    node.set_transaction_count(sender(), 1);
    node.set_transaction_count(other, 40);
    let nonces = NonceAllocator::new();

    assert_eq!(nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap(), 1);
    assert_eq!(nonces.allocate(CHAIN_ID, other, &node).await.unwrap(), 40);
    assert_eq!(nonces.allocate(1, sender(), &node).await.unwrap(), 1);
    assert_eq!(nonces.allocate(CHAIN_ID, sender(), &node).await.unwrap(), 2);
}
