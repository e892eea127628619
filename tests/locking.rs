//! Lock exclusivity and state/lock write atomicity under concurrency.

use std::sync::Arc;
use std::time::Duration;

use tapestry::kv::{KvStore, MemoryKv};
use tapestry::lock::{LockManager, lock_key, new_owner_token};
use tapestry::state::RunState;
use tapestry::store::{GuardedWrite, StateStore};

#[tokio::test]
async fn at_most_one_concurrent_acquirer_wins() {
    let kv = Arc::new(MemoryKv::new());
    let key = lock_key("contested");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let lock = LockManager::new(kv.clone());
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let owner = new_owner_token();
            let won = lock
                .acquire(&key, &owner, Duration::from_secs(30))
                .await
                .unwrap();
            (won, owner)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (won, owner) = handle.await.unwrap();
        if won {
            winners.push(owner);
        }
    }
    assert_eq!(winners.len(), 1);

    // Only the winner's token verifies.
    let lock = LockManager::new(kv);
    assert!(lock.verify(&key, &winners[0]).await.unwrap());
    assert!(!lock.verify(&key, "someone-else").await.unwrap());
}

#[tokio::test]
async fn guarded_write_is_all_or_nothing() {
    let kv = Arc::new(MemoryKv::new());
    let store = StateStore::new(kv.clone());
    let lock = LockManager::new(kv.clone());
    let key = lock_key("atomic");

    let owner = new_owner_token();
    assert!(
        lock.acquire(&key, &owner, Duration::from_secs(30))
            .await
            .unwrap()
    );

    // While held: the write lands.
    let mut state = RunState::new("atomic", "u1");
    let outcome = store
        .save_with_lock_guard(&mut state, &key, &owner)
        .await
        .unwrap();
    assert_eq!(outcome, GuardedWrite::Persisted);
    let stored = store.get("atomic").await.unwrap().unwrap();

    // After the lock changes hands: rejected, and the stored bytes are
    // untouched.
    lock.release(&key, &owner).await.unwrap();
    let usurper = new_owner_token();
    lock.acquire(&key, &usurper, Duration::from_secs(30))
        .await
        .unwrap();

    let mut altered = stored.clone();
    altered.user_id = "someone-else".into();
    let outcome = store
        .save_with_lock_guard(&mut altered, &key, &owner)
        .await
        .unwrap();
    assert_eq!(outcome, GuardedWrite::LockLost);

    let after = store.get("atomic").await.unwrap().unwrap();
    assert_eq!(after.user_id, stored.user_id);
}

#[tokio::test]
async fn expired_lock_frees_the_slot_for_liveness() {
    let kv = Arc::new(MemoryKv::new());
    let lock = LockManager::new(kv.clone());
    let key = lock_key("liveness");

    assert!(
        lock.acquire(&key, "crashed-worker", Duration::from_millis(30))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(60)).await;

    // The crashed worker never released; the TTL did it.
    assert!(kv.get(&key).await.unwrap().is_none());
    assert!(
        lock.acquire(&key, "replacement", Duration::from_secs(30))
            .await
            .unwrap()
    );
}
