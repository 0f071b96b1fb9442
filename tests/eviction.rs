#![cfg(feature = "inmemory")]

use coalesce_kit::backend::InMemoryStore;
use coalesce_kit::{CoalesceCacheManager, KeyStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_evict_all_announces_each_key_to_other_processes() {
    let store = InMemoryStore::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let observer = {
        let seen = Arc::clone(&seen);
        CoalesceCacheManager::new(store.clone(), store.clone())
            .on_eviction(move |event| seen.lock().unwrap().push(event.key.clone()))
    };
    observer.start().await.unwrap();

    let evictor = CoalesceCacheManager::new(store.clone(), store.clone());
    evictor.start().await.unwrap();

    for key in ["users:1", "users:2", "other:1"] {
        evictor.put(key, &key.to_string(), None).await.unwrap();
    }

    let removed = evictor.evict_all("users").await.unwrap();
    assert_eq!(removed, 2);
    assert!(store.exists("cache:other:1").await.unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut keys = seen.lock().unwrap().clone();
    keys.sort();
    assert_eq!(keys, vec!["cache:users:1", "cache:users:2"]);
}

#[tokio::test]
async fn test_evict_pattern_and_clear() {
    let store = InMemoryStore::new();
    let manager = CoalesceCacheManager::new(store.clone(), store.clone());
    manager.start().await.unwrap();

    for key in ["users:1:profile", "users:2:profile", "users:2:avatar", "orders:1"] {
        manager.put(key, &1u32, None).await.unwrap();
    }
    store
        .set_if_absent("lock:orders:1", b"someone".to_vec(), Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(manager.evict_pattern("users:*:profile").await.unwrap(), 2);
    assert!(manager.exists("users:2:avatar").await.unwrap());

    assert_eq!(manager.clear().await.unwrap(), 2);
    assert!(!manager.exists("orders:1").await.unwrap());
    assert!(store.exists("lock:orders:1").await.unwrap());
}

#[tokio::test]
async fn test_evicted_key_is_reloaded() {
    let store = InMemoryStore::new();
    let manager = CoalesceCacheManager::new(store.clone(), store.clone());
    manager.start().await.unwrap();

    let first: Option<u32> = manager
        .get_or_load("n", || async { Ok::<_, std::io::Error>(Some(1)) }, None, false)
        .await
        .unwrap();
    assert!(manager.evict("n").await.unwrap());

    let second: Option<u32> = manager
        .get_or_load("n", || async { Ok::<_, std::io::Error>(Some(2)) }, None, false)
        .await
        .unwrap();
    assert_eq!((first, second), (Some(1), Some(2)));
}
