//! In-process store backend.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};

use crate::error::StoreError;
use crate::store::traits::{SharedStore, StoreChange};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Process-local [`SharedStore`] backed by a `HashMap`.
pub struct MemoryStore {
    data: RwLock<HashMap<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn notify(&self, key: &str, old_value: Option<Value>, new_value: Option<Value>) {
        // No subscribers is fine; broadcast::send only fails then.
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let old = {
            let mut data = self.data.write().await;
            data.insert(key.to_string(), value.clone())
        };
        self.notify(key, old, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let old = {
            let mut data = self.data.write().await;
            data.remove(key)
        };
        if old.is_some() {
            self.notify(key, old.clone(), None);
        }
        Ok(old)
    }

    async fn set_if_absent(&self, key: &str, value: Value) -> Result<bool, StoreError> {
        let inserted = {
            let mut data = self.data.write().await;
            match data.entry(key.to_string()) {
                std::collections::hash_map::Entry::Occupied(_) => false,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(value.clone());
                    true
                }
            }
        };
        if inserted {
            self.notify(key, None, Some(value));
        }
        Ok(inserted)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_remove() {
        let store = MemoryStore::new();
        store.set("k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(store.remove("k").await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.remove("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_is_first_writer_wins() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("mark", json!(1)).await.unwrap());
        assert!(!store.set_if_absent("mark", json!(2)).await.unwrap());
        assert_eq!(store.get("mark").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn mutations_notify_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        store.set("k", json!("v1")).await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "k");
        assert_eq!(change.old_value, None);
        assert_eq!(change.new_value, Some(json!("v1")));

        store.set("k", json!("v2")).await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.old_value, Some(json!("v1")));
        assert_eq!(change.new_value, Some(json!("v2")));

        store.remove("k").await.unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.new_value, None);
    }

    #[tokio::test]
    async fn concurrent_marking_admits_exactly_one_writer() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.set_if_absent("mark", json!(i)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn removing_missing_key_is_silent() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.remove("missing").await.unwrap();
        store.set("other", json!(true)).await.unwrap();
        // The first notification seen is the set, not the no-op remove.
        let change = rx.recv().await.unwrap();
        assert_eq!(change.key, "other");
    }
}
