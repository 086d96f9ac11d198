use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StoreError;

/// Notification emitted after every mutation of the store.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Key/value store shared by every coordinator component.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Removes a key, returning the previous value if any.
    async fn remove(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Stores `value` only when `key` is vacant. Returns whether the write
    /// happened. This is the atomic mark used for request deduplication.
    async fn set_if_absent(&self, key: &str, value: Value) -> Result<bool, StoreError>;

    /// Subscribes to change notifications for every key.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}
