//! Shared state storage.
//!
//! All coordination state (worker map, request bindings, dedup markers, the
//! inbound-message buffers) lives behind [`SharedStore`] so the registry
//! and router never touch a concrete backend directly.

pub mod keys;
pub mod memory;
pub mod mutex;
mod traits;

pub use memory::MemoryStore;
pub use mutex::{LockToken, StoreMutex};
pub use traits::{SharedStore, StoreChange};
