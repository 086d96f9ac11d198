use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::WorkerId;
use crate::registry::worker::Worker;

/// Short-lived read cache over the worker map.
///
/// Invalidated on every write; the TTL only bounds how long a stale read can
/// survive a missed invalidation.
pub struct WorkerCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, HashMap<WorkerId, Worker>)>>,
}

impl WorkerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<HashMap<WorkerId, Worker>> {
        let entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        entry
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, workers)| workers.clone())
    }

    pub fn put(&self, workers: HashMap<WorkerId, Worker>) {
        let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        *entry = Some((Instant::now(), workers));
    }

    pub fn invalidate(&self) {
        let mut entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        *entry = None;
    }
}
