use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::RegistryError;
use crate::protocol::{WorkerId, WorkerSnapshot, WorkerStatus};
use crate::registry::cache::WorkerCache;
use crate::registry::worker::{Worker, WorkerObservation};
use crate::store::{SharedStore, StoreMutex, keys};

/// Coordinates every mutation of the worker map.
///
/// All writes go through [`StoreMutex`], so two concurrent acquisitions of
/// the same worker can never both succeed. Failed operations leave the map
/// untouched: records are mutated on a copy and persisted only on success.
pub struct WorkerRegistry {
    store: Arc<dyn SharedStore>,
    mutex: StoreMutex,
    cache: WorkerCache,
    config: CoordinatorConfig,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn SharedStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            mutex: StoreMutex::new("worker-registry", config.mutex_staleness),
            cache: WorkerCache::new(config.cache_ttl),
            config,
        }
    }

    /// Loads the full worker map, serving from cache when fresh.
    pub async fn load_all(&self) -> Result<HashMap<WorkerId, Worker>, RegistryError> {
        if let Some(workers) = self.cache.get() {
            return Ok(workers);
        }
        let workers = self.load_uncached().await?;
        self.cache.put(workers.clone());
        Ok(workers)
    }

    async fn load_uncached(&self) -> Result<HashMap<WorkerId, Worker>, RegistryError> {
        let raw = self.store.get(keys::WORKERS).await?;
        let workers = match raw {
            Some(value) => {
                let by_field: HashMap<String, Worker> = serde_json::from_value(value)
                    .map_err(crate::error::StoreError::Serialization)?;
                by_field.into_values().map(|w| (w.worker_id, w)).collect()
            }
            None => HashMap::new(),
        };
        Ok(workers)
    }

    async fn persist(&self, workers: &HashMap<WorkerId, Worker>) -> Result<(), RegistryError> {
        let by_field: HashMap<String, &Worker> = workers
            .iter()
            .map(|(id, w)| (keys::worker_field(*id), w))
            .collect();
        let value: Value =
            serde_json::to_value(&by_field).map_err(crate::error::StoreError::Serialization)?;
        self.cache.invalidate();
        self.store.set(keys::WORKERS, value).await?;
        self.cache.put(workers.clone());
        Ok(())
    }

    pub async fn get(&self, worker_id: WorkerId) -> Result<Option<Worker>, RegistryError> {
        Ok(self.load_all().await?.get(&worker_id).cloned())
    }

    /// Claims a free worker for `request_id`.
    ///
    /// Fails with [`RegistryError::Conflict`] when the worker is busy or
    /// sleeping, and with [`RegistryError::NotFound`] when it does not exist.
    /// On failure the stored record is unchanged.
    pub async fn acquire(
        &self,
        worker_id: WorkerId,
        request_id: &str,
        workspace_link: Option<&str>,
        is_new_task: bool,
    ) -> Result<Worker, RegistryError> {
        let token = self.mutex.acquire("acquire").await;
        let result = self
            .acquire_locked(worker_id, request_id, workspace_link, is_new_task)
            .await;
        self.mutex.release(token);
        result
    }

    async fn acquire_locked(
        &self,
        worker_id: WorkerId,
        request_id: &str,
        workspace_link: Option<&str>,
        is_new_task: bool,
    ) -> Result<Worker, RegistryError> {
        let mut workers = self.load_all().await?;
        let Some(existing) = workers.get(&worker_id) else {
            return Err(RegistryError::NotFound { worker: worker_id });
        };
        if !existing.can_accept(self.config.min_idle_before_reuse) {
            return Err(RegistryError::Conflict {
                worker: worker_id,
                active_request: existing.active_request_id.clone(),
            });
        }

        let mut worker = existing.clone();
        worker.status = WorkerStatus::Busy;
        worker.request_count += 1;
        worker.active_request_id = Some(request_id.to_string());
        if is_new_task {
            worker.workspace_link = workspace_link.map(str::to_string);
        } else if let Some(link) = workspace_link {
            worker.workspace_link = Some(link.to_string());
        }
        worker.touch();
        info!(
            worker = %worker_id,
            request_id,
            request_count = worker.request_count,
            "worker acquired"
        );

        workers.insert(worker_id, worker.clone());
        self.persist(&workers).await?;
        Ok(worker)
    }

    /// Frees a busy worker. Releasing a worker that is already free, asleep
    /// or unknown is a no-op; `Ok(true)` means the record actually changed.
    pub async fn release(&self, worker_id: WorkerId) -> Result<bool, RegistryError> {
        let token = self.mutex.acquire("release").await;
        let result = self.release_locked(worker_id).await;
        self.mutex.release(token);
        result
    }

    async fn release_locked(&self, worker_id: WorkerId) -> Result<bool, RegistryError> {
        let mut workers = self.load_all().await?;
        let Some(worker) = workers.get_mut(&worker_id) else {
            debug!(worker = %worker_id, "release for unknown worker ignored");
            return Ok(false);
        };
        if worker.status != WorkerStatus::Busy {
            debug!(worker = %worker_id, status = %worker.status, "release is a no-op");
            return Ok(false);
        }

        worker.status = WorkerStatus::Free;
        worker.active_request_id = None;
        worker.released_at = Some(Utc::now().timestamp_millis());
        worker.touch();
        info!(worker = %worker_id, "worker released");

        let snapshot = workers.clone();
        self.persist(&snapshot).await?;
        Ok(true)
    }

    /// Applies an explicit status change with transition rules: a sleeping
    /// worker must wake (go free) before it can be claimed, and a busy worker
    /// cannot be put to sleep mid-task.
    pub async fn set_status(
        &self,
        worker_id: WorkerId,
        status: WorkerStatus,
        request_id: Option<&str>,
        workspace_link: Option<&str>,
    ) -> Result<Worker, RegistryError> {
        let token = self.mutex.acquire("set-status").await;
        let result = self
            .set_status_locked(worker_id, status, request_id, workspace_link)
            .await;
        self.mutex.release(token);
        result
    }

    async fn set_status_locked(
        &self,
        worker_id: WorkerId,
        status: WorkerStatus,
        request_id: Option<&str>,
        workspace_link: Option<&str>,
    ) -> Result<Worker, RegistryError> {
        let mut workers = self.load_all().await?;
        let Some(existing) = workers.get(&worker_id) else {
            return Err(RegistryError::NotFound { worker: worker_id });
        };

        let mut worker = existing.clone();
        match (existing.status, status) {
            (WorkerStatus::Busy, WorkerStatus::Sleeping) => {
                return Err(RegistryError::InvalidTransition {
                    worker: worker_id,
                    from: existing.status.to_string(),
                    to: status.to_string(),
                });
            }
            (WorkerStatus::Sleeping, WorkerStatus::Busy) => {
                return Err(RegistryError::InvalidTransition {
                    worker: worker_id,
                    from: existing.status.to_string(),
                    to: status.to_string(),
                });
            }
            (WorkerStatus::Busy, WorkerStatus::Busy) => {
                // Re-assert with a different request id is a conflict.
                if request_id.is_some() && existing.active_request_id.as_deref() != request_id {
                    return Err(RegistryError::Conflict {
                        worker: worker_id,
                        active_request: existing.active_request_id.clone(),
                    });
                }
            }
            (_, WorkerStatus::Busy) => {
                worker.status = WorkerStatus::Busy;
                worker.request_count += 1;
                worker.active_request_id = request_id.map(str::to_string);
            }
            (WorkerStatus::Busy, WorkerStatus::Free) => {
                worker.status = WorkerStatus::Free;
                worker.active_request_id = None;
                worker.released_at = Some(Utc::now().timestamp_millis());
            }
            (WorkerStatus::Sleeping, WorkerStatus::Free) => {
                info!(worker = %worker_id, "worker woken");
                worker.status = WorkerStatus::Free;
            }
            (from, to) if from == to => {}
            (_, WorkerStatus::Sleeping) => {
                worker.status = WorkerStatus::Sleeping;
            }
            (_, WorkerStatus::Free) => {
                worker.status = WorkerStatus::Free;
            }
        }
        if let Some(link) = workspace_link {
            worker.workspace_link = Some(link.to_string());
        }
        worker.touch();

        workers.insert(worker_id, worker.clone());
        self.persist(&workers).await?;
        Ok(worker)
    }

    /// Replaces the worker map with the latest driver scan, preserving
    /// request bookkeeping for workers that are still present. A worker that
    /// disappeared from the scan is dropped.
    pub async fn sync_observations(
        &self,
        observed: Vec<WorkerObservation>,
    ) -> Result<(), RegistryError> {
        let token = self.mutex.acquire("sync").await;
        let result = self.sync_locked(observed).await;
        self.mutex.release(token);
        result
    }

    async fn sync_locked(&self, observed: Vec<WorkerObservation>) -> Result<(), RegistryError> {
        let existing = self.load_all().await?;
        let mut next = HashMap::with_capacity(observed.len());
        for obs in observed {
            let worker = match existing.get(&obs.worker_id) {
                Some(prev) => {
                    let mut worker = prev.clone();
                    worker.label = obs.label;
                    // An in-flight request owns the status until it settles.
                    if !(prev.status == WorkerStatus::Busy && prev.active_request_id.is_some()) {
                        worker.status = obs.status;
                    }
                    worker.touch();
                    worker
                }
                None => Worker::new(obs.worker_id, obs.label, obs.status),
            };
            next.insert(worker.worker_id, worker);
        }
        for gone in existing.keys().filter(|id| !next.contains_key(id)) {
            warn!(worker = %gone, "worker disappeared from scan");
        }
        self.persist(&next).await?;
        Ok(())
    }

    /// Snapshots of workers that can accept a request right now.
    pub async fn available_snapshots(&self) -> Result<Vec<WorkerSnapshot>, RegistryError> {
        let min_idle = self.config.min_idle_before_reuse;
        let mut snapshots: Vec<WorkerSnapshot> = self
            .load_all()
            .await?
            .values()
            .filter(|w| w.can_accept(min_idle))
            .map(|w| w.snapshot(min_idle))
            .collect();
        snapshots.sort_by_key(|s| s.worker_id);
        Ok(snapshots)
    }

    /// Snapshots of every worker, ordered by id.
    pub async fn all_snapshots(&self) -> Result<Vec<WorkerSnapshot>, RegistryError> {
        let min_idle = self.config.min_idle_before_reuse;
        let mut snapshots: Vec<WorkerSnapshot> = self
            .load_all()
            .await?
            .values()
            .map(|w| w.snapshot(min_idle))
            .collect();
        snapshots.sort_by_key(|s| s.worker_id);
        Ok(snapshots)
    }

    /// Snapshots of workers bound to a workspace link that can take a request
    /// right now. Busy and sleeping workers are not dispatch candidates, so
    /// they are left out even when they carry the link.
    pub async fn snapshots_by_workspace(
        &self,
        workspace_link: &str,
    ) -> Result<Vec<WorkerSnapshot>, RegistryError> {
        let min_idle = self.config.min_idle_before_reuse;
        let mut snapshots: Vec<WorkerSnapshot> = self
            .load_all()
            .await?
            .values()
            .filter(|w| {
                w.workspace_link.as_deref() == Some(workspace_link)
                    && w.can_accept(min_idle)
            })
            .map(|w| w.snapshot(min_idle))
            .collect();
        snapshots.sort_by_key(|s| s.worker_id);
        Ok(snapshots)
    }

    /// Clears a workspace link from every worker that carries it.
    pub async fn cleanup_workspace(&self, workspace_link: &str) -> Result<usize, RegistryError> {
        let token = self.mutex.acquire("cleanup-workspace").await;
        let result = self.cleanup_workspace_locked(workspace_link).await;
        self.mutex.release(token);
        result
    }

    async fn cleanup_workspace_locked(
        &self,
        workspace_link: &str,
    ) -> Result<usize, RegistryError> {
        let mut workers = self.load_all().await?;
        let mut cleared = 0;
        for worker in workers.values_mut() {
            if worker.workspace_link.as_deref() == Some(workspace_link) {
                worker.workspace_link = None;
                worker.touch();
                cleared += 1;
            }
        }
        if cleared > 0 {
            let snapshot = workers.clone();
            self.persist(&snapshot).await?;
        }
        Ok(cleared)
    }
}
