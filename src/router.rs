//! Inbound frame routing.
//!
//! Raw frames are validated, deduplicated, recorded, then dispatched. Dedup
//! is mark-before-act: a marker is atomically claimed in the store before any
//! side effect, so a redelivered frame can never run twice even if the first
//! delivery is still in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::CoordinatorConfig;
use crate::conn::{FrameSink, InboundEnvelope, SendTarget};
use crate::driver::AutomationDriver;
use crate::error::{RegistryError, RouterError};
use crate::monitor::ResponseMonitor;
use crate::protocol::{FailureKind, Inbound, Outbound, WorkerId, WorkerStatus};
use crate::registry::WorkerRegistry;
use crate::store::{SharedStore, keys};

pub struct Router {
    config: CoordinatorConfig,
    store: Arc<dyn SharedStore>,
    registry: Arc<WorkerRegistry>,
    driver: Arc<dyn AutomationDriver>,
    monitor: Arc<ResponseMonitor>,
    broadcaster: Broadcaster,
    sink: Arc<dyn FrameSink>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn SharedStore>,
        registry: Arc<WorkerRegistry>,
        driver: Arc<dyn AutomationDriver>,
        monitor: Arc<ResponseMonitor>,
        broadcaster: Broadcaster,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            driver,
            monitor,
            broadcaster,
            sink,
        }
    }

    /// Drains the inbound channel until every connection task is gone.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundEnvelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.handle(envelope).await;
        }
        info!("inbound channel closed, router stopping");
    }

    pub async fn handle(&self, envelope: InboundEnvelope) {
        let connection = envelope.connection.clone();
        let (kind, request_id) = match validate(&envelope.frame) {
            Ok(parts) => parts,
            Err(RouterError::UnknownType(kind)) => {
                debug!(%connection, kind, "unknown frame type");
                self.reply_error(&connection, None, format!("unknown frame type: {kind}"), FailureKind::UnknownType)
                    .await;
                return;
            }
            Err(err) => {
                debug!(%connection, error = %err, "invalid frame");
                self.reply_error(&connection, None, err.to_string(), FailureKind::Validation)
                    .await;
                return;
            }
        };

        self.record(&connection, &kind, request_id.as_deref()).await;

        if let Some(rid) = &request_id {
            if !self.claim_dedup(&kind, rid).await {
                debug!(%connection, kind, request_id = %rid, "duplicate frame dropped");
                return;
            }
        }

        let frame: Inbound = match serde_json::from_value(envelope.frame) {
            Ok(frame) => frame,
            Err(err) => {
                self.reply_error(
                    &connection,
                    request_id,
                    format!("malformed {kind} frame: {err}"),
                    FailureKind::Validation,
                )
                .await;
                return;
            }
        };

        match frame {
            Inbound::Ping { request_id } => {
                self.reply(
                    &connection,
                    &Outbound::Pong {
                        timestamp: Utc::now().timestamp_millis(),
                        request_id,
                    },
                )
                .await;
            }
            Inbound::SendPrompt {
                worker_id,
                payload,
                request_id,
                is_new_task,
                workspace_link,
            } => {
                self.handle_send_prompt(
                    &connection,
                    worker_id,
                    payload,
                    request_id,
                    is_new_task,
                    workspace_link,
                )
                .await;
            }
            Inbound::GetAvailableWorkers { request_id } => {
                match self.registry.available_snapshots().await {
                    Ok(workers) => {
                        let count = workers.len();
                        self.reply(
                            &connection,
                            &Outbound::AvailableWorkers {
                                request_id,
                                workers,
                                count,
                            },
                        )
                        .await;
                    }
                    Err(err) => {
                        self.reply_registry_error(&connection, Some(request_id), err).await;
                    }
                }
            }
            Inbound::GetWorkersByWorkspace {
                workspace_link,
                request_id,
            } => {
                match self.registry.snapshots_by_workspace(&workspace_link).await {
                    Ok(workers) => {
                        let count = workers.len();
                        self.reply(
                            &connection,
                            &Outbound::AvailableWorkers {
                                request_id,
                                workers,
                                count,
                            },
                        )
                        .await;
                    }
                    Err(err) => {
                        self.reply_registry_error(&connection, Some(request_id), err).await;
                    }
                }
            }
            Inbound::CleanupWorkspaceLink { workspace_link } => {
                match self.registry.cleanup_workspace(&workspace_link).await {
                    Ok(cleared) => {
                        info!(%connection, workspace_link, cleared, "workspace link cleaned up");
                    }
                    Err(err) => {
                        warn!(%connection, workspace_link, error = %err, "workspace cleanup failed");
                    }
                }
            }
            Inbound::UpdateWorkerStatus {
                worker_id,
                status,
                request_id,
                workspace_link,
            } => {
                if status == WorkerStatus::Busy && request_id.is_none() {
                    self.reply_error(
                        &connection,
                        None,
                        "updateWorkerStatus to busy requires a requestId",
                        FailureKind::Validation,
                    )
                    .await;
                    return;
                }
                match self
                    .registry
                    .set_status(
                        worker_id,
                        status,
                        request_id.as_deref(),
                        workspace_link.as_deref(),
                    )
                    .await
                {
                    Ok(worker) => {
                        self.reply(
                            &connection,
                            &Outbound::WorkerStatusUpdated {
                                worker_id,
                                status: worker.status,
                            },
                        )
                        .await;
                    }
                    Err(err) => {
                        self.reply_registry_error(&connection, request_id, err).await;
                    }
                }
            }
            Inbound::RefreshWorkers => {
                self.broadcaster.request_broadcast().await;
            }
        }
    }

    async fn handle_send_prompt(
        &self,
        connection: &str,
        worker_id: WorkerId,
        payload: String,
        request_id: String,
        is_new_task: bool,
        workspace_link: Option<String>,
    ) {
        // The binding is written before any side effect so a crash between
        // acquire and dispatch still leaves the request traceable.
        let binding = json!({
            "connection": connection,
            "workerId": worker_id,
            "workspaceLink": workspace_link,
            "payloadLen": payload.len(),
            "receivedAt": Utc::now().timestamp_millis(),
        });
        if let Err(err) = self.store.set(&keys::request(&request_id), binding).await {
            warn!(request_id, error = %err, "failed to persist request binding");
            self.reply(
                connection,
                &Outbound::prompt_failure(
                    &request_id,
                    worker_id,
                    "failed to persist request state",
                    FailureKind::ProcessingError,
                ),
            )
            .await;
            return;
        }

        let acquired = match self
            .registry
            .acquire(worker_id, &request_id, workspace_link.as_deref(), is_new_task)
            .await
        {
            Ok(worker) => Ok(worker),
            Err(RegistryError::Conflict { worker, active_request })
                if is_new_task && self.monitor.watching(worker).is_some() =>
            {
                // A new task may take over a worker stuck on an earlier
                // request; the old poller abandons once superseded.
                info!(
                    worker = %worker,
                    old_request = active_request.as_deref(),
                    new_request = %request_id,
                    "new task taking over busy worker"
                );
                if let Err(err) = self.registry.release(worker).await {
                    warn!(worker = %worker, error = %err, "takeover release failed");
                }
                self.registry
                    .acquire(worker_id, &request_id, workspace_link.as_deref(), is_new_task)
                    .await
            }
            Err(err) => Err(err),
        };

        let worker = match acquired {
            Ok(worker) => worker,
            Err(err) => {
                let _ = self.store.remove(&keys::request(&request_id)).await;
                self.reply_acquire_failure(connection, &request_id, worker_id, err).await;
                return;
            }
        };

        if let Err(err) = self.driver.dispatch(worker_id, &payload, is_new_task).await {
            warn!(worker = %worker_id, request_id, error = %err, "dispatch failed");
            if let Err(release_err) = self.registry.release(worker_id).await {
                warn!(worker = %worker_id, error = %release_err, "release after failed dispatch");
            }
            let _ = self.store.remove(&keys::request(&request_id)).await;
            self.reply(
                connection,
                &Outbound::prompt_failure(&request_id, worker_id, err.to_string(), FailureKind::ProcessingError),
            )
            .await;
            return;
        }

        debug!(
            worker = %worker_id,
            request_id,
            request_count = worker.request_count,
            "prompt dispatched"
        );
        if let Some(superseded) = self.monitor.watch(worker_id, request_id, payload) {
            // The superseded request never settles; drop its binding.
            let _ = self.store.remove(&keys::request(&superseded)).await;
        }
    }

    async fn reply_acquire_failure(
        &self,
        connection: &str,
        request_id: &str,
        worker_id: WorkerId,
        err: RegistryError,
    ) {
        let (kind, message) = registry_failure(&err);
        self.reply(
            connection,
            &Outbound::prompt_failure(request_id, worker_id, message, kind),
        )
        .await;
    }

    async fn reply_registry_error(
        &self,
        connection: &str,
        request_id: Option<String>,
        err: RegistryError,
    ) {
        let (kind, message) = registry_failure(&err);
        self.reply_error(connection, request_id, message, kind).await;
    }

    async fn reply_error(
        &self,
        connection: &str,
        request_id: Option<String>,
        error: impl Into<String>,
        error_type: FailureKind,
    ) {
        self.reply(
            connection,
            &Outbound::Error {
                request_id,
                error: error.into(),
                error_type,
            },
        )
        .await;
    }

    async fn reply(&self, connection: &str, frame: &Outbound) {
        if let Err(err) = self
            .sink
            .send(SendTarget::Connection(connection.to_string()), frame)
            .await
        {
            warn!(%connection, error = %err, "reply failed");
        }
    }

    /// Atomically claims the dedup marker for this frame. Returns false when
    /// the frame was already seen inside its window.
    async fn claim_dedup(&self, kind: &str, request_id: &str) -> bool {
        let key = keys::dedup(kind, request_id);
        let window = if kind == "sendPrompt" {
            self.config.message_ttl
        } else {
            self.config.query_dedup_window
        };
        match self
            .store
            .set_if_absent(&key, json!(Utc::now().timestamp_millis()))
            .await
        {
            Ok(true) => {
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    let _ = store.remove(&key).await;
                });
                true
            }
            Ok(false) => false,
            Err(err) => {
                // Fail open: losing dedup is better than dropping real work.
                warn!(kind, request_id, error = %err, "dedup claim failed");
                true
            }
        }
    }

    /// Appends the frame to its connection's capped message buffer. Each
    /// connection gets its own cap, so one chatty link cannot evict another's
    /// entries.
    async fn record(&self, connection: &str, kind: &str, request_id: Option<&str>) {
        let entry = json!({
            "type": kind,
            "requestId": request_id,
            "receivedAt": Utc::now().timestamp_millis(),
        });
        let result = async {
            let mut buffers = match self.store.get(keys::INBOUND_MESSAGES).await? {
                Some(Value::Object(buffers)) => buffers,
                _ => serde_json::Map::new(),
            };
            let slot = buffers
                .entry(connection.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(entries) = slot {
                entries.push(entry);
                if entries.len() > self.config.message_cap {
                    let excess = entries.len() - self.config.message_cap;
                    entries.drain(..excess);
                }
            }
            self.store
                .set(keys::INBOUND_MESSAGES, Value::Object(buffers))
                .await
        }
        .await;
        if let Err(err) = result {
            debug!(error = %err, "failed to record inbound message");
        }
    }
}

/// Structural checks that run before typed parsing: the frame must be an
/// object, `type` must be a known string, `requestId` a string when present.
fn validate(frame: &Value) -> Result<(String, Option<String>), RouterError> {
    let Some(obj) = frame.as_object() else {
        return Err(RouterError::Validation("frame is not an object".to_string()));
    };
    let kind = match obj.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(RouterError::Validation("type must be a string".to_string())),
        None => return Err(RouterError::Validation("frame has no type".to_string())),
    };
    if !Inbound::KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(RouterError::UnknownType(kind));
    }
    let request_id = match obj.get("requestId") {
        Some(Value::String(rid)) => Some(rid.clone()),
        Some(Value::Null) | None => None,
        Some(_) => {
            return Err(RouterError::Validation("requestId must be a string".to_string()));
        }
    };
    Ok((kind, request_id))
}

fn registry_failure(err: &RegistryError) -> (FailureKind, String) {
    let kind = match err {
        RegistryError::Conflict { .. } => FailureKind::Conflict,
        RegistryError::NotFound { .. } => FailureKind::NotFound,
        RegistryError::InvalidTransition { .. } => FailureKind::Validation,
        RegistryError::Store(_) => FailureKind::ProcessingError,
    };
    (kind, err.to_string())
}

/// Periodically drops recorded messages older than the retention window.
pub fn spawn_message_cleanup(
    store: Arc<dyn SharedStore>,
    config: CoordinatorConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = cleanup_once(store.as_ref(), config.message_ttl).await {
                warn!(error = %err, "inbound message cleanup failed");
            }
        }
    })
}

async fn cleanup_once(
    store: &dyn SharedStore,
    ttl: Duration,
) -> Result<(), crate::error::StoreError> {
    let Some(Value::Object(buffers)) = store.get(keys::INBOUND_MESSAGES).await? else {
        return Ok(());
    };
    let cutoff = Utc::now().timestamp_millis() - ttl.as_millis() as i64;
    let mut dropped = 0usize;
    let mut kept = serde_json::Map::new();
    for (connection, entries) in buffers {
        let Value::Array(entries) = entries else {
            continue;
        };
        let before = entries.len();
        let fresh: Vec<Value> = entries
            .into_iter()
            .filter(|e| e.get("receivedAt").and_then(Value::as_i64).unwrap_or(0) >= cutoff)
            .collect();
        dropped += before - fresh.len();
        // A connection whose buffer drained away is dropped entirely.
        if !fresh.is_empty() {
            kept.insert(connection, Value::Array(fresh));
        }
    }
    if dropped > 0 {
        debug!(dropped, "expired inbound messages dropped");
        store.set(keys::INBOUND_MESSAGES, Value::Object(kept)).await?;
    }
    Ok(())
}
