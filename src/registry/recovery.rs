//! Stale-worker recovery.
//!
//! A worker can get stuck busy when its request dies without settling (the
//! connection dropped mid-poll, the process restarted). The sweep compares
//! the registry against the driver's busy signal and force-releases workers
//! the driver says are idle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::driver::AutomationDriver;
use crate::error::RegistryError;
use crate::protocol::WorkerStatus;
use crate::registry::WorkerRegistry;

/// One recovery pass. Returns how many workers were force-released.
///
/// `grace` protects just-dispatched requests: a busy worker touched more
/// recently than this is left alone even if the driver reports idle, since
/// the surface may simply not have started yet.
pub async fn sweep_once(
    registry: &WorkerRegistry,
    driver: &dyn AutomationDriver,
    grace: Duration,
) -> Result<usize, RegistryError> {
    let now = Utc::now().timestamp_millis();
    let grace_ms = grace.as_millis() as i64;
    let mut released = 0;

    for worker in registry.load_all().await?.into_values() {
        if worker.status != WorkerStatus::Busy {
            continue;
        }
        if now.saturating_sub(worker.updated_at) < grace_ms {
            continue;
        }
        match driver.is_busy(worker.worker_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    worker = %worker.worker_id,
                    request_id = worker.active_request_id.as_deref(),
                    "busy worker has an idle surface, force-releasing"
                );
                if registry.release(worker.worker_id).await? {
                    released += 1;
                }
            }
            Err(err) => {
                warn!(worker = %worker.worker_id, error = %err, "recovery probe failed");
            }
        }
    }

    if released > 0 {
        info!(released, "recovery sweep released stuck workers");
    }
    Ok(released)
}

/// Runs [`sweep_once`] forever on a fixed interval.
pub fn spawn(
    registry: Arc<WorkerRegistry>,
    driver: Arc<dyn AutomationDriver>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = sweep_once(&registry, driver.as_ref(), interval).await {
                warn!(error = %err, "recovery sweep failed");
            }
        }
    })
}
