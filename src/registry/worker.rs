use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::protocol::{WorkerId, WorkerSnapshot, WorkerStatus};

/// Persistent worker record, stored under the worker map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub worker_id: WorkerId,
    pub label: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_request_id: Option<String>,
    /// Unix millis of the last mutation.
    pub updated_at: i64,
    /// Unix millis of the last release, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<i64>,
}

impl Worker {
    pub fn new(worker_id: WorkerId, label: impl Into<String>, status: WorkerStatus) -> Self {
        Self {
            worker_id,
            label: label.into(),
            status,
            request_count: 0,
            workspace_link: None,
            active_request_id: None,
            updated_at: Utc::now().timestamp_millis(),
            released_at: None,
        }
    }

    /// Whether this worker can take a new request right now.
    pub fn can_accept(&self, min_idle: Duration) -> bool {
        if self.status != WorkerStatus::Free {
            return false;
        }
        match self.released_at {
            Some(released_at) => {
                let idle_ms = Utc::now().timestamp_millis().saturating_sub(released_at);
                idle_ms >= min_idle.as_millis() as i64
            }
            None => true,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().timestamp_millis();
    }

    pub fn snapshot(&self, min_idle: Duration) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id,
            label: self.label.clone(),
            status: self.status,
            can_accept: self.can_accept(min_idle),
            request_count: self.request_count,
            workspace_link: self.workspace_link.clone(),
            active_request_id: self.active_request_id.clone(),
        }
    }
}

/// What a driver scan reports about one worker.
///
/// Observations carry no request bookkeeping; the registry preserves its own
/// counters and bindings when merging.
#[derive(Debug, Clone)]
pub struct WorkerObservation {
    pub worker_id: WorkerId,
    pub label: String,
    pub status: WorkerStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_worker_cannot_accept() {
        let mut worker = Worker::new(WorkerId(1), "w1", WorkerStatus::Free);
        assert!(worker.can_accept(Duration::ZERO));
        worker.status = WorkerStatus::Busy;
        assert!(!worker.can_accept(Duration::ZERO));
        worker.status = WorkerStatus::Sleeping;
        assert!(!worker.can_accept(Duration::ZERO));
    }

    #[test]
    fn recent_release_blocks_reuse_until_idle() {
        let mut worker = Worker::new(WorkerId(1), "w1", WorkerStatus::Free);
        worker.released_at = Some(Utc::now().timestamp_millis());
        assert!(!worker.can_accept(Duration::from_secs(60)));
        assert!(worker.can_accept(Duration::ZERO));

        worker.released_at = Some(Utc::now().timestamp_millis() - 120_000);
        assert!(worker.can_accept(Duration::from_secs(60)));
    }
}
