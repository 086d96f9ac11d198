//! Automation driver seam.
//!
//! The coordinator never talks to worker surfaces directly; everything it
//! knows about them flows through [`AutomationDriver`]. Production wires in a
//! driver backed by the host automation channel, tests script one.

use async_trait::async_trait;

use crate::error::DriverError;
use crate::protocol::WorkerId;
use crate::registry::WorkerObservation;

#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Delivers a prompt to a worker surface and starts it processing.
    async fn dispatch(
        &self,
        worker: WorkerId,
        payload: &str,
        new_task: bool,
    ) -> Result<(), DriverError>;

    /// Whether the worker surface is still processing.
    async fn is_busy(&self, worker: WorkerId) -> Result<bool, DriverError>;

    /// Whether the surface stopped early and is offering to continue. Such a
    /// response is treated as truncated, never auto-continued.
    async fn needs_continuation(&self, worker: WorkerId) -> Result<bool, DriverError>;

    /// The latest completed response text, if one is present.
    async fn fetch_result(&self, worker: WorkerId) -> Result<Option<String>, DriverError>;

    /// Enumerates the worker surfaces currently visible to the driver.
    async fn scan(&self) -> Result<Vec<WorkerObservation>, DriverError>;
}

/// Driver for environments with no automation channel attached. Dispatch
/// fails, scans come back empty.
pub struct NullDriver;

#[async_trait]
impl AutomationDriver for NullDriver {
    async fn dispatch(
        &self,
        worker: WorkerId,
        _payload: &str,
        _new_task: bool,
    ) -> Result<(), DriverError> {
        Err(DriverError::Unavailable {
            worker,
            reason: "no automation channel attached".to_string(),
        })
    }

    async fn is_busy(&self, _worker: WorkerId) -> Result<bool, DriverError> {
        Ok(false)
    }

    async fn needs_continuation(&self, _worker: WorkerId) -> Result<bool, DriverError> {
        Ok(false)
    }

    async fn fetch_result(&self, _worker: WorkerId) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    async fn scan(&self) -> Result<Vec<WorkerObservation>, DriverError> {
        Ok(Vec::new())
    }
}
