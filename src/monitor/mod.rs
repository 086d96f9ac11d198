//! Completion monitoring.
//!
//! After a prompt is dispatched the coordinator polls the driver until the
//! surface settles, then delivers exactly one response frame over the link
//! that carried the request. A newer request for the same worker supersedes
//! the poller, which then abandons without emitting anything.

pub mod normalize;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::conn::{FrameSink, SendTarget};
use crate::driver::AutomationDriver;
use crate::protocol::{FailureKind, Outbound, Usage, WorkerId};
use crate::registry::WorkerRegistry;
use crate::store::{SharedStore, keys};

enum Outcome {
    Completed(String),
    TimedOut { polls: u32 },
    Truncated,
    NoResponse,
    Errored(String),
}

enum Probe {
    Pending,
    Terminal(Outcome),
}

pub struct ResponseMonitor {
    config: CoordinatorConfig,
    registry: Arc<WorkerRegistry>,
    driver: Arc<dyn AutomationDriver>,
    store: Arc<dyn SharedStore>,
    sink: Arc<dyn FrameSink>,
    /// Which request currently owns each worker's poller.
    active: Mutex<HashMap<WorkerId, String>>,
}

impl ResponseMonitor {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<WorkerRegistry>,
        driver: Arc<dyn AutomationDriver>,
        store: Arc<dyn SharedStore>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            config,
            registry,
            driver,
            store,
            sink,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Starts polling `worker` for the completion of `request_id`.
    ///
    /// Returns the request id of a poller this call superseded, if any; the
    /// superseded poller will notice on its next tick and abandon.
    pub fn watch(
        self: &Arc<Self>,
        worker: WorkerId,
        request_id: String,
        prompt: String,
    ) -> Option<String> {
        let previous = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(worker, request_id.clone())
        };
        if let Some(prev) = &previous {
            info!(worker = %worker, superseded = %prev, request_id, "request superseded");
        }
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.poll(worker, request_id, prompt).await;
        });
        previous
    }

    /// The request id currently being polled for `worker`, if any.
    pub fn watching(&self, worker: WorkerId) -> Option<String> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.get(&worker).cloned()
    }

    fn superseded(&self, worker: WorkerId, request_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.get(&worker).map(String::as_str) != Some(request_id)
    }

    async fn poll(&self, worker: WorkerId, request_id: String, prompt: String) {
        tokio::time::sleep(self.config.initial_poll_delay).await;
        let mut polls = 0u32;

        let outcome = loop {
            if self.superseded(worker, &request_id) {
                debug!(worker = %worker, request_id, "poller superseded, abandoning");
                return;
            }
            if polls >= self.config.max_polls {
                break Outcome::TimedOut { polls };
            }
            match self.probe(worker).await {
                Probe::Pending => {}
                Probe::Terminal(outcome) => break outcome,
            }
            polls += 1;
            tokio::time::sleep(self.config.poll_interval).await;
        };

        self.settle(worker, &request_id, &prompt, outcome).await;
    }

    async fn probe(&self, worker: WorkerId) -> Probe {
        match self.driver.needs_continuation(worker).await {
            Ok(true) => return Probe::Terminal(Outcome::Truncated),
            Ok(false) => {}
            Err(err) => return Probe::Terminal(Outcome::Errored(err.to_string())),
        }
        match self.driver.is_busy(worker).await {
            Ok(true) => Probe::Pending,
            Ok(false) => match self.driver.fetch_result(worker).await {
                Ok(Some(text)) => Probe::Terminal(Outcome::Completed(text)),
                Ok(None) => Probe::Terminal(Outcome::NoResponse),
                Err(err) => Probe::Terminal(Outcome::Errored(err.to_string())),
            },
            Err(err) => Probe::Terminal(Outcome::Errored(err.to_string())),
        }
    }

    /// Terminal path. Releases the worker, consumes the request binding, and
    /// emits the response. The binding removal is the exactly-once gate: if
    /// another path already consumed it, nothing is sent.
    async fn settle(&self, worker: WorkerId, request_id: &str, prompt: &str, outcome: Outcome) {
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.get(&worker).map(String::as_str) == Some(request_id) {
                active.remove(&worker);
            }
        }

        if let Err(err) = self.registry.release(worker).await {
            warn!(worker = %worker, error = %err, "release after settle failed");
        }

        let binding = match self.store.remove(&keys::request(request_id)).await {
            Ok(Some(binding)) => binding,
            Ok(None) => {
                debug!(request_id, "request already settled");
                return;
            }
            Err(err) => {
                warn!(request_id, error = %err, "failed to consume request binding");
                return;
            }
        };

        let frame = match outcome {
            Outcome::Completed(raw) => {
                let text = normalize::normalize(&raw);
                let usage = Usage::estimate(prompt, &text);
                info!(worker = %worker, request_id, chars = text.len(), "request completed");
                Outbound::prompt_success(request_id, worker, text, usage)
            }
            Outcome::TimedOut { polls } => {
                warn!(worker = %worker, request_id, polls, "request timed out");
                Outbound::prompt_failure(
                    request_id,
                    worker,
                    format!("no completion after {polls} polls"),
                    FailureKind::Timeout,
                )
            }
            Outcome::Truncated => Outbound::prompt_failure(
                request_id,
                worker,
                "response was truncated by the surface",
                FailureKind::Truncated,
            ),
            Outcome::NoResponse => Outbound::prompt_failure(
                request_id,
                worker,
                "surface settled without producing a response",
                FailureKind::NoResponse,
            ),
            Outcome::Errored(reason) => Outbound::prompt_failure(
                request_id,
                worker,
                reason,
                FailureKind::ProcessingError,
            ),
        };

        let target = binding
            .get("connection")
            .and_then(Value::as_str)
            .map(|c| SendTarget::Connection(c.to_string()))
            .unwrap_or(SendTarget::All);
        if let Err(err) = self.sink.send(target, &frame).await {
            warn!(request_id, error = %err, "failed to deliver response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::TestSink;
    use crate::driver::NullDriver;
    use crate::error::DriverError;
    use crate::protocol::WorkerStatus;
    use crate::registry::WorkerObservation;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct ScriptedDriver {
        busy: Mutex<VecDeque<bool>>,
        result: Mutex<Option<String>>,
        continuation: AtomicBool,
    }

    impl ScriptedDriver {
        fn new(busy: &[bool], result: Option<&str>) -> Self {
            Self {
                busy: Mutex::new(busy.iter().copied().collect()),
                result: Mutex::new(result.map(str::to_string)),
                continuation: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl AutomationDriver for ScriptedDriver {
        async fn dispatch(
            &self,
            _worker: WorkerId,
            _payload: &str,
            _new_task: bool,
        ) -> Result<(), DriverError> {
            Ok(())
        }

        async fn is_busy(&self, _worker: WorkerId) -> Result<bool, DriverError> {
            Ok(self.busy.lock().unwrap().pop_front().unwrap_or(false))
        }

        async fn needs_continuation(&self, _worker: WorkerId) -> Result<bool, DriverError> {
            Ok(self.continuation.load(Ordering::SeqCst))
        }

        async fn fetch_result(&self, _worker: WorkerId) -> Result<Option<String>, DriverError> {
            Ok(self.result.lock().unwrap().clone())
        }

        async fn scan(&self) -> Result<Vec<WorkerObservation>, DriverError> {
            Ok(Vec::new())
        }
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            initial_poll_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
            max_polls: 40,
            min_idle_before_reuse: Duration::ZERO,
            ..CoordinatorConfig::default()
        }
    }

    struct Fixture {
        monitor: Arc<ResponseMonitor>,
        registry: Arc<WorkerRegistry>,
        store: Arc<MemoryStore>,
        sink: Arc<TestSink>,
    }

    async fn fixture(driver: Arc<dyn AutomationDriver>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(WorkerRegistry::new(
            store.clone() as Arc<dyn SharedStore>,
            fast_config(),
        ));
        registry
            .sync_observations(vec![WorkerObservation {
                worker_id: WorkerId(1),
                label: "w1".into(),
                status: WorkerStatus::Free,
            }])
            .await
            .unwrap();
        let sink = Arc::new(TestSink::new());
        let monitor = Arc::new(ResponseMonitor::new(
            fast_config(),
            registry.clone(),
            driver,
            store.clone() as Arc<dyn SharedStore>,
            sink.clone() as Arc<dyn FrameSink>,
        ));
        Fixture {
            monitor,
            registry,
            store,
            sink,
        }
    }

    async fn bind_and_acquire(fx: &Fixture, request_id: &str) {
        fx.store
            .set(
                &keys::request(request_id),
                json!({"connection": "c1", "workerId": 1}),
            )
            .await
            .unwrap();
        fx.registry
            .acquire(WorkerId(1), request_id, None, false)
            .await
            .unwrap();
    }

    async fn wait_for_frames(sink: &TestSink, count: usize) -> Vec<Value> {
        for _ in 0..200 {
            let sent = sink.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sink.sent()
    }

    #[tokio::test]
    async fn busy_then_idle_yields_one_success_and_frees_worker() {
        let driver = Arc::new(ScriptedDriver::new(&[true, true, true, false], Some("done &amp; dusted")));
        let fx = fixture(driver).await;
        bind_and_acquire(&fx, "req-1").await;

        fx.monitor.watch(WorkerId(1), "req-1".into(), "do the thing".into());

        let frames = wait_for_frames(&fx.sink, 1).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "promptResponse");
        assert_eq!(frames[0]["success"], true);
        assert_eq!(frames[0]["response"], "done & dusted");
        assert!(frames[0]["usage"]["totalTokens"].as_u64().unwrap() > 0);

        let worker = fx.registry.get(WorkerId(1)).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Free);
        // Binding consumed: a second settle could not emit again.
        assert!(fx.store.get(&keys::request("req-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_budget_exhaustion_times_out() {
        let always_busy: Vec<bool> = vec![true; 200];
        let driver = Arc::new(ScriptedDriver::new(&always_busy, None));
        let fx = fixture(driver).await;
        bind_and_acquire(&fx, "req-t").await;

        fx.monitor.watch(WorkerId(1), "req-t".into(), "p".into());

        let frames = wait_for_frames(&fx.sink, 1).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["success"], false);
        assert_eq!(frames[0]["errorType"], "TIMEOUT");
        let worker = fx.registry.get(WorkerId(1)).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Free);
    }

    #[tokio::test]
    async fn continuation_offer_is_reported_as_truncated() {
        let driver = Arc::new(ScriptedDriver::new(&[true], Some("partial")));
        driver.continuation.store(true, Ordering::SeqCst);
        let fx = fixture(driver).await;
        bind_and_acquire(&fx, "req-c").await;

        fx.monitor.watch(WorkerId(1), "req-c".into(), "p".into());

        let frames = wait_for_frames(&fx.sink, 1).await;
        assert_eq!(frames[0]["errorType"], "TRUNCATED");
    }

    #[tokio::test]
    async fn idle_surface_with_no_result_is_no_response() {
        let driver = Arc::new(ScriptedDriver::new(&[true, true, false], None));
        let fx = fixture(driver).await;
        bind_and_acquire(&fx, "req-n").await;

        fx.monitor.watch(WorkerId(1), "req-n".into(), "p".into());

        let frames = wait_for_frames(&fx.sink, 1).await;
        assert_eq!(frames[0]["errorType"], "NO_RESPONSE");
    }

    #[tokio::test]
    async fn superseded_poller_emits_nothing() {
        let always_busy: Vec<bool> = vec![true; 200];
        let driver = Arc::new(ScriptedDriver::new(&always_busy, Some("late answer")));
        let fx = fixture(driver.clone()).await;
        bind_and_acquire(&fx, "req-a").await;

        fx.monitor.watch(WorkerId(1), "req-a".into(), "p".into());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A newer request takes over the worker.
        let prev = fx.monitor.watch(WorkerId(1), "req-b".into(), "p2".into());
        assert_eq!(prev.as_deref(), Some("req-a"));
        fx.store
            .set(&keys::request("req-b"), json!({"connection": "c1", "workerId": 1}))
            .await
            .unwrap();

        // Let the second poller finish: drain busy, then produce the result.
        fx.sink.take();
        driver.busy.lock().unwrap().clear();

        let frames = wait_for_frames(&fx.sink, 1).await;
        assert_eq!(frames.len(), 1, "only the superseding request settles");
        assert_eq!(frames[0]["requestId"], "req-b");
        assert_eq!(frames[0]["success"], true);
    }

    #[tokio::test]
    async fn null_driver_settles_without_response() {
        let fx = fixture(Arc::new(NullDriver)).await;
        bind_and_acquire(&fx, "req-z").await;
        // NullDriver is idle with nothing to fetch, so the first probe
        // settles the request as unanswered.
        fx.monitor.watch(WorkerId(1), "req-z".into(), "p".into());
        let frames = wait_for_frames(&fx.sink, 1).await;
        assert_eq!(frames[0]["errorType"], "NO_RESPONSE");
    }

    #[tokio::test]
    async fn completion_before_first_poll_is_still_delivered() {
        // The surface finished inside the initial delay: never observed busy,
        // result already waiting when polling starts.
        let driver = Arc::new(ScriptedDriver::new(&[false], Some("quick answer")));
        let fx = fixture(driver).await;
        bind_and_acquire(&fx, "req-q").await;

        fx.monitor.watch(WorkerId(1), "req-q".into(), "p".into());

        let frames = wait_for_frames(&fx.sink, 1).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["success"], true);
        assert_eq!(frames[0]["response"], "quick answer");

        let worker = fx.registry.get(WorkerId(1)).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Free);
    }
}
