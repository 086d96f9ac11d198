//! Worker-snapshot broadcasting.
//!
//! Any change to the worker map is pushed to every connected endpoint as a
//! `focusedWorkersUpdate` frame. Triggers are debounced so a burst of
//! mutations produces one frame, and sends are throttled to a minimum
//! spacing. A dropped link clears the remaining peers with an immediate
//! empty snapshot. Nothing is sent while no link is connected.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CoordinatorConfig;
use crate::conn::{ConnEvent, FrameSink, SendTarget};
use crate::protocol::Outbound;
use crate::registry::WorkerRegistry;
use crate::store::{StoreChange, keys};

const TRIGGER_QUEUE: usize = 16;

/// Handle for requesting an out-of-band broadcast (the `refreshWorkers`
/// frame and startup both use this).
#[derive(Clone)]
pub struct Broadcaster {
    trigger: mpsc::Sender<()>,
}

impl Broadcaster {
    /// Spawns the broadcast loop.
    pub fn spawn(
        config: CoordinatorConfig,
        registry: Arc<WorkerRegistry>,
        sink: Arc<dyn FrameSink>,
        store_changes: broadcast::Receiver<StoreChange>,
        conn_events: broadcast::Receiver<ConnEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (trigger, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);
        let task = tokio::spawn(run(config, registry, sink, store_changes, conn_events, trigger_rx));
        (Self { trigger }, task)
    }

    pub async fn request_broadcast(&self) {
        let _ = self.trigger.send(()).await;
    }
}

async fn run(
    config: CoordinatorConfig,
    registry: Arc<WorkerRegistry>,
    sink: Arc<dyn FrameSink>,
    mut store_changes: broadcast::Receiver<StoreChange>,
    mut conn_events: broadcast::Receiver<ConnEvent>,
    mut trigger_rx: mpsc::Receiver<()>,
) {
    let mut pending: Option<Instant> = None;
    let mut last_sent: Option<Instant> = None;

    loop {
        let deadline = pending.unwrap_or_else(|| Instant::now() + config.broadcast_throttle);
        tokio::select! {
            request = trigger_rx.recv() => {
                if request.is_none() {
                    return;
                }
                schedule(&mut pending, &last_sent, &config, config.broadcast_debounce);
            }
            change = store_changes.recv() => {
                match change {
                    Ok(change) if change.key == keys::WORKERS => {
                        schedule(&mut pending, &last_sent, &config, config.broadcast_debounce);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "store change stream lagged");
                        schedule(&mut pending, &last_sent, &config, config.broadcast_debounce);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            event = conn_events.recv() => {
                match event {
                    // A fresh link gets the current snapshot after a short
                    // grace so the peer finishes its handshake first.
                    Ok(ConnEvent::Connected { connection }) => {
                        debug!(%connection, "scheduling post-connect snapshot");
                        schedule(&mut pending, &last_sent, &config, config.connect_broadcast_delay);
                    }
                    // A dropped link invalidates whatever the peers last saw;
                    // clear them right away, skipping the debounce.
                    Ok(ConnEvent::Disconnected { connection }) => {
                        debug!(%connection, "link dropped, clearing peers");
                        if sink.has_connected().await {
                            let frame = Outbound::FocusedWorkersUpdate {
                                data: Vec::new(),
                                timestamp: Utc::now().timestamp_millis(),
                            };
                            if let Err(err) = sink.send(SendTarget::All, &frame).await {
                                warn!(error = %err, "disconnect snapshot failed");
                            }
                            last_sent = Some(Instant::now());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                pending = None;
                if !sink.has_connected().await {
                    debug!("no connected links, suppressing snapshot broadcast");
                    continue;
                }
                match registry.all_snapshots().await {
                    Ok(snapshots) => {
                        let frame = Outbound::FocusedWorkersUpdate {
                            data: snapshots,
                            timestamp: Utc::now().timestamp_millis(),
                        };
                        if let Err(err) = sink.send(SendTarget::All, &frame).await {
                            warn!(error = %err, "snapshot broadcast failed");
                        }
                        last_sent = Some(Instant::now());
                    }
                    Err(err) => warn!(error = %err, "failed to load snapshots for broadcast"),
                }
            }
        }
    }
}

/// Pushes the pending deadline out to `delay` from now (debounce), but never
/// inside the throttle window after the previous send.
fn schedule(
    pending: &mut Option<Instant>,
    last_sent: &Option<Instant>,
    config: &CoordinatorConfig,
    delay: std::time::Duration,
) {
    let mut deadline = Instant::now() + delay;
    if let Some(last) = last_sent {
        deadline = deadline.max(*last + config.broadcast_throttle);
    }
    *pending = Some(deadline);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::TestSink;
    use crate::protocol::{WorkerId, WorkerStatus};
    use crate::registry::WorkerObservation;
    use crate::store::{MemoryStore, SharedStore};
    use std::time::Duration;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            broadcast_debounce: Duration::from_millis(5),
            broadcast_throttle: Duration::from_millis(30),
            connect_broadcast_delay: Duration::from_millis(5),
            ..CoordinatorConfig::default()
        }
    }

    struct Fixture {
        broadcaster: Broadcaster,
        registry: Arc<WorkerRegistry>,
        sink: Arc<TestSink>,
        conn_events: broadcast::Sender<ConnEvent>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(WorkerRegistry::new(
            store.clone() as Arc<dyn SharedStore>,
            fast_config(),
        ));
        let sink = Arc::new(TestSink::new());
        let (conn_events, conn_rx) = broadcast::channel(8);
        let (broadcaster, _task) = Broadcaster::spawn(
            fast_config(),
            registry.clone(),
            sink.clone() as Arc<dyn FrameSink>,
            store.subscribe(),
            conn_rx,
        );
        Fixture {
            broadcaster,
            registry,
            sink,
            conn_events,
        }
    }

    async fn seed(registry: &WorkerRegistry, n: u64) {
        let observed = (1..=n)
            .map(|id| WorkerObservation {
                worker_id: WorkerId(id),
                label: format!("w{id}"),
                status: WorkerStatus::Free,
            })
            .collect();
        registry.sync_observations(observed).await.unwrap();
    }

    async fn wait_for_frames(sink: &TestSink, count: usize) -> Vec<serde_json::Value> {
        for _ in 0..100 {
            let sent = sink.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sink.sent()
    }

    #[tokio::test]
    async fn worker_change_triggers_snapshot_broadcast() {
        let fx = fixture();
        seed(&fx.registry, 2).await;

        let frames = wait_for_frames(&fx.sink, 1).await;
        assert!(!frames.is_empty());
        assert_eq!(frames[0]["type"], "focusedWorkersUpdate");
        assert_eq!(frames[0]["data"].as_array().unwrap().len(), 2);
        assert!(frames[0]["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn burst_of_changes_coalesces_into_one_frame() {
        let fx = fixture();
        for n in 1..=5 {
            seed(&fx.registry, n).await;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        let frames = fx.sink.sent();
        assert_eq!(frames.len(), 1, "rapid changes should debounce into one frame");
        assert!(!frames[0]["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn suppressed_while_nothing_is_connected() {
        let fx = fixture();
        fx.sink.set_connected(false);
        seed(&fx.registry, 1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(fx.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn manual_refresh_broadcasts() {
        let fx = fixture();
        fx.broadcaster.request_broadcast().await;
        let frames = wait_for_frames(&fx.sink, 1).await;
        assert_eq!(frames[0]["type"], "focusedWorkersUpdate");
        assert!(frames[0]["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_link_clears_remaining_peers_immediately() {
        let fx = fixture();
        seed(&fx.registry, 2).await;
        wait_for_frames(&fx.sink, 1).await;
        fx.sink.take();

        fx.conn_events
            .send(ConnEvent::Disconnected {
                connection: "c1".into(),
            })
            .unwrap();

        let frames = wait_for_frames(&fx.sink, 1).await;
        assert_eq!(frames[0]["type"], "focusedWorkersUpdate");
        assert!(frames[0]["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_connection_gets_snapshot_after_grace() {
        let fx = fixture();
        fx.conn_events
            .send(ConnEvent::Connected {
                connection: "c1".into(),
            })
            .unwrap();
        let frames = wait_for_frames(&fx.sink, 1).await;
        assert_eq!(frames[0]["type"], "focusedWorkersUpdate");
    }
}
