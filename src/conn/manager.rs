//! Connection manager: owns every endpoint link.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, EndpointConfig};
use crate::conn::connection::{self, ConnectionParams};
use crate::conn::{ConnEvent, ConnectionId, FrameSink, InboundEnvelope, LinkStatus, SendTarget};
use crate::error::TransportError;
use crate::protocol::Outbound;
use crate::store::SharedStore;

const OUTBOUND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 32;

struct Link {
    outbound: mpsc::Sender<Message>,
    status: Arc<std::sync::Mutex<LinkStatus>>,
    send_failures: AtomicU32,
    task: JoinHandle<()>,
}

impl Link {
    fn status(&self) -> LinkStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Maintains one link per configured endpoint, each served by its own task.
///
/// Inbound frames from every link funnel into a single channel handed out by
/// [`ConnectionManager::new`]; the router drains it.
pub struct ConnectionManager {
    config: CoordinatorConfig,
    store: Arc<dyn SharedStore>,
    events: broadcast::Sender<ConnEvent>,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    links: Mutex<HashMap<ConnectionId, Link>>,
}

impl ConnectionManager {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn SharedStore>,
    ) -> (Self, mpsc::Receiver<InboundEnvelope>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Self {
            config,
            store,
            events,
            inbound_tx,
            links: Mutex::new(HashMap::new()),
        };
        (manager, inbound_rx)
    }

    /// Opens a link to `endpoint`. Connecting to an endpoint that already has
    /// a live link is a no-op.
    pub async fn connect(&self, endpoint: EndpointConfig) -> crate::error::Result<()> {
        let mut links = self.links.lock().await;
        if let Some(link) = links.get(&endpoint.key) {
            if !link.task.is_finished() {
                debug!(connection = %endpoint.key, "already linked, ignoring connect");
                return Ok(());
            }
            links.remove(&endpoint.key);
        }

        let key = endpoint.key.clone();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let status = Arc::new(std::sync::Mutex::new(LinkStatus::Connecting));
        let params = ConnectionParams {
            endpoint,
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            inbound: self.inbound_tx.clone(),
            status: Arc::clone(&status),
            outbound: outbound_rx,
        };
        let task = tokio::spawn(connection::run(params));
        info!(connection = %key, "link task started");
        links.insert(
            key,
            Link {
                outbound: outbound_tx,
                status,
                send_failures: AtomicU32::new(0),
                task,
            },
        );
        Ok(())
    }

    /// Closes the link to one endpoint. Unknown connections are an error.
    pub async fn disconnect(&self, connection: &str) -> Result<(), TransportError> {
        let mut links = self.links.lock().await;
        let link = links
            .remove(connection)
            .ok_or_else(|| TransportError::UnknownConnection {
                connection: connection.to_string(),
            })?;
        info!(%connection, "link closed by request");
        link.task.abort();
        Ok(())
    }

    /// Connects every endpoint in the list.
    pub async fn connect_all(&self, endpoints: Vec<EndpointConfig>) -> crate::error::Result<()> {
        for endpoint in endpoints {
            self.connect(endpoint).await?;
        }
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnEvent> {
        self.events.subscribe()
    }

    pub async fn link_status(&self, connection: &str) -> Option<LinkStatus> {
        self.links.lock().await.get(connection).map(Link::status)
    }

    /// Announces an empty worker snapshot on every live link, then closes
    /// them. Remote peers treat the empty snapshot as a disconnect signal.
    pub async fn shutdown(&self) {
        let farewell = Outbound::FocusedWorkersUpdate {
            data: Vec::new(),
            timestamp: Utc::now().timestamp_millis(),
        };
        if let Err(err) = self.send(SendTarget::All, &farewell).await {
            debug!(error = %err, "farewell broadcast failed");
        }
        let mut links = self.links.lock().await;
        for (key, link) in links.drain() {
            debug!(connection = %key, "closing link");
            link.task.abort();
        }
    }
}

#[async_trait]
impl FrameSink for ConnectionManager {
    async fn send(&self, target: SendTarget, frame: &Outbound) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame).map_err(|e| TransportError::SendFailed {
            connection: "serialize".to_string(),
            reason: e.to_string(),
        })?;

        let links = self.links.lock().await;
        match target {
            SendTarget::Connection(ref id) => {
                let link = links.get(id).ok_or_else(|| TransportError::UnknownConnection {
                    connection: id.clone(),
                })?;
                if link.status() != LinkStatus::Connected {
                    return Err(TransportError::NotConnected {
                        connection: id.clone(),
                    });
                }
                link.outbound
                    .send(Message::text(text))
                    .await
                    .map_err(|e| {
                        link.send_failures.fetch_add(1, Ordering::Relaxed);
                        TransportError::SendFailed {
                            connection: id.clone(),
                            reason: e.to_string(),
                        }
                    })
            }
            SendTarget::All => {
                for (key, link) in links.iter() {
                    if link.status() != LinkStatus::Connected {
                        continue;
                    }
                    if let Err(err) = link.outbound.send(Message::text(text.clone())).await {
                        let failures = link.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(connection = %key, error = %err, failures, "broadcast send failed");
                    }
                }
                Ok(())
            }
        }
    }

    async fn has_connected(&self) -> bool {
        let links = self.links.lock().await;
        links.values().any(|l| l.status() == LinkStatus::Connected)
    }
}
