//! Per-endpoint link task: dial, serve, reconnect.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, EndpointConfig};
use crate::conn::{ConnEvent, InboundEnvelope, LinkStatus};
use crate::store::{SharedStore, keys};

const RECONNECT_JITTER_MS: u64 = 500;

pub(super) struct ConnectionParams {
    pub endpoint: EndpointConfig,
    pub config: CoordinatorConfig,
    pub store: Arc<dyn SharedStore>,
    pub events: broadcast::Sender<ConnEvent>,
    pub inbound: mpsc::Sender<InboundEnvelope>,
    pub status: Arc<std::sync::Mutex<LinkStatus>>,
    pub outbound: mpsc::Receiver<Message>,
}

enum ServeEnd {
    /// The link dropped or went silent; reconnect.
    LinkLost,
    /// The manager went away; stop for good.
    Shutdown,
}

/// Dial-and-serve loop for one endpoint. Runs until the reconnect budget is
/// exhausted or the manager shuts down.
pub(super) async fn run(mut params: ConnectionParams) {
    let key = params.endpoint.key.clone();
    let mut attempts = 0u32;
    loop {
        match connect_async(params.endpoint.url.as_str()).await {
            Ok((ws, _)) => {
                attempts = 0;
                set_status(&params, LinkStatus::Connected, attempts).await;
                info!(connection = %key, url = %params.endpoint.url, "link established");
                let _ = params.events.send(ConnEvent::Connected {
                    connection: key.clone(),
                });

                let end = serve(ws, &mut params).await;

                let _ = params.events.send(ConnEvent::Disconnected {
                    connection: key.clone(),
                });
                if matches!(end, ServeEnd::Shutdown) {
                    set_status(&params, LinkStatus::Closed, attempts).await;
                    return;
                }
                info!(connection = %key, "link lost");
            }
            Err(err) => {
                warn!(connection = %key, error = %err, "connect failed");
            }
        }

        attempts += 1;
        if attempts >= params.config.max_reconnect_attempts {
            warn!(connection = %key, attempts, "reconnect budget exhausted, giving up");
            set_status(&params, LinkStatus::Closed, attempts).await;
            return;
        }
        set_status(&params, LinkStatus::Reconnecting, attempts).await;
        let jitter = rand::thread_rng().gen_range(0..RECONNECT_JITTER_MS);
        let delay = params.config.reconnect_delay + std::time::Duration::from_millis(jitter);
        debug!(connection = %key, attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn serve(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    params: &mut ConnectionParams,
) -> ServeEnd {
    let key = params.endpoint.key.clone();
    let (mut sink, mut stream) = ws.split();
    let mut health = tokio::time::interval(params.config.health_check_interval);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    health.tick().await;
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        match serde_json::from_str::<serde_json::Value>(text.as_str()) {
                            Ok(frame) => {
                                let envelope = InboundEnvelope {
                                    connection: key.clone(),
                                    frame,
                                };
                                if params.inbound.send(envelope).await.is_err() {
                                    return ServeEnd::Shutdown;
                                }
                            }
                            Err(err) => {
                                warn!(connection = %key, error = %err, "dropping non-JSON frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_inbound = Instant::now();
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return ServeEnd::LinkLost;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_inbound = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return ServeEnd::LinkLost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(connection = %key, error = %err, "read error");
                        return ServeEnd::LinkLost;
                    }
                }
            }
            out = params.outbound.recv() => {
                match out {
                    Some(message) => {
                        if let Err(err) = sink.send(message).await {
                            warn!(connection = %key, error = %err, "write error");
                            return ServeEnd::LinkLost;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return ServeEnd::Shutdown;
                    }
                }
            }
            _ = health.tick() => {
                if last_inbound.elapsed() >= params.config.liveness_timeout {
                    warn!(
                        connection = %key,
                        silent_for_ms = last_inbound.elapsed().as_millis() as u64,
                        "liveness timeout, dropping link"
                    );
                    let _ = sink.send(Message::Close(None)).await;
                    return ServeEnd::LinkLost;
                }
            }
        }
    }
}

async fn set_status(params: &ConnectionParams, status: LinkStatus, attempts: u32) {
    {
        let mut current = params.status.lock().unwrap_or_else(|e| e.into_inner());
        *current = status;
    }
    let record = json!({
        "endpoint": params.endpoint.url,
        "status": status.as_str(),
        "reconnectAttempts": attempts,
        "updatedAt": Utc::now().timestamp_millis(),
    });
    if let Err(err) = params
        .store
        .set(&keys::connection(&params.endpoint.key), record)
        .await
    {
        debug!(connection = %params.endpoint.key, error = %err, "failed to record link status");
    }
}
