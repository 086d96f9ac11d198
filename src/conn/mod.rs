//! Outbound connections to remote coordination endpoints.
//!
//! The coordinator dials each configured endpoint over WebSocket and keeps
//! the link alive: liveness checks, reconnect with backoff, and per-link
//! bookkeeping in the shared store. Everything above this layer sends frames
//! through [`FrameSink`], so the router and monitor never see a socket.

mod connection;
mod manager;

pub use manager::ConnectionManager;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::protocol::Outbound;

/// Stable connection identity (the endpoint key, `host:port`).
pub type ConnectionId = String;

/// Where an outbound frame goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    Connection(ConnectionId),
    All,
}

/// Lifecycle of one endpoint link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

/// Link lifecycle notifications, consumed by the broadcaster.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    Connected { connection: ConnectionId },
    Disconnected { connection: ConnectionId },
}

/// An inbound frame together with the link it arrived on.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    pub connection: ConnectionId,
    pub frame: Value,
}

/// Frame egress abstraction implemented by [`ConnectionManager`].
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, target: SendTarget, frame: &Outbound) -> Result<(), TransportError>;

    /// Whether at least one link is currently connected.
    async fn has_connected(&self) -> bool;
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Records outbound frames instead of writing to a socket.
    pub struct TestSink {
        connected: AtomicBool,
        frames: Mutex<Vec<(SendTarget, Value)>>,
    }

    impl TestSink {
        pub fn new() -> Self {
            Self {
                connected: AtomicBool::new(true),
                frames: Mutex::new(Vec::new()),
            }
        }

        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        pub fn take(&self) -> Vec<(SendTarget, Value)> {
            std::mem::take(&mut *self.frames.lock().unwrap())
        }

        pub fn sent(&self) -> Vec<Value> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|(_, frame)| frame.clone())
                .collect()
        }
    }

    #[async_trait]
    impl FrameSink for TestSink {
        async fn send(&self, target: SendTarget, frame: &Outbound) -> Result<(), TransportError> {
            let value = serde_json::to_value(frame).map_err(|e| TransportError::SendFailed {
                connection: "test".to_string(),
                reason: e.to_string(),
            })?;
            self.frames.lock().unwrap().push((target, value));
            Ok(())
        }

        async fn has_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}
