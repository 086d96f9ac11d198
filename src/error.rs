//! Error types for promptpool.

use crate::protocol::WorkerId;

/// Top-level error type for the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid endpoint descriptor {value:?}: {reason}")]
    InvalidEndpoint { value: String, reason: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },
}

/// Shared-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Worker-registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Worker {worker} not found")]
    NotFound { worker: WorkerId },

    #[error("Worker {worker} is not free (active request: {active_request:?})")]
    Conflict {
        worker: WorkerId,
        active_request: Option<String>,
    },

    #[error("Worker {worker} cannot transition from {from} to {to}")]
    InvalidTransition {
        worker: WorkerId,
        from: String,
        to: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Connection/transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Connection {connection} is not connected")]
    NotConnected { connection: String },

    #[error("Send failed on connection {connection}: {reason}")]
    SendFailed { connection: String, reason: String },

    #[error("Unknown connection: {connection}")]
    UnknownConnection { connection: String },
}

/// Inbound-frame routing errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Invalid frame: {0}")]
    Validation(String),

    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Automation-driver errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Driver unavailable for worker {worker}: {reason}")]
    Unavailable { worker: WorkerId, reason: String },

    #[error("Driver call failed: {0}")]
    Failed(String),
}

/// Result type alias for the coordinator.
pub type Result<T> = std::result::Result<T, Error>;
