//! Store key layout.

use crate::protocol::WorkerId;

/// Single map of all worker records, keyed by stringified worker id.
pub const WORKERS: &str = "workerStates";

/// Recently received inbound messages, one capped buffer per connection.
pub const INBOUND_MESSAGES: &str = "inboundMessages";

/// Per-connection bookkeeping record.
pub fn connection(id: &str) -> String {
    format!("conn:{id}")
}

/// Request binding: which connection/worker a request id belongs to.
pub fn request(id: &str) -> String {
    format!("request:{id}")
}

/// Dedup marker for an inbound frame. `kind` is the frame type tag.
pub fn dedup(kind: &str, id: &str) -> String {
    format!("dedup:{kind}:{id}")
}

/// Stringified worker id used inside the [`WORKERS`] map.
pub fn worker_field(id: WorkerId) -> String {
    id.to_string()
}
