//! Worker registry.
//!
//! Owns the worker map in the shared store and serializes every mutation
//! through a software mutex so acquire/release sequences never interleave.

mod cache;
pub mod recovery;
mod registry;
mod worker;

pub use cache::WorkerCache;
pub use registry::WorkerRegistry;
pub use worker::{Worker, WorkerObservation};
