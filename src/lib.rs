//! promptpool — coordination core for a pool of single-task automation workers.

pub mod broadcast;
pub mod config;
pub mod conn;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod store;
