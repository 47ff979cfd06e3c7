//! Gallery: distributed 1:N biometric identification over an in-memory,
//! partitioned template store.

pub mod cluster;
pub mod config;
pub mod error;
pub mod feature;
pub mod index;
pub mod loader;
pub mod metrics;
pub mod search;
pub mod server;
pub mod startup;
pub mod storage;
pub mod types;
