//! dexsync-core - Core library for dexsync
//!
//! This crate keeps a durable local copy of a user's ownership records
//! consistent with the server under local edits, a live push channel and
//! catch-up fetches. Every path funnels through one deterministic merge.

pub mod bridge;
pub mod config;
pub mod db;
pub mod error;
mod http_error;
pub mod merge;
pub mod models;
pub mod services;
pub mod session;
pub mod sync;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{BaseData, DeviceId, Identity, InstanceKey, InstanceRecord, OwnershipMap, UpdateEnvelope};
pub use services::{DurableStore, OwnershipStore};
pub use sync::SyncEngine;
