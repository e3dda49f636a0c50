//! Stateful services built on the database layer

mod durable_store;
mod ownership_store;

pub use durable_store::DurableStore;
pub use ownership_store::{OwnershipStore, Readiness, RecordPatch};
