//! Durable local store for dexsync

mod connection;
mod migrations;
mod ownership_repository;

pub use connection::Database;
pub use ownership_repository::{LibSqlOwnershipRepository, OwnershipRepository, StoredOwnership};
