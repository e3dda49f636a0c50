//! Data models for dexsync

mod envelope;
mod identity;
mod instance;

pub use envelope::{AuxiliaryRecords, TradeBook, UpdateEnvelope};
pub use identity::{BaseData, DeviceId, Identity};
pub use instance::{InstanceKey, InstanceRecord, OwnershipFlags, OwnershipMap};
