//! Inbound update envelope and auxiliary trade records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::OwnershipMap;
use crate::error::{Error, Result};

/// Auxiliary records keyed by their server id (trades, related instances)
pub type AuxiliaryRecords = BTreeMap<String, Value>;

/// A batch of updates delivered by the catch-up endpoint or the live channel.
///
/// Envelopes are transient: they are merged and dropped, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    /// Ownership fragments
    #[serde(rename = "pokemon", default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<OwnershipMap>,
    /// Trades touched since the last update
    #[serde(rename = "trade", default, skip_serializing_if = "Option::is_none")]
    pub trades: Option<AuxiliaryRecords>,
    /// Instances of other users referenced by those trades
    #[serde(
        rename = "relatedInstance",
        alias = "relatedInstances",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub related_instances: Option<AuxiliaryRecords>,
}

impl UpdateEnvelope {
    /// Decode a text payload as sent by the server.
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|error| Error::MalformedPayload(error.to_string()))
    }

    /// Envelope carrying only ownership records
    pub const fn with_instances(instances: OwnershipMap) -> Self {
        Self {
            instances: Some(instances),
            trades: None,
            related_instances: None,
        }
    }

    /// Whether there are ownership records to merge
    pub fn has_instances(&self) -> bool {
        self.instances.as_ref().is_some_and(|map| !map.is_empty())
    }

    /// Whether there are auxiliary records to apply
    pub fn has_auxiliary(&self) -> bool {
        self.trades.as_ref().is_some_and(|map| !map.is_empty())
            || self
                .related_instances
                .as_ref()
                .is_some_and(|map| !map.is_empty())
    }

    /// An envelope with nothing to reconcile
    pub fn is_empty(&self) -> bool {
        !self.has_instances() && !self.has_auxiliary()
    }
}

/// Trade-related records kept alongside the ownership map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeBook {
    pub trades: AuxiliaryRecords,
    pub related_instances: AuxiliaryRecords,
}

impl TradeBook {
    /// Upsert every trade and related instance carried by `envelope`.
    pub fn apply(&mut self, envelope: &UpdateEnvelope) {
        if let Some(trades) = &envelope.trades {
            self.trades
                .extend(trades.iter().map(|(id, trade)| (id.clone(), trade.clone())));
        }
        if let Some(related) = &envelope.related_instances {
            self.related_instances
                .extend(related.iter().map(|(id, record)| (id.clone(), record.clone())));
        }
    }

    pub fn clear(&mut self) {
        self.trades.clear();
        self.related_instances.clear();
    }
}
