//! Inputs supplied by the identity provider and the base data loader

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OwnershipMap;

/// Stable per-install identifier, using UUID v7 (time-sortable)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh device id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wrap a stored device id
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The signed-in user as resolved by the identity provider
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub device_id: DeviceId,
    /// Bearer token for the catch-up and live endpoints
    pub access_token: Option<String>,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        device_id: DeviceId,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            device_id,
            access_token: None,
        }
    }

    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("device_id", &self.device_id)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Full ownership map delivered by the base data loader
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaseData {
    pub instances: OwnershipMap,
    /// When the server produced this map (Unix ms)
    pub fetched_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_device_ids_are_unique() {
        assert_ne!(DeviceId::generate(), DeviceId::generate());
    }

    #[test]
    fn identity_debug_redacts_token() {
        let identity =
            Identity::new("u1", "ash", DeviceId::new("dev-1")).with_access_token("secret");
        let debug = format!("{identity:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
