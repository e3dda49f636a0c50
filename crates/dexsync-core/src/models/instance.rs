//! Ownership record model

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Identifier of one concrete collectible instance.
///
/// Keys are `<variant prefix>_<unique suffix>`; every instance of the same
/// variant shares the prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceKey(String);

impl InstanceKey {
    /// Wrap a raw key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the string representation of this key
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The variant portion of the key: everything before the last `_`.
    ///
    /// A key without `_` is its own variant.
    pub fn variant_prefix(&self) -> &str {
        self.0
            .rsplit_once('_')
            .map_or(self.0.as_str(), |(prefix, _)| prefix)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for InstanceKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for InstanceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Ownership flags of a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnershipFlags {
    pub is_owned: bool,
    pub is_for_trade: bool,
    pub is_wanted: bool,
    /// Placeholder meaning "the user has none of this variant"
    pub is_unowned: bool,
}

impl OwnershipFlags {
    /// A record is significant when it is owned, offered or wanted.
    pub const fn is_significant(&self) -> bool {
        self.is_owned || self.is_for_trade || self.is_wanted
    }
}

/// Ownership state of one instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    #[serde(flatten)]
    pub flags: OwnershipFlags,
    /// Last mutation timestamp (Unix ms), the only merge tie-breaker
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub last_update: i64,
    /// Owning account, when the server tagged the record with one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Game-specific attributes, carried through untouched
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl InstanceRecord {
    /// Create an empty record stamped at `last_update`
    #[must_use]
    pub fn new(last_update: i64) -> Self {
        Self {
            last_update,
            ..Self::default()
        }
    }

    pub const fn is_significant(&self) -> bool {
        self.flags.is_significant()
    }

    /// Whether the record belongs to someone other than `owner`.
    pub fn is_foreign_to(&self, owner: &str) -> bool {
        self.username.as_deref().is_some_and(|name| name != owner)
    }

    /// Overlay `patch` onto this record and stamp it with `timestamp`.
    ///
    /// Patch keys use the wire names (`is_owned`, `nickname`, ...), so flags
    /// and details are patched the same way.
    pub fn patched(&self, patch: &Map<String, Value>, timestamp: i64) -> Result<Self> {
        let mut fields = match serde_json::to_value(self)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        for (field, value) in patch {
            fields.insert(field.clone(), value.clone());
        }
        fields.insert("last_update".to_string(), Value::from(timestamp));

        let mut record: Self = serde_json::from_value(Value::Object(fields))?;
        record.last_update = timestamp;
        Ok(record)
    }
}

/// All ownership records of one user, keyed by instance.
///
/// Ordered so that "first record of a variant" is well defined.
pub type OwnershipMap = BTreeMap<InstanceKey, InstanceRecord>;

/// Accept Unix milliseconds as a number, a numeric string or an RFC 3339 date.
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().map_or(0, timestamp_from_value))
}

#[allow(clippy::cast_possible_truncation)]
fn timestamp_from_value(value: &Value) -> i64 {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|millis| millis as i64))
            .unwrap_or_default(),
        Value::String(raw) => {
            let raw = raw.trim();
            raw.parse::<i64>().unwrap_or_else(|_| {
                chrono::DateTime::parse_from_rfc3339(raw)
                    .map(|date| date.timestamp_millis())
                    .unwrap_or_default()
            })
        }
        _ => 0,
    }
}
