//! Conflict resolution between local entities and incoming changes.

use crate::outbox::types::base64_bytes;
use crate::outbox::{EntityType, OperationType};
use crate::sync::clock::ClockStamp;
use crate::sync::local_store::EntityKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A change made elsewhere, either pulled from the backend or received from the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
    /// Clock counter of the writing device.
    pub version: u64,
    pub device_id: String,
    pub updated_at: DateTime<Utc>,
}

impl RemoteChange {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    pub fn stamp(&self) -> ClockStamp {
        ClockStamp::new(self.version, self.device_id.clone())
    }

    pub fn is_delete(&self) -> bool {
        self.operation_type == OperationType::Delete
    }

    /// Parse a raw backend item. `None` for records that cannot be applied.
    pub fn parse(value: serde_json::Value) -> Option<Self> {
        let change: RemoteChange = serde_json::from_value(value).ok()?;
        if change.entity_id.is_empty() || change.device_id.is_empty() {
            return None;
        }
        Some(change)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    AcceptIncoming,
    KeepLocal,
}

/// Last-writer-wins on `(counter, device_id)`.
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn resolve(local: Option<&ClockStamp>, incoming: &ClockStamp) -> Resolution {
        match local {
            None => Resolution::AcceptIncoming,
            Some(local) if incoming.wins_over(local) => Resolution::AcceptIncoming,
            Some(_) => Resolution::KeepLocal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_change(version: u64, device_id: &str) -> serde_json::Value {
        json!({
            "id": Uuid::new_v4(),
            "entity_type": "species",
            "entity_id": "sp-42",
            "type": "update",
            "data": "eyJuYW1lIjoib3dsIn0=",
            "version": version,
            "device_id": device_id,
            "updated_at": "2024-05-01T10:00:00Z"
        })
    }

    #[test]
    fn test_resolve_higher_counter_wins() {
        let local = ClockStamp::new(5, "device-a");
        let incoming = ClockStamp::new(7, "device-b");
        assert_eq!(
            ConflictResolver::resolve(Some(&local), &incoming),
            Resolution::AcceptIncoming
        );
        assert_eq!(
            ConflictResolver::resolve(Some(&incoming), &local),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn test_resolve_tie_goes_to_smaller_device() {
        let local = ClockStamp::new(3, "device-b");
        let incoming = ClockStamp::new(3, "device-a");
        assert_eq!(
            ConflictResolver::resolve(Some(&local), &incoming),
            Resolution::AcceptIncoming
        );
        assert_eq!(
            ConflictResolver::resolve(Some(&incoming), &local),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn test_resolve_same_version_is_kept() {
        let stamp = ClockStamp::new(3, "device-a");
        assert_eq!(
            ConflictResolver::resolve(Some(&stamp), &stamp.clone()),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn test_resolve_unknown_entity_accepts() {
        let incoming = ClockStamp::new(0, "device-a");
        assert_eq!(
            ConflictResolver::resolve(None, &incoming),
            Resolution::AcceptIncoming
        );
    }

    #[test]
    fn test_parse_remote_change() {
        let change = RemoteChange::parse(make_change(7, "device-b")).unwrap();
        assert_eq!(change.data, b"{\"name\":\"owl\"}".to_vec());
        assert_eq!(change.stamp(), ClockStamp::new(7, "device-b"));
        assert_eq!(change.key(), EntityKey::new(EntityType::Species, "sp-42"));
    }

    #[test]
    fn test_parse_rejects_malformed_records() {
        let mut bad_type = make_change(1, "device-b");
        bad_type["entity_type"] = json!("mineral");
        assert!(RemoteChange::parse(bad_type).is_none());

        let mut bad_data = make_change(1, "device-b");
        bad_data["data"] = json!("***");
        assert!(RemoteChange::parse(bad_data).is_none());

        assert!(RemoteChange::parse(make_change(1, "")).is_none());
        assert!(RemoteChange::parse(json!({"id": "nope"})).is_none());
    }
}
