//! Record conventions.
//!
//! Collections are schemaless JSON arrays, but every record carries, by
//! convention, an `id`, a creation timestamp and audit fields identifying the
//! author. This module owns those conventions: id generation, the read-only
//! identity contract supplied by the session layer, and the stamping helpers
//! that apply the convention to an arbitrary JSON object.

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Length of the random base-36 suffix appended to generated ids.
const ID_SUFFIX_LEN: usize = 9;

/// Generate a client-side record id.
///
/// Millisecond epoch timestamp followed by a random base-36 suffix. Globally
/// unique with overwhelming probability, but not guaranteed: uniqueness is a
/// convention, not an enforced invariant.
///
/// # Example
///
/// ```
/// let id = fieldsync::record::generate_id();
/// assert!(id.len() > 13);
/// assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
/// ```
#[must_use]
pub fn generate_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| {
            let digit = rng.random_range(0..36u32);
            char::from_digit(digit, 36).unwrap_or('0')
        })
        .collect();
    format!("{millis}{suffix}")
}

/// Current time as an RFC3339 string, the format records are stamped with.
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The current user as supplied by the external session/identity provider.
///
/// This is the whole contract: id, display name and role, read-only. Session
/// mechanics (login, tokens) live outside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    pub role: String,
}

impl UserIdentity {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
        }
    }
}

/// Stamp a JSON object with the record convention: a fresh `id`, a
/// `createdAt` timestamp, and the author's audit fields when an identity is
/// supplied.
///
/// Fields already present on the object are left untouched, so callers can
/// pre-assign ids when they need to reference the record before saving.
/// Non-object values are returned unchanged.
#[must_use]
pub fn stamp_new_record(mut record: Value, author: Option<&UserIdentity>) -> Value {
    let Some(map) = record.as_object_mut() else {
        return record;
    };
    map.entry("id".to_string())
        .or_insert_with(|| Value::String(generate_id()));
    map.entry("createdAt".to_string())
        .or_insert_with(|| Value::String(now_timestamp()));
    if let Some(user) = author {
        map.entry("createdBy".to_string())
            .or_insert_with(|| Value::String(user.id.clone()));
        map.entry("authorName".to_string())
            .or_insert_with(|| Value::String(user.name.clone()));
        map.entry("authorRole".to_string())
            .or_insert_with(|| Value::String(user.role.clone()));
    }
    record
}

/// Extract the conventional `id` field from a record.
#[must_use]
pub fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        // 13 timestamp digits (for dates past 2001) + 9 suffix chars
        assert_eq!(id.len(), 13 + ID_SUFFIX_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generate_id_distinct() {
        let ids: std::collections::HashSet<String> = (0..100).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_stamp_adds_id_and_timestamp() {
        let record = stamp_new_record(json!({"title": "Daily briefing"}), None);
        assert!(record_id(&record).is_some());
        assert!(record.get("createdAt").and_then(Value::as_str).is_some());
        assert_eq!(record["title"], "Daily briefing");
        assert!(record.get("createdBy").is_none());
    }

    #[test]
    fn test_stamp_adds_audit_fields() {
        let user = UserIdentity::new("u-1", "Luis", "Supervisor");
        let record = stamp_new_record(json!({}), Some(&user));
        assert_eq!(record["createdBy"], "u-1");
        assert_eq!(record["authorName"], "Luis");
        assert_eq!(record["authorRole"], "Supervisor");
    }

    #[test]
    fn test_stamp_preserves_existing_id() {
        let record = stamp_new_record(json!({"id": "fixed-id"}), None);
        assert_eq!(record_id(&record), Some("fixed-id"));
    }

    #[test]
    fn test_stamp_non_object_unchanged() {
        let value = stamp_new_record(json!("just a string"), None);
        assert_eq!(value, json!("just a string"));
    }

    #[test]
    fn test_record_id_missing() {
        assert_eq!(record_id(&json!({"name": "no id here"})), None);
        assert_eq!(record_id(&json!({"id": 42})), None);
    }

    #[test]
    fn test_identity_serializes_camel_case() {
        let user = UserIdentity::new("u-1", "Luis", "Supervisor");
        let s = serde_json::to_string(&user).unwrap();
        assert!(s.contains("\"id\""));
        assert!(s.contains("\"name\""));
        assert!(s.contains("\"role\""));
    }
}
