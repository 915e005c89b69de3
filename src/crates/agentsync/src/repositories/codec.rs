//! Column encoding
//!
//! Lists, maps and nested values are stored as JSON text and timestamps as
//! RFC 3339 strings. Decoding failures surface as typed
//! [`AgentSyncError::Decode`] errors naming the entity and column.

use crate::error::{AgentSyncError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;

pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn encode_json_opt<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(encode_json).transpose()
}

pub(crate) fn decode_json<T: DeserializeOwned>(
    entity: &'static str,
    field: &'static str,
    raw: &str,
) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| AgentSyncError::Decode {
        entity,
        field,
        message: e.to_string(),
    })
}

pub(crate) fn decode_json_opt<T: DeserializeOwned>(
    entity: &'static str,
    field: &'static str,
    raw: Option<String>,
) -> Result<Option<T>> {
    raw.map(|text| decode_json(entity, field, &text)).transpose()
}

/// Millisecond precision, `Z` suffix; sorts lexicographically
pub(crate) fn encode_time(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn encode_time_opt(value: Option<&DateTime<Utc>>) -> Option<String> {
    value.map(encode_time)
}

pub(crate) fn decode_time(
    entity: &'static str,
    field: &'static str,
    raw: &str,
) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AgentSyncError::Decode {
            entity,
            field,
            message: format!("invalid timestamp {:?}: {}", raw, e),
        })
}

pub(crate) fn decode_time_opt(
    entity: &'static str,
    field: &'static str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    raw.map(|text| decode_time(entity, field, &text)).transpose()
}

pub(crate) fn decode_enum<T>(entity: &'static str, field: &'static str, raw: &str) -> Result<T>
where
    T: FromStr<Err = AgentSyncError>,
{
    raw.parse().map_err(|e: AgentSyncError| AgentSyncError::Decode {
        entity,
        field,
        message: e.to_string(),
    })
}

/// Shallow merge of `changes` over `base`; both must be JSON objects
pub(crate) fn merge_object(base: &mut Value, changes: &Value) -> Result<()> {
    match (base.as_object_mut(), changes.as_object()) {
        (Some(target), Some(patch)) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
            Ok(())
        }
        _ => Err(AgentSyncError::validation("Changes must be a JSON object")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentStatus;

    #[test]
    fn test_malformed_json_is_decode_error() {
        let err = decode_json::<Vec<String>>("agent", "tags", "[\"a\",").unwrap_err();
        match err {
            AgentSyncError::Decode { entity, field, .. } => {
                assert_eq!(entity, "agent");
                assert_eq!(field, "tags");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_time_encoding_sorts() {
        let early = decode_time("event", "timestamp", "2025-01-01T00:00:00.000Z").unwrap();
        let late = decode_time("event", "timestamp", "2025-01-01T00:00:01.500Z").unwrap();
        assert!(encode_time(&early) < encode_time(&late));
        assert_eq!(encode_time(&late), "2025-01-01T00:00:01.500Z");
    }

    #[test]
    fn test_merge_object_overrides_top_level_keys() {
        let mut base = serde_json::json!({"name": "a", "tags": ["x"], "port": 1});
        merge_object(&mut base, &serde_json::json!({"name": "b", "tags": []})).unwrap();
        assert_eq!(base, serde_json::json!({"name": "b", "tags": [], "port": 1}));

        assert!(merge_object(&mut base, &serde_json::json!(5)).is_err());
    }

    #[test]
    fn test_unknown_enum_is_decode_error() {
        let err = decode_enum::<AgentStatus>("agent", "status", "exploded").unwrap_err();
        assert!(matches!(err, AgentSyncError::Decode { field: "status", .. }));
    }
}
