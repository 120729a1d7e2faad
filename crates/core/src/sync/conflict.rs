//! Automatic conflict strategies

use chrono::DateTime;
use serde_json::{Map, Value};
use tidemark_domain::{Conflict, ResolutionStrategy};

/// Resolved data for `strategy`, or `None` when the strategy does not apply
/// to this conflict and a resolver has to decide
pub(crate) fn apply(
    strategy: ResolutionStrategy,
    conflict: &Conflict,
    timestamp_field: &str,
) -> Option<Value> {
    match strategy {
        ResolutionStrategy::ClientWins => Some(conflict.local_data.clone()),
        ResolutionStrategy::ServerWins => Some(conflict.remote_data.clone()),
        ResolutionStrategy::TimestampWins => {
            timestamp_wins(&conflict.local_data, &conflict.remote_data, timestamp_field)
        }
        ResolutionStrategy::Merge => Some(
            merge(&conflict.local_data, &conflict.remote_data)
                .unwrap_or_else(|| conflict.local_data.clone()),
        ),
        ResolutionStrategy::Manual | ResolutionStrategy::Custom => None,
    }
}

/// The side with the later embedded timestamp; local wins ties
pub(crate) fn timestamp_wins(local: &Value, remote: &Value, field: &str) -> Option<Value> {
    let local_ts = timestamp_of(local, field)?;
    let remote_ts = timestamp_of(remote, field)?;
    if remote_ts > local_ts {
        Some(remote.clone())
    } else {
        Some(local.clone())
    }
}

/// A numeric field as-is, or an RFC 3339 field as epoch milliseconds
fn timestamp_of(value: &Value, field: &str) -> Option<f64> {
    match value.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_micros() as f64 / 1000.0),
        _ => None,
    }
}

/// Recursive merge of two objects where local values win on collision.
/// `None` unless both sides are objects.
pub(crate) fn merge(local: &Value, remote: &Value) -> Option<Value> {
    let (Value::Object(local), Value::Object(remote)) = (local, remote) else {
        return None;
    };
    Some(Value::Object(merge_objects(local, remote)))
}

fn merge_objects(local: &Map<String, Value>, remote: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = remote.clone();
    for (key, local_value) in local {
        let value = match (local_value, remote.get(key)) {
            (Value::Object(l), Some(Value::Object(r))) => Value::Object(merge_objects(l, r)),
            _ => local_value.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn conflict(local: Value, remote: Value) -> Conflict {
        Conflict {
            id: "c-1".into(),
            operation_id: "op-1".into(),
            op_type: "note.update".into(),
            local_data: local,
            remote_data: remote,
            timestamp: 0,
            resolution: None,
        }
    }

    #[test]
    fn client_and_server_wins_pick_a_side() {
        let c = conflict(json!({"v": "local"}), json!({"v": "remote"}));
        assert_eq!(apply(ResolutionStrategy::ClientWins, &c, "updatedAt"), Some(json!({"v": "local"})));
        assert_eq!(apply(ResolutionStrategy::ServerWins, &c, "updatedAt"), Some(json!({"v": "remote"})));
        assert_eq!(apply(ResolutionStrategy::Manual, &c, "updatedAt"), None);
    }

    #[test]
    fn timestamp_wins_compares_numbers_and_rfc3339() {
        let numeric = conflict(json!({"updatedAt": 10, "v": 1}), json!({"updatedAt": 20, "v": 2}));
        assert_eq!(
            apply(ResolutionStrategy::TimestampWins, &numeric, "updatedAt"),
            Some(json!({"updatedAt": 20, "v": 2}))
        );

        let dated = conflict(
            json!({"updatedAt": "2024-05-01T12:00:00+02:00"}),
            json!({"updatedAt": "2024-05-01T10:30:00Z"}),
        );
        assert_eq!(
            apply(ResolutionStrategy::TimestampWins, &dated, "updatedAt"),
            Some(dated.remote_data.clone())
        );
    }

    #[test]
    fn timestamp_wins_needs_both_fields() {
        let c = conflict(json!({"updatedAt": 10}), json!({"v": 2}));
        assert_eq!(apply(ResolutionStrategy::TimestampWins, &c, "updatedAt"), None);
        let c = conflict(json!({"updatedAt": "yesterday"}), json!({"updatedAt": 3}));
        assert_eq!(apply(ResolutionStrategy::TimestampWins, &c, "updatedAt"), None);
    }

    #[test]
    fn fractional_timestamps_keep_their_precision() {
        let c = conflict(json!({"t": 1.2, "side": "l"}), json!({"t": 1.9, "side": "r"}));
        assert_eq!(timestamp_wins(&c.local_data, &c.remote_data, "t"), Some(c.remote_data.clone()));

        let dated = conflict(
            json!({"t": "2024-05-01T10:00:00.0004Z"}),
            json!({"t": "2024-05-01T10:00:00.0002Z"}),
        );
        assert_eq!(
            timestamp_wins(&dated.local_data, &dated.remote_data, "t"),
            Some(dated.local_data.clone())
        );
    }

    #[test]
    fn timestamp_tie_keeps_local() {
        let c = conflict(json!({"t": 5, "side": "l"}), json!({"t": 5, "side": "r"}));
        assert_eq!(timestamp_wins(&c.local_data, &c.remote_data, "t"), Some(c.local_data.clone()));
    }

    #[test]
    fn merge_keeps_remote_only_fields_and_local_scalars() {
        let merged = merge(
            &json!({"title": "mine", "meta": {"color": "red"}}),
            &json!({"title": "theirs", "done": true, "meta": {"color": "blue", "pinned": true}}),
        );
        assert_eq!(
            merged,
            Some(json!({"title": "mine", "done": true, "meta": {"color": "red", "pinned": true}}))
        );
    }

    #[test]
    fn merge_of_non_objects_falls_back_to_local() {
        let c = conflict(json!([1, 2]), json!({"a": 1}));
        assert_eq!(merge(&c.local_data, &c.remote_data), None);
        assert_eq!(apply(ResolutionStrategy::Merge, &c, "updatedAt"), Some(json!([1, 2])));
    }
}
