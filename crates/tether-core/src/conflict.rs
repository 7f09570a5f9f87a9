//! Conflict resolution and server-delta merging.
//!
//! The merge walks a server delta batch against the cached local collection:
//! tombstoned records are removed by id, records with a matching local id
//! are resolved by the type's conflict resolver, and unknown ids are
//! appended. The default resolver is last-writer-wins with server bias:
//! the remote value wins unless both sides carry a timestamp and the local
//! one is strictly newer.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Decides the winning value when local and remote versions of a record
/// diverge. Pluggable per data type to allow field-level merges.
pub type ConflictResolver = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// The default resolver as a [`ConflictResolver`].
pub fn lww_resolver() -> ConflictResolver {
    Arc::new(|local, remote| last_writer_wins(local, remote))
}

/// Last-writer-wins with server bias on ties or missing data.
pub fn last_writer_wins(local: &Value, remote: &Value) -> Value {
    match (record_timestamp(local), record_timestamp(remote)) {
        (Some(local_at), Some(remote_at)) if local_at > remote_at => local.clone(),
        _ => remote.clone(),
    }
}

/// Extract a record's `id` field as a string (strings and integers accepted).
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract a record's modification timestamp from `updated_at` or
/// `timestamp`, accepting RFC3339 strings or unix milliseconds.
pub fn record_timestamp(record: &Value) -> Option<DateTime<Utc>> {
    let raw = record.get("updated_at").or_else(|| record.get("timestamp"))?;
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Returns true when a delta record is a tombstone.
fn is_tombstone(record: &Value) -> bool {
    record
        .get("_deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Merge a server delta batch into the local collection.
///
/// Deletes are idempotent (removing an absent id is a no-op), so applying
/// the same batch twice yields the same collection as applying it once.
pub fn apply_server_changes(
    mut local: Vec<Value>,
    deltas: &[Value],
    resolver: &ConflictResolver,
) -> Vec<Value> {
    for delta in deltas {
        let Some(id) = record_id(delta) else {
            warn!("skipping server delta without an id: {delta}");
            continue;
        };

        if is_tombstone(delta) {
            local.retain(|record| record_id(record).as_deref() != Some(id.as_str()));
            continue;
        }

        if let Some(existing) = local
            .iter_mut()
            .find(|record| record_id(record).as_deref() == Some(id.as_str()))
        {
            let resolved = resolver(existing, delta);
            *existing = resolved;
        } else {
            local.push(delta.clone());
        }
    }
    local
}
