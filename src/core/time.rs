//! Timestamp and event-id helpers shared by records, audit logs and CLI envelopes.

use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", epoch_secs())
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Response envelope printed by every CLI command in JSON mode.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}
