use serde_json::Value;

use super::{VersionedRecord, CRITICAL_FIELDS};
use crate::types::Resolution;

fn payload_of(side: &VersionedRecord) -> Value {
    match &side.data {
        Some(data) => data.clone(),
        None => serde_json::json!({"_deleted": true}),
    }
}

/// A pluggable conflict policy (spec §9, "Polymorphism"): new policies plug
/// in by implementing `resolve`.
pub trait ResolverPolicy {
    /// Returns the resolved payload, the resolution tag, and the version the
    /// resolved row should carry.
    fn resolve(&self, local: &VersionedRecord, remote: &VersionedRecord) -> (Value, Resolution, u64);
}

/// Whichever side has the greater modification instant prevails; ties break
/// to the remote (spec §4.C).
pub struct LastWriteWins;

impl ResolverPolicy for LastWriteWins {
    fn resolve(&self, local: &VersionedRecord, remote: &VersionedRecord) -> (Value, Resolution, u64) {
        let version = local.version.max(remote.version);
        if local.modified_at > remote.modified_at {
            (payload_of(local), Resolution::LocalWins, version)
        } else {
            (payload_of(remote), Resolution::RemoteWins, version)
        }
    }
}

pub struct RemoteWins;

impl ResolverPolicy for RemoteWins {
    fn resolve(&self, local: &VersionedRecord, remote: &VersionedRecord) -> (Value, Resolution, u64) {
        (payload_of(remote), Resolution::RemoteWins, local.version.max(remote.version))
    }
}

pub struct LocalWins;

impl ResolverPolicy for LocalWins {
    fn resolve(&self, local: &VersionedRecord, remote: &VersionedRecord) -> (Value, Resolution, u64) {
        (payload_of(local), Resolution::LocalWins, local.version.max(remote.version))
    }
}

/// Field-wise union (spec §4.C): fields set on only one side are kept;
/// metadata-style fields take the max; critical fields prefer local unless
/// both sides set conflicting non-null values, in which case the pair
/// escalates to `USER_DECISION` rather than silently picking a side (spec
/// §4.C, "Escalation").
pub struct Merge;

impl ResolverPolicy for Merge {
    fn resolve(&self, local: &VersionedRecord, remote: &VersionedRecord) -> (Value, Resolution, u64) {
        let version = local.version.max(remote.version) + 1;

        let local_obj = local.data.as_ref().and_then(Value::as_object);
        let remote_obj = remote.data.as_ref().and_then(Value::as_object);

        let mut merged = serde_json::Map::new();
        let mut escalate = false;

        let mut keys: std::collections::BTreeSet<&String> = std::collections::BTreeSet::new();
        if let Some(o) = local_obj {
            keys.extend(o.keys());
        }
        if let Some(o) = remote_obj {
            keys.extend(o.keys());
        }

        for key in keys {
            let local_val = local_obj.and_then(|o| o.get(key));
            let remote_val = remote_obj.and_then(|o| o.get(key));

            let resolved = match (local_val, remote_val) {
                (Some(l), None) => l.clone(),
                (None, Some(r)) => r.clone(),
                (Some(l), Some(r)) if l == r => l.clone(),
                (Some(l), Some(r)) => {
                    if key == "version" || key == "updated_at" || key == "modified_at" {
                        // metadata-style fields: keep the maximum
                        if compare_loose(l, r) {
                            l.clone()
                        } else {
                            r.clone()
                        }
                    } else if CRITICAL_FIELDS.contains(&key.as_str()) {
                        if !l.is_null() && !r.is_null() {
                            escalate = true;
                        }
                        l.clone()
                    } else {
                        l.clone()
                    }
                }
                (None, None) => continue,
            };
            merged.insert(key.clone(), resolved);
        }

        let payload = Value::Object(merged);
        if escalate {
            (payload, Resolution::UserDecision, version)
        } else {
            (payload, Resolution::Merged, version)
        }
    }
}

/// Loose `>=` comparison for metadata-style fields that may be numbers or
/// RFC3339 strings.
fn compare_loose(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a >= b,
        _ => a.as_str().unwrap_or_default() >= b.as_str().unwrap_or_default(),
    }
}
