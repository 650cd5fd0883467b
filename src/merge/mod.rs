//! Lattice merge rules for contact content
//!
//! Every content write in the system funnels through [`merge`], so the
//! blend modes defined here are what make gossip convergence
//! order-independent: apart from the documented `accept-last` escape
//! hatch, each mode is a join-semilattice (commutative, associative,
//! idempotent).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// How two content values for the same contact combine.
///
/// Fixed at contact creation. All modes are total: mismatched input
/// types fall back to accept-last rather than failing.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BlendMode {
    /// Right-biased: the incoming value wins. Deliberately not
    /// commutative — two replicas applying the same pair of writes in
    /// different arrival orders can disagree. Callers that need
    /// convergence must pick another mode.
    #[default]
    AcceptLast,

    /// Shallow right-biased key merge of two JSON objects.
    Merge,

    /// Max of cumulative counts. Counters are absolute values, not
    /// increment deltas, which makes the merge a proper join.
    Counter,

    /// Numeric maximum.
    MaxNumber,

    /// Numeric minimum.
    MinNumber,

    /// Set union of two arrays, deduplicated and ordered by canonical
    /// encoding so equal sets hash equal on every replica.
    SetUnion,

    /// Last-write-wins by an embedded `timestamp` field, ties broken by
    /// comparing canonical encodings.
    Lww,
}

/// Merge two content values under a blend mode.
///
/// Total for all well-typed inputs; when the inputs do not fit the mode
/// (e.g. `max-number` over strings) the result is the accept-last
/// fallback, never an error.
pub fn merge(mode: BlendMode, current: &Value, incoming: &Value) -> Value {
    match mode {
        BlendMode::AcceptLast => incoming.clone(),
        BlendMode::Merge => merge_objects(current, incoming),
        BlendMode::Counter | BlendMode::MaxNumber => numeric_extreme(current, incoming, true),
        BlendMode::MinNumber => numeric_extreme(current, incoming, false),
        BlendMode::SetUnion => set_union(current, incoming),
        BlendMode::Lww => last_write_wins(current, incoming),
    }
}

/// Deterministic digest of a content value, used by the gossip layer to
/// detect divergence cheaply. Equal content always hashes equal; hash
/// equality is a convergence heuristic, never an identity check.
pub fn content_hash(content: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical(content).as_bytes());
    hex::encode(hasher.finalize())
}

/// Wrap a value for an `lww` contact, stamping the current wall-clock
/// write time in milliseconds.
pub fn lww_stamp(value: Value) -> Value {
    serde_json::json!({
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "value": value,
    })
}

/// Canonical JSON encoding. serde_json's default object map is ordered
/// by key, so serializing the same value always yields the same bytes.
fn canonical(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn merge_objects(current: &Value, incoming: &Value) -> Value {
    match (current, incoming) {
        (Value::Object(cur), Value::Object(inc)) => {
            let mut out = cur.clone();
            for (key, val) in inc {
                out.insert(key.clone(), val.clone());
            }
            Value::Object(out)
        }
        _ => incoming.clone(),
    }
}

fn numeric_extreme(current: &Value, incoming: &Value, want_max: bool) -> Value {
    match (current.as_f64(), incoming.as_f64()) {
        (Some(cur), Some(inc)) => {
            let incoming_wins = if want_max { inc > cur } else { inc < cur };
            if incoming_wins {
                incoming.clone()
            } else {
                current.clone()
            }
        }
        _ => incoming.clone(),
    }
}

fn set_union(current: &Value, incoming: &Value) -> Value {
    match (current, incoming) {
        (Value::Array(cur), Value::Array(inc)) => {
            let mut members: Vec<Value> = Vec::new();
            for item in cur.iter().chain(inc.iter()) {
                if !members.contains(item) {
                    members.push(item.clone());
                }
            }
            members.sort_by_key(canonical);
            Value::Array(members)
        }
        _ => incoming.clone(),
    }
}

fn last_write_wins(current: &Value, incoming: &Value) -> Value {
    let timestamp = |v: &Value| v.get("timestamp").and_then(Value::as_f64);
    match (timestamp(current), timestamp(incoming)) {
        (Some(cur_ts), Some(inc_ts)) => {
            if inc_ts > cur_ts {
                incoming.clone()
            } else if inc_ts < cur_ts {
                current.clone()
            } else if canonical(incoming) > canonical(current) {
                // Equal timestamps: break the tie on canonical encoding
                // so both replicas pick the same winner.
                incoming.clone()
            } else {
                current.clone()
            }
        }
        _ => incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const JOIN_MODES: [BlendMode; 6] = [
        BlendMode::Merge,
        BlendMode::Counter,
        BlendMode::MaxNumber,
        BlendMode::MinNumber,
        BlendMode::SetUnion,
        BlendMode::Lww,
    ];

    fn sample_for(mode: BlendMode) -> (Value, Value, Value) {
        match mode {
            BlendMode::Merge => (
                json!({"a": 1, "b": 2}),
                json!({"b": 3, "c": 4}),
                json!({"c": 5, "d": 6}),
            ),
            BlendMode::SetUnion => (json!([1, 2]), json!([2, 3]), json!([3, 4])),
            BlendMode::Lww => (
                json!({"timestamp": 100.0, "value": "first"}),
                json!({"timestamp": 200.0, "value": "second"}),
                json!({"timestamp": 300.0, "value": "third"}),
            ),
            _ => (json!(10), json!(20), json!(5)),
        }
    }

    #[test]
    fn test_idempotence() {
        for mode in JOIN_MODES {
            let (a, _, _) = sample_for(mode);
            assert_eq!(merge(mode, &a, &a), a, "{:?} not idempotent", mode);
        }
    }

    #[test]
    fn test_commutativity() {
        // Merge is right-biased per key, so commutativity only holds
        // for the modes with a genuine join.
        for mode in [
            BlendMode::Counter,
            BlendMode::MaxNumber,
            BlendMode::MinNumber,
            BlendMode::SetUnion,
            BlendMode::Lww,
        ] {
            let (a, b, _) = sample_for(mode);
            assert_eq!(
                merge(mode, &a, &b),
                merge(mode, &b, &a),
                "{:?} not commutative",
                mode
            );
        }
    }

    #[test]
    fn test_associativity() {
        // Accept-last is not a join but still associates: every
        // grouping resolves to the rightmost write.
        for mode in JOIN_MODES.into_iter().chain([BlendMode::AcceptLast]) {
            let (a, b, c) = sample_for(mode);
            let left = merge(mode, &merge(mode, &a, &b), &c);
            let right = merge(mode, &a, &merge(mode, &b, &c));
            assert_eq!(left, right, "{:?} not associative", mode);
        }
    }

    #[test]
    fn test_accept_last_is_right_biased() {
        assert_eq!(
            merge(BlendMode::AcceptLast, &json!(1), &json!(2)),
            json!(2)
        );
        assert_eq!(
            merge(BlendMode::AcceptLast, &json!(2), &json!(1)),
            json!(1)
        );
    }

    #[test]
    fn test_counter_takes_max_of_cumulative_counts() {
        assert_eq!(merge(BlendMode::Counter, &json!(7), &json!(3)), json!(7));
        assert_eq!(merge(BlendMode::Counter, &json!(3), &json!(7)), json!(7));
    }

    #[test]
    fn test_min_number() {
        assert_eq!(merge(BlendMode::MinNumber, &json!(3), &json!(7)), json!(3));
    }

    #[test]
    fn test_object_merge_is_shallow_and_right_biased() {
        let merged = merge(
            BlendMode::Merge,
            &json!({"a": 1, "b": {"x": 1}}),
            &json!({"b": {"y": 2}, "c": 3}),
        );
        assert_eq!(merged, json!({"a": 1, "b": {"y": 2}, "c": 3}));
    }

    #[test]
    fn test_set_union_order_is_deterministic() {
        let ab = merge(BlendMode::SetUnion, &json!(["a"]), &json!(["b", "c"]));
        let ba = merge(BlendMode::SetUnion, &json!(["c", "b"]), &json!(["a"]));
        assert_eq!(ab, ba);
        assert_eq!(content_hash(&ab), content_hash(&ba));
    }

    #[test]
    fn test_lww_picks_higher_timestamp() {
        let older = json!({"timestamp": 100.0, "value": "old"});
        let newer = json!({"timestamp": 200.0, "value": "new"});
        assert_eq!(merge(BlendMode::Lww, &older, &newer), newer);
        assert_eq!(merge(BlendMode::Lww, &newer, &older), newer);
    }

    #[test]
    fn test_lww_tie_break_is_stable() {
        let left = json!({"timestamp": 100.0, "value": "aaa"});
        let right = json!({"timestamp": 100.0, "value": "zzz"});
        assert_eq!(
            merge(BlendMode::Lww, &left, &right),
            merge(BlendMode::Lww, &right, &left)
        );
    }

    #[test]
    fn test_lww_stamp_shape() {
        let stamped = lww_stamp(json!("ready"));
        assert!(stamped.get("timestamp").and_then(Value::as_i64).is_some());
        assert_eq!(stamped["value"], json!("ready"));
    }

    #[test]
    fn test_type_mismatch_falls_back_to_accept_last() {
        assert_eq!(
            merge(BlendMode::MaxNumber, &json!("not a number"), &json!(5)),
            json!(5)
        );
        assert_eq!(
            merge(BlendMode::SetUnion, &json!([1]), &json!("scalar")),
            json!("scalar")
        );
        assert_eq!(
            merge(BlendMode::Lww, &json!({"value": 1}), &json!({"value": 2})),
            json!({"value": 2})
        );
    }

    #[test]
    fn test_content_hash_deterministic() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"a": 1})));
    }
}
