//! Deep merge of normalized responses into the store.
//!
//! Scalar leaves are last-write-wins. Plain arrays replace. Pagination
//! buckets merge positionally: the front bucket appends refs it does
//! not already hold, the back bucket prepends them. Mutation mode makes
//! every incoming array authoritative, buckets included.

use serde_json::Value;

use crate::store::CacheState;
use crate::walk::{BACK_BUCKET, EntityMap, FRONT_BUCKET, JsonMap, PAGED_KEY};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    Query,
    Mutation,
}

pub fn merge_entities(into: &mut EntityMap, from: &EntityMap, mode: MergeMode) {
    for (type_name, ids) in from {
        let slot = into.entry(type_name.clone()).or_default();
        for (id, body) in ids {
            match slot.get_mut(id) {
                Some(existing) => merge_object(existing, body, mode),
                None => {
                    slot.insert(id.clone(), body.clone());
                }
            }
        }
    }
}

pub fn merge_object(into: &mut JsonMap, from: &JsonMap, mode: MergeMode) {
    for (key, value) in from {
        match into.get_mut(key) {
            Some(existing) => merge_value(existing, value, mode),
            None => {
                into.insert(key.clone(), value.clone());
            }
        }
    }
}

pub fn merge_value(into: &mut Value, from: &Value, mode: MergeMode) {
    match (&mut *into, from) {
        (Value::Object(a), Value::Object(b)) => {
            if a.contains_key(PAGED_KEY) && b.contains_key(PAGED_KEY) {
                merge_paged(a, b, mode);
            } else {
                merge_object(a, b, mode);
            }
        }
        // arrays replace; only bucket arrays accumulate, and those are
        // reached through the paged branch above
        _ => *into = from.clone(),
    }
}

fn merge_paged(into: &mut JsonMap, from: &JsonMap, mode: MergeMode) {
    let Some(Value::Object(from_buckets)) = from.get(PAGED_KEY) else {
        return;
    };
    let slot = into
        .entry(PAGED_KEY.to_string())
        .or_insert_with(|| Value::Object(JsonMap::new()));
    let Some(into_buckets) = slot.as_object_mut() else {
        *slot = Value::Object(from_buckets.clone());
        return;
    };
    for (bucket, incoming) in from_buckets {
        match (into_buckets.get_mut(bucket), incoming, mode) {
            (Some(Value::Array(held)), Value::Array(new), MergeMode::Query) => {
                if bucket == FRONT_BUCKET {
                    for item in new {
                        if !held.contains(item) {
                            held.push(item.clone());
                        }
                    }
                } else if bucket == BACK_BUCKET {
                    for item in new.iter().rev() {
                        if !held.contains(item) {
                            held.insert(0, item.clone());
                        }
                    }
                } else {
                    *held = new.clone();
                }
            }
            (existing, incoming, _) => {
                let incoming = incoming.clone();
                match existing {
                    Some(slot) => *slot = incoming,
                    None => {
                        into_buckets.insert(bucket.clone(), incoming);
                    }
                }
            }
        }
    }
}

/// Drop entity fields that equal what the store already holds; entities
/// with nothing left are dropped entirely.
pub fn shorten_entities(new: &EntityMap, state: &CacheState) -> EntityMap {
    let mut out = EntityMap::new();
    for (type_name, ids) in new {
        for (id, body) in ids {
            let kept: JsonMap = match state.entities.get(type_name).and_then(|m| m.get(id)) {
                None => body.clone(),
                Some(stored) => body
                    .iter()
                    .filter(|(key, value)| stored.get(*key) != Some(value))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            };
            if !kept.is_empty() {
                out.entry(type_name.clone()).or_default().insert(id.clone(), kept);
            }
        }
    }
    out
}
