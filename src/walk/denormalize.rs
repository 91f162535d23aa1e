//! Store denormalization: rebuild a response shape for one caller from
//! its skeleton and the entity map, marking completeness.
//!
//! Anything missing — a dangling ref, an absent scalar, a short
//! pagination bucket — omits that subtree and clears `is_complete`.
//! Missing data is data, never an error.

use serde_json::Value;

use crate::ast::{Field, Selection};
use crate::store::CacheState;
use crate::walk::{
    CallerKey, JsonMap, PageDirection, TYPENAME_KEY, WalkContext, as_paged, as_ref_key,
};

#[derive(Clone, Debug, PartialEq)]
pub struct Denormalized {
    pub data: Value,
    pub is_complete: bool,
}

pub fn denormalize(ctx: &WalkContext<'_>, state: &CacheState, caller: &CallerKey) -> Denormalized {
    let Some(skeleton) = state.result_for(caller) else {
        return Denormalized {
            data: Value::Object(JsonMap::new()),
            is_complete: false,
        };
    };
    let mut complete = true;
    let data = match skeleton.as_object() {
        Some(node) => Value::Object(read_selections(
            &ctx.operation.selection_set,
            ctx.root_type_name(),
            node,
            state,
            ctx,
            &mut complete,
        )),
        None => {
            complete = false;
            Value::Object(JsonMap::new())
        }
    };
    Denormalized {
        data,
        is_complete: complete,
    }
}

fn read_selections(
    selections: &[Selection],
    parent_type: &str,
    node: &JsonMap,
    state: &CacheState,
    ctx: &WalkContext<'_>,
    complete: &mut bool,
) -> JsonMap {
    let concrete = node
        .get(TYPENAME_KEY)
        .and_then(Value::as_str)
        .unwrap_or(parent_type)
        .to_string();

    let mut out = JsonMap::new();
    if let Some(type_name) = node.get(TYPENAME_KEY) {
        out.insert(TYPENAME_KEY.to_string(), type_name.clone());
    }

    for selection in selections {
        match selection {
            Selection::Field(field) => {
                let Some(stored) = node.get(field.response_key()) else {
                    *complete = false;
                    continue;
                };
                let declared = ctx
                    .schema
                    .field_named_type(&concrete, &field.name)
                    .unwrap_or("");
                match read_value(stored, field, declared, state, ctx, complete) {
                    Some(value) => {
                        out.insert(field.response_key().to_string(), value);
                    }
                    None => *complete = false,
                }
            }
            Selection::InlineFragment(fragment) => {
                if ctx.condition_matches(fragment.type_condition.as_deref(), &concrete) {
                    let inner = read_selections(
                        &fragment.selection_set,
                        &concrete,
                        node,
                        state,
                        ctx,
                        complete,
                    );
                    for (key, value) in inner {
                        out.insert(key, value);
                    }
                }
            }
            Selection::FragmentSpread(spread) => {
                if let Some(def) = ctx.fragments.get(&spread.name)
                    && ctx.condition_matches(Some(&def.type_condition), &concrete)
                {
                    let inner =
                        read_selections(&def.selection_set, &concrete, node, state, ctx, complete);
                    for (key, value) in inner {
                        out.insert(key, value);
                    }
                }
            }
        }
    }
    out
}

fn read_value(
    stored: &Value,
    field: &Field,
    declared: &str,
    state: &CacheState,
    ctx: &WalkContext<'_>,
    complete: &mut bool,
) -> Option<Value> {
    if let Some(key) = as_ref_key(stored) {
        let body = state.entity(&key)?;
        return Some(Value::Object(read_selections(
            &field.selection_set,
            &key.type_name,
            body,
            state,
            ctx,
            complete,
        )));
    }

    if let Some(buckets) = as_paged(stored) {
        let page = ctx.page_args(field);
        let direction = page.direction.unwrap_or(PageDirection::Front);
        let held = buckets
            .get(direction.bucket())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let take = match page.count {
            Some(want) => {
                if (held.len() as u64) < want {
                    *complete = false;
                }
                held.len().min(want as usize)
            }
            None => held.len(),
        };
        // the back bucket holds natural order; "last n" serves its tail
        let skip = match direction {
            PageDirection::Front => 0,
            PageDirection::Back => held.len() - take,
        };
        let mut items = Vec::with_capacity(take);
        for item in held.iter().skip(skip).take(take) {
            match read_value(item, field, declared, state, ctx, complete) {
                Some(value) => items.push(value),
                None => *complete = false,
            }
        }
        return Some(Value::Array(items));
    }

    match stored {
        Value::Array(stored_items) => {
            let mut items = Vec::with_capacity(stored_items.len());
            for item in stored_items {
                match read_value(item, field, declared, state, ctx, complete) {
                    Some(value) => items.push(value),
                    None => *complete = false,
                }
            }
            Some(Value::Array(items))
        }
        Value::Object(object) => Some(Value::Object(read_selections(
            &field.selection_set,
            declared,
            object,
            state,
            ctx,
            complete,
        ))),
        other => Some(other.clone()),
    }
}
