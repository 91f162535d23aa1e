//! Response normalization: flatten a server-shaped response into
//! `{ entities, result }` guided by the active operation and schema.

use serde_json::Value;

use crate::ast::{Field, Selection};
use crate::store::merge::{MergeMode, merge_object};
use crate::walk::{
    EntityKey, EntityMap, JsonMap, NormalizedResponse, PAGED_KEY, TYPENAME_KEY, WalkContext,
    make_ref,
};

pub fn normalize(data: &Value, ctx: &WalkContext<'_>) -> NormalizedResponse {
    let mut entities = EntityMap::new();
    let result = match data.as_object() {
        Some(map) => Value::Object(normalize_selections(
            &ctx.operation.selection_set,
            ctx.root_type_name(),
            map,
            &mut entities,
            ctx,
        )),
        None => Value::Null,
    };
    NormalizedResponse { entities, result }
}

fn normalize_selections(
    selections: &[Selection],
    parent_type: &str,
    data: &JsonMap,
    entities: &mut EntityMap,
    ctx: &WalkContext<'_>,
) -> JsonMap {
    let concrete = data
        .get(TYPENAME_KEY)
        .and_then(Value::as_str)
        .unwrap_or(parent_type)
        .to_string();

    let mut out = JsonMap::new();
    if let Some(type_name) = data.get(TYPENAME_KEY) {
        out.insert(TYPENAME_KEY.to_string(), type_name.clone());
    }

    for selection in selections {
        match selection {
            Selection::Field(field) => {
                let Some(value) = data.get(field.response_key()) else {
                    continue;
                };
                let declared = ctx.schema.field_named_type(&concrete, &field.name);
                let mut node = normalize_field_value(value, field, declared, entities, ctx);
                if value.is_array()
                    && let Some(direction) = ctx.page_args(field).direction
                {
                    let mut buckets = JsonMap::new();
                    buckets.insert(direction.bucket().to_string(), node);
                    let mut paged = JsonMap::new();
                    paged.insert(PAGED_KEY.to_string(), Value::Object(buckets));
                    node = Value::Object(paged);
                }
                out.insert(field.response_key().to_string(), node);
            }
            Selection::InlineFragment(fragment) => {
                if ctx.condition_matches(fragment.type_condition.as_deref(), &concrete) {
                    let inner =
                        normalize_selections(&fragment.selection_set, &concrete, data, entities, ctx);
                    merge_object(&mut out, &inner, MergeMode::Query);
                }
            }
            Selection::FragmentSpread(spread) => {
                if let Some(def) = ctx.fragments.get(&spread.name)
                    && ctx.condition_matches(Some(&def.type_condition), &concrete)
                {
                    let inner =
                        normalize_selections(&def.selection_set, &concrete, data, entities, ctx);
                    merge_object(&mut out, &inner, MergeMode::Query);
                }
            }
        }
    }
    out
}

fn normalize_field_value(
    value: &Value,
    field: &Field,
    declared: Option<&str>,
    entities: &mut EntityMap,
    ctx: &WalkContext<'_>,
) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| normalize_field_value(item, field, declared, entities, ctx))
                .collect(),
        ),
        Value::Object(map) => normalize_object(map, field, declared, entities, ctx),
        other => other.clone(),
    }
}

fn normalize_object(
    map: &JsonMap,
    field: &Field,
    declared: Option<&str>,
    entities: &mut EntityMap,
    ctx: &WalkContext<'_>,
) -> Value {
    let concrete = map
        .get(TYPENAME_KEY)
        .and_then(Value::as_str)
        .or(declared);

    if let Some(type_name) = concrete
        && let Some(id) = map.get(ctx.id_field).and_then(scalar_id)
        && composite(ctx, type_name)
    {
        let mut body = normalize_selections(&field.selection_set, type_name, map, entities, ctx);
        // identity always travels with the body
        if let Some(id_value) = map.get(ctx.id_field) {
            body.insert(ctx.id_field.to_string(), id_value.clone());
        }
        let slot = entities.entry(type_name.to_string()).or_default();
        match slot.get_mut(&id) {
            Some(existing) => merge_object(existing, &body, MergeMode::Query),
            None => {
                slot.insert(id.clone(), body);
            }
        }
        return make_ref(&EntityKey::new(type_name, id));
    }

    // identity-less objects inline
    Value::Object(normalize_selections(
        &field.selection_set,
        concrete.unwrap_or(""),
        map,
        entities,
        ctx,
    ))
}

/// Types the schema does not know are tolerated as entities; known
/// types must be composite.
fn composite(ctx: &WalkContext<'_>, type_name: &str) -> bool {
    ctx.schema
        .type_def(type_name)
        .is_none_or(|def| def.kind.is_composite())
}

fn scalar_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
