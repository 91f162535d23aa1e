//! Query minimization: the smallest valid query that still asks for
//! everything the caller needs but the store cannot already satisfy.
//!
//! The walk mirrors the denormalizer, marking each selection satisfied,
//! partial, or missing. Satisfied selections are pruned; partially held
//! pagination buckets have their arguments rewritten to the missing
//! slice; variable and fragment definitions nothing references any
//! more are dropped. Variable names are preserved — rewritten cursors
//! and counts are emitted as literals, never as fresh variables.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::ast::{
    Argument, AstValue, Document, Field, InlineFragment, Operation, Selection, selection_spreads,
    selection_variables,
};
use crate::store::CacheState;
use crate::walk::{
    CallerKey, JsonMap, PageDirection, TYPENAME_KEY, WalkContext, as_paged, as_ref_key,
};

/// Field consulted on paginated items when rewriting a slice request.
const CURSOR_FIELD: &str = "cursor";

/// `None` means the store satisfies the whole query — fully local.
pub fn minimize(ctx: &WalkContext<'_>, state: &CacheState, caller: &CallerKey) -> Option<Document> {
    let skeleton = state.result_for(caller).and_then(Value::as_object);
    let pruned = prune_selections(
        &ctx.operation.selection_set,
        ctx.root_type_name(),
        skeleton,
        state,
        ctx,
    );
    if pruned.is_empty() {
        return None;
    }

    let mut used_variables = BTreeSet::new();
    selection_variables(&pruned, &mut used_variables);

    let mut spreads = BTreeSet::new();
    selection_spreads(&pruned, &mut spreads);
    let mut fragments = BTreeMap::new();
    let mut queue: Vec<String> = spreads.into_iter().collect();
    while let Some(name) = queue.pop() {
        if fragments.contains_key(&name) {
            continue;
        }
        let Some(def) = ctx.fragments.get(&name) else {
            continue;
        };
        selection_variables(&def.selection_set, &mut used_variables);
        let mut inner = BTreeSet::new();
        selection_spreads(&def.selection_set, &mut inner);
        queue.extend(inner);
        fragments.insert(name, def.clone());
    }

    let variable_definitions = ctx
        .operation
        .variable_definitions
        .iter()
        .filter(|def| used_variables.contains(&def.name))
        .cloned()
        .collect();

    Some(Document {
        operations: vec![Operation {
            kind: ctx.operation.kind,
            name: ctx.operation.name.clone(),
            variable_definitions,
            selection_set: pruned,
        }],
        fragments,
    })
}

fn prune_selections(
    selections: &[Selection],
    parent_type: &str,
    node: Option<&JsonMap>,
    state: &CacheState,
    ctx: &WalkContext<'_>,
) -> Vec<Selection> {
    let concrete = node
        .and_then(|n| n.get(TYPENAME_KEY))
        .and_then(Value::as_str)
        .unwrap_or(parent_type)
        .to_string();

    let mut out = Vec::new();
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                if let Some(kept) = prune_field(field, &concrete, node, state, ctx) {
                    out.push(Selection::Field(kept));
                }
            }
            Selection::InlineFragment(fragment) => {
                let Some(node) = node else {
                    out.push(selection.clone());
                    continue;
                };
                if !ctx.condition_matches(fragment.type_condition.as_deref(), &concrete) {
                    continue;
                }
                let inner =
                    prune_selections(&fragment.selection_set, &concrete, Some(node), state, ctx);
                if !inner.is_empty() {
                    out.push(Selection::InlineFragment(InlineFragment {
                        type_condition: fragment.type_condition.clone(),
                        selection_set: inner,
                    }));
                }
            }
            Selection::FragmentSpread(spread) => {
                let Some(def) = ctx.fragments.get(&spread.name) else {
                    continue;
                };
                let Some(node) = node else {
                    out.push(selection.clone());
                    continue;
                };
                if !ctx.condition_matches(Some(&def.type_condition), &concrete) {
                    continue;
                }
                let inner = prune_selections(&def.selection_set, &concrete, Some(node), state, ctx);
                if inner.is_empty() {
                    continue;
                }
                if inner == def.selection_set {
                    // still needed in full: keep the shared definition
                    out.push(selection.clone());
                } else {
                    // partially satisfied: inline at the use site
                    out.push(Selection::InlineFragment(InlineFragment {
                        type_condition: Some(def.type_condition.clone()),
                        selection_set: inner,
                    }));
                }
            }
        }
    }
    out
}

fn prune_field(
    field: &Field,
    parent_type: &str,
    node: Option<&JsonMap>,
    state: &CacheState,
    ctx: &WalkContext<'_>,
) -> Option<Field> {
    let Some(node) = node else {
        return Some(field.clone());
    };
    let Some(stored) = node.get(field.response_key()) else {
        return Some(field.clone());
    };

    if let Some(key) = as_ref_key(stored) {
        let Some(body) = state.entity(&key) else {
            return Some(field.clone());
        };
        if field.selection_set.is_empty() {
            return None;
        }
        let inner = prune_selections(&field.selection_set, &key.type_name, Some(body), state, ctx);
        if inner.is_empty() {
            return None;
        }
        return Some(Field {
            selection_set: with_identity(field, inner, ctx),
            ..field.clone()
        });
    }

    if let Some(buckets) = as_paged(stored) {
        return prune_paged_field(field, buckets, state, ctx);
    }

    match stored {
        Value::Array(items) => {
            let missing = union_missing_over_items(field, items, state, ctx);
            if missing.is_empty() {
                None
            } else {
                Some(Field {
                    selection_set: with_identity(field, missing, ctx),
                    ..field.clone()
                })
            }
        }
        Value::Object(object) => {
            let declared = ctx
                .schema
                .field_named_type(parent_type, &field.name)
                .unwrap_or("");
            let inner =
                prune_selections(&field.selection_set, declared, Some(object), state, ctx);
            if inner.is_empty() {
                None
            } else {
                Some(Field {
                    selection_set: inner,
                    ..field.clone()
                })
            }
        }
        // a stored scalar (null included) satisfies the selection
        _ => None,
    }
}

fn prune_paged_field(
    field: &Field,
    buckets: &JsonMap,
    state: &CacheState,
    ctx: &WalkContext<'_>,
) -> Option<Field> {
    let page = ctx.page_args(field);
    let direction = page.direction.unwrap_or(PageDirection::Front);
    let held = buckets
        .get(direction.bucket())
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let want = match page.count {
        Some(want) => want,
        // no resolvable count: present bucket satisfies the field
        None => return None,
    };

    let have = held.len() as u64;
    let serving = have.min(want) as usize;
    let served: Vec<&Value> = match direction {
        PageDirection::Front => held.iter().take(serving).collect(),
        PageDirection::Back => held.iter().skip(held.len() - serving).collect(),
    };

    // fields missing on items we already hold force the original ask
    let missing = union_missing_over_refs(field, &served, state, ctx);
    if !missing.is_empty() {
        return Some(field.clone());
    }

    if have >= want {
        return None;
    }

    // ask only for the missing slice, anchored at the nearest held item
    let anchor = match direction {
        PageDirection::Front => served.last(),
        PageDirection::Back => served.first(),
    };
    let Some(cursor) = anchor.and_then(|item| item_cursor(item, state)) else {
        return Some(field.clone());
    };
    Some(Field {
        arguments: rewrite_page_arguments(field, direction, want - have, &cursor, ctx),
        ..field.clone()
    })
}

fn union_missing_over_items(
    field: &Field,
    items: &[Value],
    state: &CacheState,
    ctx: &WalkContext<'_>,
) -> Vec<Selection> {
    let refs: Vec<&Value> = items.iter().collect();
    union_missing_over_refs(field, &refs, state, ctx)
}

fn union_missing_over_refs(
    field: &Field,
    items: &[&Value],
    state: &CacheState,
    ctx: &WalkContext<'_>,
) -> Vec<Selection> {
    let mut union = Vec::new();
    for item in items {
        let missing = match as_ref_key(item) {
            Some(key) => match state.entity(&key) {
                Some(body) => {
                    prune_selections(&field.selection_set, &key.type_name, Some(body), state, ctx)
                }
                // dangling ref: the whole item subtree is missing
                None => field.selection_set.clone(),
            },
            None => match item.as_object() {
                Some(inline) => prune_selections(&field.selection_set, "", Some(inline), state, ctx),
                None => Vec::new(),
            },
        };
        union_selections(&mut union, &missing);
    }
    union
}

/// Merge selection sets field-by-field (by response key), recursively.
/// The mutation engine reuses this to union projections.
pub(crate) fn union_selections(into: &mut Vec<Selection>, from: &[Selection]) {
    for selection in from {
        match selection {
            Selection::Field(field) => {
                let existing = into.iter_mut().find_map(|s| match s {
                    Selection::Field(f) if f.response_key() == field.response_key() => Some(f),
                    _ => None,
                });
                match existing {
                    Some(f) => union_selections(&mut f.selection_set, &field.selection_set),
                    None => into.push(selection.clone()),
                }
            }
            Selection::InlineFragment(fragment) => {
                let existing = into.iter_mut().find_map(|s| match s {
                    Selection::InlineFragment(f)
                        if f.type_condition == fragment.type_condition =>
                    {
                        Some(f)
                    }
                    _ => None,
                });
                match existing {
                    Some(f) => union_selections(&mut f.selection_set, &fragment.selection_set),
                    None => into.push(selection.clone()),
                }
            }
            Selection::FragmentSpread(spread) => {
                let present = into.iter().any(|s| {
                    matches!(s, Selection::FragmentSpread(existing) if existing.name == spread.name)
                });
                if !present {
                    into.push(selection.clone());
                }
            }
        }
    }
}

/// The normalizer needs identity to key what comes back: when an entity
/// subtree survives pruning, the id (and discriminating `__typename`)
/// the original asked for ride along.
fn with_identity(field: &Field, mut kept: Vec<Selection>, ctx: &WalkContext<'_>) -> Vec<Selection> {
    for name in [ctx.id_field, TYPENAME_KEY] {
        let asked = field.selection_set.iter().any(
            |s| matches!(s, Selection::Field(f) if f.name == name && f.alias.is_none()),
        );
        let present = kept.iter().any(
            |s| matches!(s, Selection::Field(f) if f.name == name && f.alias.is_none()),
        );
        if asked && !present {
            kept.push(Selection::Field(Field::new(name)));
        }
    }
    kept
}

fn item_cursor(item: &Value, state: &CacheState) -> Option<String> {
    let key = as_ref_key(item)?;
    state
        .entity(&key)?
        .get(CURSOR_FIELD)?
        .as_str()
        .map(str::to_string)
}

/// Original non-pagination arguments plus a literal count and cursor
/// for the missing slice, in the direction the operation already used.
fn rewrite_page_arguments(
    field: &Field,
    direction: PageDirection,
    needed: u64,
    cursor: &str,
    ctx: &WalkContext<'_>,
) -> Vec<Argument> {
    let words = ctx.pagination;
    let (count_word, cursor_word) = match direction {
        PageDirection::Front => (&words.first, &words.after),
        PageDirection::Back => (&words.last, &words.before),
    };
    let mut out: Vec<Argument> = field
        .arguments
        .iter()
        .filter(|arg| !words.is_pagination(&arg.name))
        .cloned()
        .collect();
    out.push(Argument {
        name: count_word.clone(),
        value: AstValue::Int(needed as i64),
    });
    out.push(Argument {
        name: cursor_word.clone(),
        value: AstValue::String(cursor.to_string()),
    });
    out
}
