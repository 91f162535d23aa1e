//! Mutation engine: one merged mutation document per mutation name,
//! covering every caller a result could touch.
//!
//! Each affected caller contributes a projection of its own query onto
//! the mutation's return type. Projections are namespaced under a
//! caller-stable alias prefix so overlapping fields with different
//! arguments coexist in one document; variable enhancer entries rewrite
//! the user's bag into the namespaced form. Handlers run twice: an
//! optimistic pass before the transport and an authoritative pass with
//! the de-namespaced server payload.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde_json::Value;

use crate::ast::{
    Argument, AstValue, Document, Field, FragmentDefinition, InlineFragment, Operation,
    OperationKind, Selection, VariableDefinition, print_document,
};
use crate::cache::{Cache, CachedResponse, ContractError, Inner};
use crate::schema::{FieldDefinition, Schema};
use crate::store::{CacheAction, CacheState, MergeMode, merge_entities, shorten_entities};
use crate::transport::{QueryRequest, TransportError, TransportPhase};
use crate::walk::{CallerKey, EntityMap, JsonMap, WalkContext, normalize};

#[derive(Default)]
pub struct MutateOptions {
    /// The user's variable bag; names must match the mutation's
    /// schema arguments to travel as arguments.
    pub variables: JsonMap,
    /// Restrict the affected callers. Intersected with the callers
    /// that registered a handler for this mutation.
    pub components: Option<Vec<CallerKey>>,
    /// Per-call transport override.
    pub transport: Option<Rc<dyn crate::transport::Transport>>,
}

/// What a handler decided. Explicit — there is no side-channel flag.
pub enum HandlerOutcome {
    /// Install this denormalized result for the caller and fold its
    /// diff into the store.
    Replace(Value),
    /// The caller's view cannot be patched locally; refetch it.
    Invalidate,
    /// Leave the caller untouched.
    Noop,
}

/// Cross-reference lookups available to handlers.
pub struct HandlerContext<'a> {
    pub(crate) state: &'a CacheState,
    pub(crate) variables: &'a JsonMap,
    pub(crate) id_field: &'a str,
}

impl HandlerContext<'_> {
    /// The caller's resolved variables.
    pub fn variables(&self) -> &JsonMap {
        self.variables
    }

    pub fn id_field(&self) -> &str {
        self.id_field
    }

    /// Every stored entity of a type, keyed by id. Bodies are
    /// normalized: nested entities appear as refs, paginated fields as
    /// buckets.
    pub fn get_type(&self, type_name: &str) -> Value {
        let mut out = JsonMap::new();
        if let Some(ids) = self.state.entities.get(type_name) {
            for (id, body) in ids {
                out.insert(id.clone(), Value::Object(body.clone()));
            }
        }
        Value::Object(out)
    }

    pub fn entity(&self, type_name: &str, id: &str) -> Option<Value> {
        self.state
            .entities
            .get(type_name)?
            .get(id)
            .map(|body| Value::Object(body.clone()))
    }
}

/// The two distinct operations the original encoded as one nullable
/// argument: an optimistic guess and the authoritative application.
pub trait MutationHandler {
    /// Runs before the server round-trip with the user's variables.
    /// The default guesses nothing.
    fn optimistic(
        &self,
        variables: &JsonMap,
        current: &Value,
        ctx: &HandlerContext<'_>,
    ) -> HandlerOutcome {
        let _ = (variables, current, ctx);
        HandlerOutcome::Noop
    }

    /// Runs with the de-namespaced, caller-shaped server payload.
    fn authoritative(
        &self,
        server_doc: &Value,
        current: &Value,
        ctx: &HandlerContext<'_>,
    ) -> HandlerOutcome;
}

/// Per-mutation merge state, reusable across calls while the variable
/// names and active callers hold still.
#[derive(Default)]
pub struct CachedMutation {
    pub(crate) full_printed: Option<String>,
    pub(crate) full_document: Option<Document>,
    pub(crate) singles: BTreeMap<String, MutationSingle>,
    pub(crate) variable_set: BTreeSet<String>,
    pub(crate) active: Vec<CallerKey>,
    pub(crate) enhancers: Vec<EnhancerEntry>,
    next_prefix: usize,
}

impl CachedMutation {
    /// A new caller joined: the merged document is stale, the other
    /// callers' singles are not.
    pub(crate) fn reset_for(&mut self, caller_id: &str) {
        self.full_printed = None;
        self.full_document = None;
        self.variable_set.clear();
        self.active.clear();
        self.enhancers.clear();
        self.singles.remove(caller_id);
    }
}

/// One caller's namespaced projection onto the mutation return type.
pub(crate) struct MutationSingle {
    pub(crate) prefix: String,
    pub(crate) selections: Vec<Selection>,
    /// original variable name → namespaced name.
    pub(crate) variable_map: Vec<(String, String)>,
}

/// Rewrites one entry of a user bag into the namespaced form the
/// merged document expects; values come from the owning caller's
/// stored variables.
#[derive(Clone, Debug)]
pub(crate) struct EnhancerEntry {
    pub(crate) caller_id: String,
    pub(crate) original: String,
    pub(crate) namespaced: String,
}

impl Cache {
    /// Run a named mutation: optimistic handler pass, server
    /// round-trip, authoritative handler pass.
    pub async fn mutate(&self, name: &str, options: MutateOptions) -> crate::Result<()> {
        let field_def = self
            .schema
            .mutation_field(name)
            .ok_or_else(|| ContractError::UnknownMutation(name.to_string()))?
            .clone();

        let (printed, enhancers, active) = {
            let mut inner = self.inner.borrow_mut();
            let active = inner.active_components(name, options.components.as_deref());
            let (printed, enhancers) =
                update_cached_mutation(&mut inner, &self.schema, name, &field_def, &active, &options.variables);
            (printed, enhancers, active)
        };

        self.process_mutation_handlers(name, &active, None, &options.variables)
            .await?;

        let variables = self.enhance_variables(&enhancers, &options.variables);
        let transport = self.pick_transport(options.transport);
        tracing::debug!(mutation = name, callers = active.len(), "mutating server");
        let outcome = transport
            .handle_query(QueryRequest {
                query: printed,
                variables,
            })
            .await;

        let payload = match outcome {
            Ok(payload) if payload.error.is_none() => payload,
            Ok(payload) => {
                let message = payload.error.unwrap_or_else(|| "server error".to_string());
                return self.fail_mutation(message);
            }
            Err(err) => return self.fail_mutation(err.message),
        };

        let data = payload.data.unwrap_or(Value::Null);
        let docs = self.denamespace_per_caller(name, &data, &active);
        self.process_mutation_handlers(name, &active, Some(&docs), &options.variables)
            .await
    }

    /// Optimistic state stays in place: reverting is the application's
    /// call, by re-invoking or refetching.
    fn fail_mutation(&self, message: String) -> crate::Result<()> {
        tracing::warn!(error = %message, "mutation transport failed");
        self.dispatch(CacheAction::SetError {
            error: message.clone(),
        });
        Err(TransportError::new(TransportPhase::Mutation, message).into())
    }

    async fn process_mutation_handlers(
        &self,
        name: &str,
        active: &[CallerKey],
        server_docs: Option<&BTreeMap<String, Value>>,
        variables: &JsonMap,
    ) -> crate::Result<()> {
        let authoritative = server_docs.is_some();
        let state = self.state();
        let mut accumulated = EntityMap::new();
        let mut results: Vec<(CallerKey, Value)> = Vec::new();
        let mut bags: Vec<(CallerKey, Value)> = Vec::new();
        let mut refetches: Vec<CallerKey> = Vec::new();

        for caller in active {
            let handler = self
                .inner
                .borrow()
                .handlers
                .get(name)
                .and_then(|handlers| handlers.get(&caller.id))
                .cloned();
            let Some(handler) = handler else {
                continue;
            };
            let current = self
                .cached_response(caller)
                .ok_or_else(|| ContractError::MissingCaller {
                    mutation: name.to_string(),
                    caller: caller.id.clone(),
                })?;

            let caller_vars = state
                .variables_for(caller)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let handler_ctx = HandlerContext {
                state: &state,
                variables: &caller_vars,
                id_field: &self.config.id_field,
            };
            let outcome = match server_docs {
                None => handler.optimistic(variables, &current.data, &handler_ctx),
                Some(docs) => handler.authoritative(
                    docs.get(&caller.id).unwrap_or(&Value::Null),
                    &current.data,
                    &handler_ctx,
                ),
            };

            match outcome {
                HandlerOutcome::Noop => {}
                HandlerOutcome::Invalidate => refetches.push(caller.clone()),
                HandlerOutcome::Replace(data) => {
                    let document = self
                        .inner
                        .borrow()
                        .queries
                        .get(&caller.id)
                        .map(|query| query.document.clone())
                        .ok_or_else(|| ContractError::UnknownCaller(caller.id.clone()))?;
                    let walk_ctx =
                        WalkContext::new(&document, &self.schema, &self.config, caller_vars.clone())?;
                    let normalized = normalize(&data, &walk_ctx);
                    merge_entities(&mut accumulated, &normalized.entities, MergeMode::Mutation);
                    results.push((caller.clone(), normalized.result));
                    bags.push((caller.clone(), Value::Object(caller_vars.clone())));
                    // fresh stamp even when the data compares equal
                    self.install_response(
                        caller,
                        CachedResponse {
                            data,
                            is_complete: current.is_complete,
                            first_run: false,
                            error: None,
                            stamp: self.next_stamp(),
                        },
                    );
                }
            }
        }

        let shortened = shorten_entities(&accumulated, &state);
        if !shortened.is_empty() || !results.is_empty() {
            self.dispatch(CacheAction::InsertMutation {
                entities: shortened.clone(),
                results,
                variables: bags,
            });
        }

        // only the authoritative response may cascade invalidation
        if authoritative && !shortened.is_empty() {
            let stale = {
                let mut inner = self.inner.borrow_mut();
                let stale = inner.deps.dependents(&shortened, active);
                inner.clear_responses(&stale);
                stale
            };
            if !stale.is_empty() {
                tracing::debug!(mutation = name, count = stale.len(), "flushing dependent callers");
            }
        }

        for caller in refetches {
            if let Err(err) = self.refetch(&caller).await {
                tracing::warn!(caller = %caller.id, error = %err, "refetch after invalidate failed");
            }
        }

        Ok(())
    }

    /// The namespaced bag: user variables plus each enhancer entry,
    /// valued from the owning caller's stored variables (falling back
    /// to the user bag).
    fn enhance_variables(&self, enhancers: &[EnhancerEntry], user: &JsonMap) -> JsonMap {
        let state = self.state();
        let mut out = user.clone();
        for entry in enhancers {
            let caller = CallerKey::new(entry.caller_id.clone());
            let stored = state
                .variables_for(&caller)
                .and_then(Value::as_object)
                .and_then(|bag| bag.get(&entry.original))
                .cloned();
            let value = stored.or_else(|| user.get(&entry.original).cloned());
            if let Some(value) = value {
                out.insert(entry.namespaced.clone(), value);
            }
        }
        out
    }

    /// Split the aliased server payload back into caller-shaped
    /// documents.
    fn denamespace_per_caller(
        &self,
        name: &str,
        data: &Value,
        active: &[CallerKey],
    ) -> BTreeMap<String, Value> {
        let payload = data.get(name).cloned().unwrap_or(Value::Null);
        let inner = self.inner.borrow();
        let singles = inner
            .mutations
            .get(name)
            .map(|cached| &cached.singles);
        let mut out = BTreeMap::new();
        for caller in active {
            if out.contains_key(&caller.id) {
                continue;
            }
            let doc = match singles.and_then(|map| map.get(&caller.id)) {
                Some(single) => strip_prefix_value(&payload, &single.prefix),
                // scalar return types have no projection to undo
                None => payload.clone(),
            };
            out.insert(caller.id.clone(), doc);
        }
        out
    }
}

impl Inner {
    /// The callers this mutation will touch: those with a registered
    /// handler, narrowed to the requested components when given,
    /// expanded to every cached instance otherwise.
    pub(crate) fn active_components(
        &self,
        mutation: &str,
        requested: Option<&[CallerKey]>,
    ) -> Vec<CallerKey> {
        let registered: BTreeSet<&String> = self
            .handlers
            .get(mutation)
            .map(|handlers| handlers.keys().collect())
            .unwrap_or_default();
        match requested {
            Some(components) => components
                .iter()
                .filter(|caller| registered.contains(&caller.id))
                .cloned()
                .collect(),
            None => {
                let mut out = Vec::new();
                for id in registered {
                    let Some(query) = self.queries.get(id) else {
                        continue;
                    };
                    let mut instances: Vec<Option<String>> =
                        query.responses.keys().cloned().collect();
                    instances.sort();
                    for instance in instances {
                        out.push(CallerKey {
                            id: id.clone(),
                            instance,
                        });
                    }
                }
                out
            }
        }
    }
}

/// Reuse the merged document while the variable names and active set
/// match; otherwise rebuild it from per-caller singles (cached
/// themselves).
fn update_cached_mutation(
    inner: &mut Inner,
    schema: &Schema,
    name: &str,
    field_def: &FieldDefinition,
    active: &[CallerKey],
    variables: &JsonMap,
) -> (String, Vec<EnhancerEntry>) {
    let bag_names: BTreeSet<String> = variables.keys().cloned().collect();
    {
        let cached = inner.mutations.entry(name.to_string()).or_default();
        if let Some(printed) = &cached.full_printed
            && cached.variable_set == bag_names
            && cached.active == active
        {
            return (printed.clone(), cached.enhancers.clone());
        }
        cached.variable_set = bag_names;
        cached.active = active.to_vec();
    }

    let return_type = field_def.field_type.named().to_string();
    let scalar_return = !schema.is_composite(&return_type);

    let mut merged: Vec<Selection> = Vec::new();
    let mut enhancers: Vec<EnhancerEntry> = Vec::new();
    let mut namespaced_defs: Vec<VariableDefinition> = Vec::new();

    if !scalar_return {
        let caller_ids: BTreeSet<&str> = active.iter().map(|caller| caller.id.as_str()).collect();
        for id in caller_ids {
            let projected = inner.queries.get(id).and_then(|query| {
                let operation = query.document.operation().ok()?;
                let mut out = Vec::new();
                project_type_selections(
                    &operation.selection_set,
                    &schema.query_type,
                    &return_type,
                    schema,
                    &query.document.fragments,
                    &mut out,
                );
                Some((out, operation.variable_definitions.clone()))
            });
            let Some((projected, variable_defs)) = projected else {
                continue;
            };
            if projected.is_empty() {
                continue;
            }
            let cached = inner.mutations.entry(name.to_string()).or_default();
            if !cached.singles.contains_key(id) {
                let prefix = format!("c{}", cached.next_prefix);
                cached.next_prefix += 1;
                let mut variable_map = Vec::new();
                let selections = namespace_selections(&projected, &prefix, &mut variable_map);
                cached.singles.insert(
                    id.to_string(),
                    MutationSingle {
                        prefix,
                        selections,
                        variable_map,
                    },
                );
            }
            let single = &cached.singles[id];
            // aliases are caller-unique, so the union is a plain append
            merged.extend(single.selections.iter().cloned());
            for (original, namespaced) in &single.variable_map {
                enhancers.push(EnhancerEntry {
                    caller_id: id.to_string(),
                    original: original.clone(),
                    namespaced: namespaced.clone(),
                });
                if let Some(def) = variable_defs.iter().find(|def| def.name == *original) {
                    namespaced_defs.push(VariableDefinition {
                        name: namespaced.clone(),
                        var_type: def.var_type.clone(),
                        default_value: None,
                    });
                }
            }
        }
    }

    let mut variable_definitions = Vec::new();
    let mut arguments = Vec::new();
    for (arg_name, arg_def) in &field_def.args {
        if variables.contains_key(arg_name) {
            variable_definitions.push(VariableDefinition {
                name: arg_name.clone(),
                var_type: arg_def.input_type.clone(),
                default_value: None,
            });
            arguments.push(Argument {
                name: arg_name.clone(),
                value: AstValue::Variable(arg_name.clone()),
            });
        }
    }
    variable_definitions.extend(namespaced_defs);

    let document = Document::single(Operation {
        kind: OperationKind::Mutation,
        name: None,
        variable_definitions,
        selection_set: vec![Selection::Field(Field {
            alias: None,
            name: name.to_string(),
            arguments,
            selection_set: merged,
        })],
    });
    let printed = print_document(&document);

    let cached = inner.mutations.entry(name.to_string()).or_default();
    cached.full_printed = Some(printed.clone());
    cached.full_document = Some(document);
    cached.enhancers = enhancers.clone();
    (printed, enhancers)
}

/// Collect (by union) every selection subtree a query applies to the
/// target type, spreads resolved.
fn project_type_selections(
    selections: &[Selection],
    parent_type: &str,
    target: &str,
    schema: &Schema,
    fragments: &BTreeMap<String, FragmentDefinition>,
    out: &mut Vec<Selection>,
) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                let named = schema.field_named_type(parent_type, &field.name);
                if named == Some(target) {
                    let resolved = resolve_spreads(&field.selection_set, fragments);
                    crate::minimize::union_selections(out, &resolved);
                }
                if let Some(named) = named {
                    project_type_selections(
                        &field.selection_set,
                        named,
                        target,
                        schema,
                        fragments,
                        out,
                    );
                }
            }
            Selection::InlineFragment(fragment) => {
                let parent = fragment.type_condition.as_deref().unwrap_or(parent_type);
                project_type_selections(
                    &fragment.selection_set,
                    parent,
                    target,
                    schema,
                    fragments,
                    out,
                );
            }
            Selection::FragmentSpread(spread) => {
                if let Some(def) = fragments.get(&spread.name) {
                    project_type_selections(
                        &def.selection_set,
                        &def.type_condition,
                        target,
                        schema,
                        fragments,
                        out,
                    );
                }
            }
        }
    }
}

/// Inline every fragment spread so namespacing sees plain fields.
fn resolve_spreads(
    selections: &[Selection],
    fragments: &BTreeMap<String, FragmentDefinition>,
) -> Vec<Selection> {
    let mut out = Vec::new();
    for selection in selections {
        match selection {
            Selection::Field(field) => out.push(Selection::Field(Field {
                selection_set: resolve_spreads(&field.selection_set, fragments),
                ..field.clone()
            })),
            Selection::InlineFragment(fragment) => {
                out.push(Selection::InlineFragment(InlineFragment {
                    type_condition: fragment.type_condition.clone(),
                    selection_set: resolve_spreads(&fragment.selection_set, fragments),
                }));
            }
            Selection::FragmentSpread(spread) => {
                if let Some(def) = fragments.get(&spread.name) {
                    out.push(Selection::InlineFragment(InlineFragment {
                        type_condition: Some(def.type_condition.clone()),
                        selection_set: resolve_spreads(&def.selection_set, fragments),
                    }));
                }
            }
        }
    }
    out
}

/// Alias every field under a caller's prefix and rename the variables
/// its arguments reference.
fn namespace_selections(
    selections: &[Selection],
    prefix: &str,
    variable_map: &mut Vec<(String, String)>,
) -> Vec<Selection> {
    let mut out = Vec::new();
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                let arguments = field
                    .arguments
                    .iter()
                    .map(|argument| Argument {
                        name: argument.name.clone(),
                        value: namespace_value(&argument.value, prefix, variable_map),
                    })
                    .collect();
                out.push(Selection::Field(Field {
                    alias: Some(format!("{prefix}_{}", field.response_key())),
                    name: field.name.clone(),
                    arguments,
                    selection_set: namespace_selections(&field.selection_set, prefix, variable_map),
                }));
            }
            Selection::InlineFragment(fragment) => {
                out.push(Selection::InlineFragment(InlineFragment {
                    type_condition: fragment.type_condition.clone(),
                    selection_set: namespace_selections(
                        &fragment.selection_set,
                        prefix,
                        variable_map,
                    ),
                }));
            }
            // spreads were resolved before namespacing
            Selection::FragmentSpread(_) => {}
        }
    }
    out
}

fn namespace_value(
    value: &AstValue,
    prefix: &str,
    variable_map: &mut Vec<(String, String)>,
) -> AstValue {
    match value {
        AstValue::Variable(name) => {
            let namespaced = format!("{prefix}_{name}");
            if !variable_map.iter().any(|(original, _)| original == name) {
                variable_map.push((name.clone(), namespaced.clone()));
            }
            AstValue::Variable(namespaced)
        }
        AstValue::List(items) => AstValue::List(
            items
                .iter()
                .map(|item| namespace_value(item, prefix, variable_map))
                .collect(),
        ),
        AstValue::Object(fields) => AstValue::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), namespace_value(item, prefix, variable_map)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Undo one caller's aliasing: keep only the keys carrying its prefix,
/// stripped, at every level.
fn strip_prefix_value(value: &Value, prefix: &str) -> Value {
    let marker = format!("{prefix}_");
    strip_with_marker(value, &marker)
}

fn strip_with_marker(value: &Value, marker: &str) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter_map(|(key, item)| {
                    key.strip_prefix(marker)
                        .map(|stripped| (stripped.to_string(), strip_with_marker(item, marker)))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| strip_with_marker(item, marker))
                .collect(),
        ),
        other => other.clone(),
    }
}
