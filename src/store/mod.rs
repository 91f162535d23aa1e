//! Normalized store model and its pure reducer.
//!
//! The store is logically owned by the host's state container; the
//! cache reads it through [`StateStore::state`] and changes it only by
//! dispatching one of the three [`CacheAction`] kinds. `MemoryStore` is
//! the reducer-backed default for hosts without their own container.

pub mod merge;

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::walk::{CallerKey, EntityKey, EntityMap, JsonMap, NormalizedResponse};

pub use merge::{MergeMode, merge_entities, merge_object, merge_value, shorten_entities};

/// Persisted cache slice: `{ error, data: { entities, result, variables } }`
/// flattened one level — the host decides where it hangs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheState {
    /// `typeName → idValue → entity body`.
    pub entities: EntityMap,
    /// Per-caller result skeletons, instance-keyed where the caller is.
    pub result: BTreeMap<String, Value>,
    /// Per-caller variable bags, instance-keyed where the caller is.
    pub variables: BTreeMap<String, Value>,
    /// Last transport error, if any.
    pub error: Option<String>,
}

impl CacheState {
    pub fn entity(&self, key: &EntityKey) -> Option<&JsonMap> {
        self.entities.get(&key.type_name)?.get(&key.id)
    }

    pub fn result_for(&self, caller: &CallerKey) -> Option<&Value> {
        caller_slot(&self.result, caller)
    }

    pub fn variables_for(&self, caller: &CallerKey) -> Option<&Value> {
        caller_slot(&self.variables, caller)
    }
}

fn caller_slot<'a>(map: &'a BTreeMap<String, Value>, caller: &CallerKey) -> Option<&'a Value> {
    let node = map.get(&caller.id)?;
    match &caller.instance {
        None => Some(node),
        Some(instance) => node.get(instance),
    }
}

/// The three dispatched action kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CacheAction {
    /// Merge a normalized query response. A `response` of `None` is a
    /// variables-only dispatch for a caller that joined an in-flight
    /// request.
    InsertQuery {
        caller: CallerKey,
        response: Option<NormalizedResponse>,
        variables: Option<Value>,
    },
    /// Merge a mutation's accumulated diff: incoming arrays are
    /// authoritative even for lists queries populated.
    InsertMutation {
        entities: EntityMap,
        results: Vec<(CallerKey, Value)>,
        variables: Vec<(CallerKey, Value)>,
    },
    /// Record a transport error without touching data.
    SetError { error: String },
}

impl CacheAction {
    /// Namespaced literal for host devtools; stable across versions.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheAction::InsertQuery { .. } => "@@cachet/INSERT_QUERY",
            CacheAction::InsertMutation { .. } => "@@cachet/INSERT_MUTATION",
            CacheAction::SetError { .. } => "@@cachet/SET_ERROR",
        }
    }
}

/// Pure reducer; every non-pure concern lives in the coordinator.
pub fn reduce(state: &CacheState, action: &CacheAction) -> CacheState {
    let mut next = state.clone();
    match action {
        CacheAction::InsertQuery {
            caller,
            response,
            variables,
        } => {
            if let Some(response) = response {
                merge_entities(&mut next.entities, &response.entities, MergeMode::Query);
                install_merged(&mut next.result, caller, &response.result, MergeMode::Query);
            }
            if let Some(variables) = variables {
                install(&mut next.variables, caller, variables.clone());
            }
            next.error = None;
        }
        CacheAction::InsertMutation {
            entities,
            results,
            variables,
        } => {
            merge_entities(&mut next.entities, entities, MergeMode::Mutation);
            for (caller, skeleton) in results {
                install_merged(&mut next.result, caller, skeleton, MergeMode::Mutation);
            }
            for (caller, bag) in variables {
                install(&mut next.variables, caller, bag.clone());
            }
            next.error = None;
        }
        CacheAction::SetError { error } => {
            next.error = Some(error.clone());
        }
    }
    next
}

fn install(map: &mut BTreeMap<String, Value>, caller: &CallerKey, value: Value) {
    match &caller.instance {
        None => {
            map.insert(caller.id.clone(), value);
        }
        Some(instance) => {
            let entry = map
                .entry(caller.id.clone())
                .or_insert_with(|| Value::Object(JsonMap::new()));
            if !entry.is_object() {
                *entry = Value::Object(JsonMap::new());
            }
            if let Some(obj) = entry.as_object_mut() {
                obj.insert(instance.clone(), value);
            }
        }
    }
}

fn install_merged(
    map: &mut BTreeMap<String, Value>,
    caller: &CallerKey,
    value: &Value,
    mode: MergeMode,
) {
    match &caller.instance {
        None => match map.get_mut(&caller.id) {
            Some(existing) => merge_value(existing, value, mode),
            None => {
                map.insert(caller.id.clone(), value.clone());
            }
        },
        Some(instance) => {
            let entry = map
                .entry(caller.id.clone())
                .or_insert_with(|| Value::Object(JsonMap::new()));
            if !entry.is_object() {
                *entry = Value::Object(JsonMap::new());
            }
            if let Some(obj) = entry.as_object_mut() {
                match obj.get_mut(instance) {
                    Some(existing) => merge_value(existing, value, mode),
                    None => {
                        obj.insert(instance.clone(), value.clone());
                    }
                }
            }
        }
    }
}

/// Host-side observable state container.
///
/// `dispatch` applies an action; `state` hands back the current slice.
/// Hosts embedding the slice in a larger container implement this over
/// their own dispatch loop (the selector the original exposed as
/// `getToState` lives inside that implementation).
pub trait StateStore {
    fn dispatch(&mut self, action: CacheAction);
    fn state(&self) -> Rc<CacheState>;
}

/// Reducer-backed default container.
#[derive(Default)]
pub struct MemoryStore {
    state: Rc<CacheState>,
    /// Action kinds applied, newest last. Handy for host devtools.
    pub log: Vec<&'static str>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn dispatch(&mut self, action: CacheAction) {
        self.log.push(action.kind());
        self.state = Rc::new(reduce(&self.state, &action));
    }

    fn state(&self) -> Rc<CacheState> {
        self.state.clone()
    }
}
