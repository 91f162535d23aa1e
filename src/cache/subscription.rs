//! Subscription engine: per-subscription denormalized views kept live
//! by `Add`/`Update`/`Remove` patches, folded back into the store so
//! queries over the same entities invalidate.

use std::rc::Rc;

use serde_json::Value;
use thiserror::Error;

use crate::ast::{Document, Selection};
use crate::cache::{Cache, ContractError};
use crate::store::{CacheAction, MergeMode, merge_value, shorten_entities};
use crate::walk::{CallerKey, JsonMap, NormalizedResponse, WalkContext, denormalize, normalize};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PatchError {
    /// The subscription result has several top-level fields; a patch
    /// must say which one it targets.
    #[error("subscription result has multiple roots; a patch path is required")]
    AmbiguousRoot,

    #[error("patch path {path:?} does not resolve in the subscription result")]
    BadPath { path: String },

    /// `Remove` on a list needs an identity to remove by.
    #[error("remove patch document carries no {id_field:?} to match on")]
    UnidentifiedRemove { id_field: String },
}

/// Host-side wire glue for one subscription. Started once per caller;
/// the returned hook tears the wire down again. Incoming documents
/// come back through [`Cache::apply_patch`] — message-passing at the
/// boundary, the cache stays single-owner.
pub trait SubscriptionDriver {
    fn start(&self, request: SubscriptionRequest) -> Box<dyn FnOnce()>;
}

#[derive(Clone, Debug)]
pub struct SubscriptionRequest {
    pub caller_id: String,
    pub query: String,
    pub variables: JsonMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchOp {
    Add,
    Update,
    Remove,
}

#[derive(Clone, Debug)]
pub struct SubscriptionPatch {
    pub op: PatchOp,
    pub document: Value,
    /// Dotted path inside the subscription result. Optional when the
    /// result has exactly one root field.
    pub path: Option<String>,
}

impl SubscriptionPatch {
    pub fn new(op: PatchOp, document: Value) -> Self {
        Self {
            op,
            document,
            path: None,
        }
    }

    pub fn at(op: PatchOp, document: Value, path: impl Into<String>) -> Self {
        Self {
            op,
            document,
            path: Some(path.into()),
        }
    }
}

/// The live view handed back to the application. `stamp` changes on
/// every applied patch.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionHandle {
    pub data: Value,
    pub stamp: u64,
}

#[derive(Default)]
pub struct SubscribeOptions {
    /// Defaults to the subscription source text.
    pub caller_id: Option<String>,
    pub variables: JsonMap,
}

pub(crate) struct CachedSubscription {
    source: String,
    document: Rc<Document>,
    driver: Rc<dyn SubscriptionDriver>,
    variables: JsonMap,
    data: Value,
    stamp: u64,
    unsubscribe: Option<Box<dyn FnOnce()>>,
}

impl Cache {
    /// Register a live subscription; an existing registration for the
    /// caller returns its current handle untouched.
    pub fn subscribe(
        &self,
        source_text: &str,
        driver: Rc<dyn SubscriptionDriver>,
        options: SubscribeOptions,
    ) -> crate::Result<SubscriptionHandle> {
        let caller_id = options
            .caller_id
            .unwrap_or_else(|| source_text.to_string());
        if let Some(sub) = self.inner.borrow().subscriptions.get(&caller_id) {
            return Ok(SubscriptionHandle {
                data: sub.data.clone(),
                stamp: sub.stamp,
            });
        }

        let document = self.source.document(source_text)?;
        let caller = CallerKey::new(caller_id.clone());
        let state = self.state();
        let mut variables = state
            .variables_for(&caller)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (name, value) in options.variables {
            variables.insert(name, value);
        }

        let ctx = WalkContext::new(&document, &self.schema, &self.config, variables.clone())?;
        let initial = denormalize(&ctx, &state, &caller);

        let unsubscribe = driver.start(SubscriptionRequest {
            caller_id: caller_id.clone(),
            query: source_text.to_string(),
            variables: variables.clone(),
        });
        tracing::debug!(caller = %caller_id, "subscription started");

        let stamp = self.next_stamp();
        self.inner.borrow_mut().subscriptions.insert(
            caller_id,
            CachedSubscription {
                source: source_text.to_string(),
                document,
                driver,
                variables,
                data: initial.data.clone(),
                stamp,
                unsubscribe: Some(unsubscribe),
            },
        );
        Ok(SubscriptionHandle {
            data: initial.data,
            stamp,
        })
    }

    /// Apply one incoming document to the subscription's view, fold the
    /// diff into the store, and invalidate queries over the changed
    /// entities. A bad path fails this patch only; the subscription
    /// stays alive.
    pub fn apply_patch(
        &self,
        caller_id: &str,
        patch: SubscriptionPatch,
    ) -> crate::Result<SubscriptionHandle> {
        let (document, variables, current) = {
            let inner = self.inner.borrow();
            let sub = inner
                .subscriptions
                .get(caller_id)
                .ok_or_else(|| ContractError::UnknownSubscription(caller_id.to_string()))?;
            (sub.document.clone(), sub.variables.clone(), sub.data.clone())
        };

        let path = match &patch.path {
            Some(path) => path.clone(),
            None => single_root(&document)?,
        };
        let new_data = patch_at_path(&current, &path, &patch, &self.config.id_field)?;

        let ctx = WalkContext::new(&document, &self.schema, &self.config, variables)?;
        let normalized = normalize(&new_data, &ctx);
        let state = self.state();
        let shortened = shorten_entities(&normalized.entities, &state);
        let caller = CallerKey::new(caller_id.to_string());

        let stale = {
            let mut inner = self.inner.borrow_mut();
            inner.deps.add_deps(&normalized.entities, &caller);
            let stale = inner
                .deps
                .dependents(&shortened, std::slice::from_ref(&caller));
            inner.clear_responses(&stale);
            stale
        };
        if !stale.is_empty() {
            tracing::debug!(caller = %caller_id, count = stale.len(), "patch flushed dependent callers");
        }

        self.dispatch(CacheAction::InsertQuery {
            caller: caller.clone(),
            response: Some(NormalizedResponse {
                entities: shortened,
                result: normalized.result,
            }),
            variables: None,
        });

        let stamp = self.next_stamp();
        let mut inner = self.inner.borrow_mut();
        if let Some(sub) = inner.subscriptions.get_mut(caller_id) {
            sub.data = new_data.clone();
            sub.stamp = stamp;
        }
        Ok(SubscriptionHandle {
            data: new_data,
            stamp,
        })
    }

    /// A transport-level subscription failure: recorded on the store,
    /// subscription left alive.
    pub fn subscription_error(&self, caller_id: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(caller = %caller_id, error = %message, "subscription transport error");
        self.dispatch(CacheAction::SetError { error: message });
    }

    /// Tear down the wire and drop the subscription's caches and
    /// dependency edges.
    pub fn unsubscribe(&self, caller_id: &str) -> crate::Result<()> {
        let mut sub = self
            .inner
            .borrow_mut()
            .subscriptions
            .remove(caller_id)
            .ok_or_else(|| ContractError::UnknownSubscription(caller_id.to_string()))?;
        if let Some(unsubscribe) = sub.unsubscribe.take() {
            unsubscribe();
        }
        self.inner
            .borrow_mut()
            .deps
            .remove_caller(&CallerKey::new(caller_id.to_string()));
        tracing::debug!(caller = %caller_id, "subscription stopped");
        Ok(())
    }

    /// Swap the subscription's variable bag: the wire restarts with the
    /// new bag, the bag travels through the store.
    pub fn set_subscription_variables(
        &self,
        caller_id: &str,
        variables: JsonMap,
    ) -> crate::Result<SubscriptionHandle> {
        let (source, driver) = {
            let inner = self.inner.borrow();
            let sub = inner
                .subscriptions
                .get(caller_id)
                .ok_or_else(|| ContractError::UnknownSubscription(caller_id.to_string()))?;
            (sub.source.clone(), sub.driver.clone())
        };
        self.dispatch(CacheAction::InsertQuery {
            caller: CallerKey::new(caller_id.to_string()),
            response: None,
            variables: Some(Value::Object(variables)),
        });
        self.unsubscribe(caller_id)?;
        self.subscribe(
            &source,
            driver,
            SubscribeOptions {
                caller_id: Some(caller_id.to_string()),
                variables: JsonMap::new(),
            },
        )
    }
}

/// The implicit patch target when the subscription has exactly one
/// top-level field.
fn single_root(document: &Document) -> Result<String, crate::Error> {
    let operation = document.operation()?;
    let roots: Vec<&str> = operation
        .selection_set
        .iter()
        .filter_map(|selection| match selection {
            Selection::Field(field) => Some(field.response_key()),
            _ => None,
        })
        .collect();
    match roots.as_slice() {
        [root] => Ok(root.to_string()),
        _ => Err(PatchError::AmbiguousRoot.into()),
    }
}

fn patch_at_path(
    current: &Value,
    path: &str,
    patch: &SubscriptionPatch,
    id_field: &str,
) -> Result<Value, PatchError> {
    let bad_path = || PatchError::BadPath {
        path: path.to_string(),
    };
    let mut data = current.clone();
    if !data.is_object() {
        data = Value::Object(JsonMap::new());
    }

    let segments: Vec<&str> = path.split('.').collect();
    let mut node = &mut data;
    for segment in &segments[..segments.len() - 1] {
        node = node
            .as_object_mut()
            .ok_or_else(bad_path)?
            .get_mut(*segment)
            .ok_or_else(bad_path)?;
    }
    let parent = node.as_object_mut().ok_or_else(bad_path)?;
    let leaf = *segments.last().ok_or_else(bad_path)?;

    match patch.op {
        PatchOp::Add => match parent.get_mut(leaf) {
            Some(Value::Array(items)) => items.push(patch.document.clone()),
            Some(other) => *other = patch.document.clone(),
            None => {
                parent.insert(leaf.to_string(), Value::Array(vec![patch.document.clone()]));
            }
        },
        PatchOp::Update => match parent.get_mut(leaf) {
            Some(Value::Array(items)) => {
                let id = patch.document.get(id_field);
                let target = items
                    .iter_mut()
                    .find(|item| id.is_some() && item.get(id_field) == id)
                    .ok_or_else(bad_path)?;
                merge_value(target, &patch.document, MergeMode::Mutation);
            }
            Some(target) => merge_value(target, &patch.document, MergeMode::Mutation),
            None => {
                parent.insert(leaf.to_string(), patch.document.clone());
            }
        },
        PatchOp::Remove => match parent.get_mut(leaf) {
            Some(Value::Array(items)) => {
                let id = patch
                    .document
                    .get(id_field)
                    .cloned()
                    .ok_or(PatchError::UnidentifiedRemove {
                        id_field: id_field.to_string(),
                    })?;
                items.retain(|item| item.get(id_field) != Some(&id));
            }
            Some(_) => {
                parent.remove(leaf);
            }
            None => return Err(bad_path()),
        },
    }
    Ok(data)
}
