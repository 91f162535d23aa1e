//! The `Cache` handle: query coordinator, mutation engine, and
//! subscription engine around one dependency index and one store.
//!
//! One handle per host application; construction wires in every
//! collaborator, and there is no module-level state. The handle is the
//! single owner of the in-memory caches — interior mutability is
//! `RefCell`, never borrowed across an await.

pub mod mutation;
pub mod subscription;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::ast::{Document, DocumentSource, print_document};
use crate::config::{CacheConfig, ConfigError};
use crate::deps::DependencyIndex;
use crate::minimize::minimize;
use crate::schema::Schema;
use crate::store::{
    CacheAction, CacheState, MemoryStore, MergeMode, StateStore, merge_entities, merge_value,
    shorten_entities,
};
use crate::transport::{QueryRequest, Transport, TransportError, TransportPhase};
use crate::walk::{
    CallerKey, EntityMap, JsonMap, NormalizedResponse, WalkContext, denormalize, normalize,
};

pub use mutation::{
    CachedMutation, HandlerContext, HandlerOutcome, MutateOptions, MutationHandler,
};
pub use subscription::{
    PatchError, PatchOp, SubscribeOptions, SubscriptionDriver, SubscriptionHandle,
    SubscriptionPatch, SubscriptionRequest,
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ContractError {
    #[error("mutation {0:?} is not defined by the schema")]
    UnknownMutation(String),

    /// A mutation's active set includes a caller that no longer holds a
    /// cached response — it unsubscribed while still registered.
    #[error("mutation {mutation:?} is active for caller {caller:?}, which has no cached response")]
    MissingCaller { mutation: String, caller: String },

    #[error("no cached query registered for caller {0:?}")]
    UnknownCaller(String),

    #[error("no subscription registered for caller {0:?}")]
    UnknownSubscription(String),
}

/// A supplied variable: a plain value, or one computed from the current
/// partial response (locally derived cursors and the like).
#[derive(Clone)]
pub enum VariableValue {
    Value(Value),
    Computed(Rc<dyn Fn(Option<&Value>) -> Value>),
}

impl From<Value> for VariableValue {
    fn from(value: Value) -> Self {
        VariableValue::Value(value)
    }
}

impl fmt::Debug for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Value(value) => write!(f, "Value({value})"),
            VariableValue::Computed(_) => write!(f, "Computed(..)"),
        }
    }
}

pub type VariableBag = BTreeMap<String, VariableValue>;

#[derive(Default)]
pub struct QueryOptions {
    /// Defaults to the query source text.
    pub caller_id: Option<String>,
    /// List-item identity for keyed callers.
    pub instance: Option<String>,
    /// Skip the fast path and go back to the server.
    pub force_fetch: bool,
    /// Never touch the transport, even when incomplete.
    pub local_only: bool,
    pub variables: VariableBag,
    /// Per-call transport override.
    pub transport: Option<Rc<dyn Transport>>,
    /// Handlers to register for this caller, by mutation name.
    pub mutation_handlers: Vec<(String, Rc<dyn MutationHandler>)>,
}

/// One caller's denormalized view of the store.
///
/// `stamp` is the identity of this response object: it changes whenever
/// the coordinator replaces the response, even if the data compares
/// equal, so equality-by-identity consumers observe the change.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedResponse {
    pub data: Value,
    pub is_complete: bool,
    pub first_run: bool,
    pub error: Option<String>,
    pub stamp: u64,
}

struct CachedQuery {
    source: String,
    document: Rc<Document>,
    responses: HashMap<Option<String>, CachedResponse>,
}

#[derive(Default)]
struct Pending {
    waiters: Vec<Waiter>,
}

#[derive(Clone)]
struct Waiter {
    caller: CallerKey,
    variables: JsonMap,
}

#[derive(Default)]
struct Inner {
    queries: HashMap<String, CachedQuery>,
    pending: HashMap<String, Pending>,
    deps: DependencyIndex,
    /// mutation name → caller id → handler.
    handlers: HashMap<String, BTreeMap<String, Rc<dyn MutationHandler>>>,
    mutations: HashMap<String, CachedMutation>,
    subscriptions: HashMap<String, subscription::CachedSubscription>,
}

impl Inner {
    /// A caller appearing for the first time widens what a merged
    /// mutation must cover: drop every cached merge that would now
    /// include it.
    fn invalidate_mutations_on_new_query(&mut self, caller_id: &str) {
        for (name, cached) in self.mutations.iter_mut() {
            let involved = self
                .handlers
                .get(name)
                .is_some_and(|handlers| handlers.contains_key(caller_id));
            if involved {
                cached.reset_for(caller_id);
            }
        }
    }

    fn clear_responses(&mut self, stale: &[CallerKey]) {
        for caller in stale {
            if let Some(query) = self.queries.get_mut(&caller.id) {
                query.responses.remove(&caller.instance);
            }
        }
    }
}

pub struct Cache {
    schema: Rc<Schema>,
    source: Rc<dyn DocumentSource>,
    store: RefCell<Box<dyn StateStore>>,
    transport: Rc<dyn Transport>,
    priority: Option<Rc<dyn Transport>>,
    config: CacheConfig,
    inner: RefCell<Inner>,
    stamp: Cell<u64>,
}

#[derive(Default)]
pub struct CacheBuilder {
    schema: Option<Schema>,
    source: Option<Rc<dyn DocumentSource>>,
    store: Option<Box<dyn StateStore>>,
    transport: Option<Rc<dyn Transport>>,
    priority: Option<Rc<dyn Transport>>,
    config: CacheConfig,
}

impl CacheBuilder {
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn source(mut self, source: impl DocumentSource + 'static) -> Self {
        self.source = Some(Rc::new(source));
        self
    }

    pub fn store(mut self, store: impl StateStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Rc::new(transport));
        self
    }

    /// Stands in for the default transport when present (e.g. an open
    /// websocket).
    pub fn priority_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.priority = Some(Rc::new(transport));
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Cache, ConfigError> {
        let schema = self
            .schema
            .ok_or(ConfigError::MissingCollaborator("schema"))?;
        let source = self
            .source
            .ok_or(ConfigError::MissingCollaborator("document source"))?;
        let transport = self
            .transport
            .ok_or(ConfigError::MissingCollaborator("transport"))?;
        let store = self
            .store
            .unwrap_or_else(|| Box::new(MemoryStore::new()));
        Ok(Cache {
            schema: Rc::new(schema),
            source,
            store: RefCell::new(store),
            transport,
            priority: self.priority,
            config: self.config,
            inner: RefCell::new(Inner::default()),
            stamp: Cell::new(0),
        })
    }
}

impl Cache {
    pub fn builder() -> CacheBuilder {
        CacheBuilder::default()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current store snapshot.
    pub fn state(&self) -> Rc<CacheState> {
        self.store.borrow().state()
    }

    pub(crate) fn dispatch(&self, action: CacheAction) {
        self.store.borrow_mut().dispatch(action);
    }

    fn next_stamp(&self) -> u64 {
        let next = self.stamp.get() + 1;
        self.stamp.set(next);
        next
    }

    fn pick_transport(&self, requested: Option<Rc<dyn Transport>>) -> Rc<dyn Transport> {
        requested
            .or_else(|| self.priority.clone())
            .unwrap_or_else(|| self.transport.clone())
    }

    pub fn cached_response(&self, caller: &CallerKey) -> Option<CachedResponse> {
        self.inner
            .borrow()
            .queries
            .get(&caller.id)?
            .responses
            .get(&caller.instance)
            .cloned()
    }

    /// Fast-path lookup: a cached response only counts when it belongs
    /// to this exact query source — a caller re-issuing a wider query
    /// under the same id starts cold (its skeleton still minimizes the
    /// fetch).
    fn cached_response_for(&self, caller: &CallerKey, source_text: &str) -> Option<CachedResponse> {
        let inner = self.inner.borrow();
        let query = inner.queries.get(&caller.id)?;
        if query.source != source_text {
            return None;
        }
        query.responses.get(&caller.instance).cloned()
    }

    fn install_response(&self, caller: &CallerKey, response: CachedResponse) {
        let mut inner = self.inner.borrow_mut();
        if let Some(query) = inner.queries.get_mut(&caller.id) {
            query.responses.insert(caller.instance.clone(), response);
        }
    }

    /// Stored per-caller variables overlaid with the supplied bag;
    /// computed variables see the current partial response.
    fn resolve_variables(&self, caller: &CallerKey, supplied: &VariableBag) -> JsonMap {
        let state = self.state();
        let mut out = state
            .variables_for(caller)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let current = self.cached_response(caller).map(|response| response.data);
        for (name, value) in supplied {
            let resolved = match value {
                VariableValue::Value(value) => value.clone(),
                VariableValue::Computed(compute) => compute(current.as_ref()),
            };
            out.insert(name.clone(), resolved);
        }
        out
    }

    /// Serve a caller's query: cached fast path, local denormalization,
    /// and a minimized server fetch for whatever the store cannot
    /// answer.
    pub async fn query(
        &self,
        source_text: &str,
        options: QueryOptions,
    ) -> crate::Result<CachedResponse> {
        let caller = CallerKey {
            id: options
                .caller_id
                .clone()
                .unwrap_or_else(|| source_text.to_string()),
            instance: options.instance.clone(),
        };

        if !options.force_fetch
            && let Some(cached) = self.cached_response_for(&caller, source_text)
        {
            tracing::debug!(caller = %caller.id, "serving cached response");
            return Ok(cached);
        }

        let document = self.source.document(source_text)?;

        {
            let mut inner = self.inner.borrow_mut();
            for (mutation, handler) in &options.mutation_handlers {
                inner
                    .handlers
                    .entry(mutation.clone())
                    .or_default()
                    .insert(caller.id.clone(), handler.clone());
            }
            if !inner.queries.contains_key(&caller.id) {
                inner.queries.insert(
                    caller.id.clone(),
                    CachedQuery {
                        source: source_text.to_string(),
                        document: document.clone(),
                        responses: HashMap::new(),
                    },
                );
                inner.invalidate_mutations_on_new_query(&caller.id);
            } else if inner
                .queries
                .get(&caller.id)
                .is_some_and(|query| query.source != source_text)
            {
                // same caller, new query shape: responses from the old
                // shape no longer apply, and merged mutations covering
                // this caller are stale
                if let Some(existing) = inner.queries.get_mut(&caller.id) {
                    existing.source = source_text.to_string();
                    existing.document = document.clone();
                    existing.responses.clear();
                }
                inner.invalidate_mutations_on_new_query(&caller.id);
            }
        }

        let variables = self.resolve_variables(&caller, &options.variables);
        let state = self.state();
        let ctx = WalkContext::new(&document, &self.schema, &self.config, variables.clone())?;
        let first_run = state.result_for(&caller).is_none();
        let local = denormalize(&ctx, &state, &caller);

        // subscribe the caller to the entities it will render, even
        // before the server answers
        if !first_run {
            let normalized = normalize(&local.data, &ctx);
            self.inner
                .borrow_mut()
                .deps
                .add_deps(&normalized.entities, &caller);
        }

        let response = CachedResponse {
            data: local.data,
            is_complete: local.is_complete,
            first_run,
            error: None,
            stamp: self.next_stamp(),
        };
        self.install_response(&caller, response.clone());

        if (response.is_complete && !options.force_fetch) || options.local_only {
            return Ok(response);
        }

        let transport = self.pick_transport(options.transport);
        self.query_server(transport, &document, variables, caller, options.force_fetch)
            .await
    }

    async fn query_server(
        &self,
        transport: Rc<dyn Transport>,
        document: &Rc<Document>,
        variables: JsonMap,
        caller: CallerKey,
        force_fetch: bool,
    ) -> crate::Result<CachedResponse> {
        let state = self.state();
        let ctx = WalkContext::new(document, &self.schema, &self.config, variables.clone())?;
        // a forced fetch wants authoritative data for the whole query,
        // not just the locally missing slice
        let min_doc = if force_fetch {
            Some(document.as_ref().clone())
        } else {
            minimize(&ctx, &state, &caller)
        };
        let Some(min_doc) = min_doc else {
            return self
                .cached_response(&caller)
                .ok_or_else(|| ContractError::UnknownCaller(caller.id.clone()).into());
        };
        let minimized = print_document(&min_doc);

        {
            let mut inner = self.inner.borrow_mut();
            if let Some(pending) = inner.pending.get_mut(&minimized) {
                // an identical request is in flight; ride along (or
                // drop entirely when this exact caller already waits)
                let joined = !pending.waiters.iter().any(|w| w.caller == caller);
                if joined {
                    pending.waiters.push(Waiter {
                        caller: caller.clone(),
                        variables,
                    });
                }
                tracing::debug!(caller = %caller.id, joined, "pending query hit");
                drop(inner);
                return self
                    .cached_response(&caller)
                    .ok_or_else(|| ContractError::UnknownCaller(caller.id.clone()).into());
            }
            inner.pending.insert(
                minimized.clone(),
                Pending {
                    waiters: vec![Waiter {
                        caller: caller.clone(),
                        variables: variables.clone(),
                    }],
                },
            );
        }

        tracing::debug!(caller = %caller.id, query = %minimized, "querying server");
        let outcome = transport
            .handle_query(QueryRequest {
                query: minimized.clone(),
                variables: variables.clone(),
            })
            .await;

        let payload = match outcome {
            Ok(payload) if payload.error.is_none() => payload,
            Ok(payload) => {
                let message = payload.error.unwrap_or_else(|| "server error".to_string());
                return self.fail_pending(&minimized, &caller, message);
            }
            Err(err) => return self.fail_pending(&minimized, &caller, err.message),
        };
        let data = payload.data.unwrap_or(Value::Null);

        // the store may have changed during the await: re-denormalize
        // before merging so local writes are not clobbered
        let state = self.state();
        let local = denormalize(&ctx, &state, &caller);
        let local_norm = normalize(&local.data, &ctx);
        let min_ctx = ctx.with_operation(min_doc.operation()?);
        let server_norm = normalize(&data, &min_ctx);
        let shortened = shorten_entities(&server_norm.entities, &state);

        let waiters = self
            .inner
            .borrow_mut()
            .pending
            .remove(&minimized)
            .map(|pending| pending.waiters)
            .unwrap_or_default();

        let mut full = local_norm;
        merge_entities(&mut full.entities, &server_norm.entities, MergeMode::Query);
        merge_value(&mut full.result, &server_norm.result, MergeMode::Query);

        // nothing new and every skeleton already in place: skip the write
        let need_dispatch = !shortened.is_empty()
            || waiters
                .iter()
                .any(|w| state.result_for(&w.caller) != Some(&full.result));

        {
            let mut inner = self.inner.borrow_mut();
            for waiter in &waiters {
                inner.deps.add_deps(&full.entities, &waiter.caller);
            }
            let origins: Vec<CallerKey> = waiters.iter().map(|w| w.caller.clone()).collect();
            let stale = inner.deps.dependents(&shortened, &origins);
            if !stale.is_empty() {
                tracing::debug!(count = stale.len(), "flushing dependent callers");
            }
            inner.clear_responses(&stale);
        }

        if need_dispatch {
            for (index, waiter) in waiters.iter().enumerate() {
                // entities land exactly once; later waiters carry only
                // their variables and the shared skeleton
                let entities = if index == 0 {
                    shortened.clone()
                } else {
                    EntityMap::new()
                };
                self.dispatch(CacheAction::InsertQuery {
                    caller: waiter.caller.clone(),
                    response: Some(NormalizedResponse {
                        entities,
                        result: full.result.clone(),
                    }),
                    variables: Some(Value::Object(waiter.variables.clone())),
                });
            }
        }

        // refresh every waiter from the merged store
        let state = self.state();
        let mut out = None;
        for waiter in &waiters {
            let document = self
                .inner
                .borrow()
                .queries
                .get(&waiter.caller.id)
                .map(|query| query.document.clone());
            let Some(document) = document else {
                continue;
            };
            let waiter_ctx =
                WalkContext::new(&document, &self.schema, &self.config, waiter.variables.clone())?;
            let fresh = denormalize(&waiter_ctx, &state, &waiter.caller);
            let response = CachedResponse {
                data: fresh.data,
                is_complete: fresh.is_complete,
                first_run: false,
                error: None,
                stamp: self.next_stamp(),
            };
            self.install_response(&waiter.caller, response.clone());
            if waiter.caller == caller {
                out = Some(response);
            }
        }
        out.ok_or_else(|| ContractError::UnknownCaller(caller.id.clone()).into())
    }

    /// Transport failure: the error lands on every waiting caller's
    /// response and in the store; no cache is invalidated.
    fn fail_pending(
        &self,
        minimized: &str,
        origin: &CallerKey,
        message: String,
    ) -> crate::Result<CachedResponse> {
        let waiters = self
            .inner
            .borrow_mut()
            .pending
            .remove(minimized)
            .map(|pending| pending.waiters)
            .unwrap_or_default();
        let mut out = None;
        {
            let mut inner = self.inner.borrow_mut();
            for waiter in &waiters {
                if let Some(query) = inner.queries.get_mut(&waiter.caller.id)
                    && let Some(response) = query.responses.get_mut(&waiter.caller.instance)
                {
                    response.error = Some(message.clone());
                    response.stamp = self.next_stamp();
                    if waiter.caller == *origin {
                        out = Some(response.clone());
                    }
                }
            }
        }
        tracing::warn!(error = %message, "query transport failed");
        self.dispatch(CacheAction::SetError {
            error: message.clone(),
        });
        out.ok_or_else(|| TransportError::new(TransportPhase::Query, message).into())
    }

    /// Force-fetch a caller's query again, bound to its registered
    /// source and instance.
    pub fn refetch(&self, caller: &CallerKey) -> LocalBoxFuture<'_, crate::Result<CachedResponse>> {
        let caller = caller.clone();
        Box::pin(async move {
            let source = self
                .inner
                .borrow()
                .queries
                .get(&caller.id)
                .map(|query| query.source.clone());
            let Some(source) = source else {
                return Err(ContractError::UnknownCaller(caller.id.clone()).into());
            };
            self.query(
                &source,
                QueryOptions {
                    caller_id: Some(caller.id.clone()),
                    instance: caller.instance.clone(),
                    force_fetch: true,
                    ..QueryOptions::default()
                },
            )
            .await
        })
    }

    /// Install a new variable bag for a caller and re-run its query.
    /// The bag travels through the store so the persisted layout stays
    /// authoritative.
    pub async fn set_variables(
        &self,
        caller: &CallerKey,
        variables: JsonMap,
    ) -> crate::Result<CachedResponse> {
        self.dispatch(CacheAction::InsertQuery {
            caller: caller.clone(),
            response: None,
            variables: Some(Value::Object(variables)),
        });
        self.inner
            .borrow_mut()
            .clear_responses(std::slice::from_ref(caller));
        self.refetch(caller).await
    }

    /// Drop a query caller: its cached responses, dependency edges, and
    /// handler registrations.
    pub fn forget(&self, caller_id: &str) {
        let mut inner = self.inner.borrow_mut();
        if let Some(query) = inner.queries.remove(caller_id) {
            let instances: Vec<Option<String>> = query.responses.keys().cloned().collect();
            for instance in instances {
                inner.deps.remove_caller(&CallerKey {
                    id: caller_id.to_string(),
                    instance,
                });
            }
        }
        for handlers in inner.handlers.values_mut() {
            handlers.remove(caller_id);
        }
    }
}
