//! Shared fixtures: a small blog schema, pre-parsed documents, and
//! fake collaborators with call recording.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use cachet::{
    Argument, AstValue, Cache, Document, Field, MemoryStore, Operation, OperationKind,
    QueryRequest, ResponsePayload, Schema, Selection, StateStore, StaticSource,
    SubscriptionDriver, SubscriptionRequest, Transport, TransportError, TransportPhase,
};
use futures::future::LocalBoxFuture;
use serde_json::{Value, json};

pub const USER_NAME_Q: &str = "query { user { id name } }";
pub const USER_FULL_Q: &str = "query { user { id name email } }";
pub const POST7_Q: &str = r#"query { post(id: "7") { id title } }"#;
pub const ACTIVE_POST_S: &str = "subscription { activePost { id title } }";

pub fn posts_source(first: i64) -> String {
    format!("query {{ user {{ id posts(first: {first}) {{ id title cursor }} }} }}")
}

pub fn schema() -> Schema {
    serde_json::from_value(json!({
        "query_type": "Query",
        "mutation_type": "Mutation",
        "subscription_type": "Subscription",
        "types": {
            "Query": {
                "name": "Query",
                "kind": "object",
                "fields": {
                    "user": {"name": "user", "field_type": {"Named": "User"}},
                    "post": {
                        "name": "post",
                        "field_type": {"Named": "Post"},
                        "args": {"id": {"name": "id", "input_type": {"NonNull": {"Named": "ID"}}}}
                    }
                }
            },
            "Mutation": {
                "name": "Mutation",
                "kind": "object",
                "fields": {
                    "renamePost": {
                        "name": "renamePost",
                        "field_type": {"Named": "Post"},
                        "args": {
                            "id": {"name": "id", "input_type": {"NonNull": {"Named": "ID"}}},
                            "name": {"name": "name", "input_type": {"Named": "String"}}
                        }
                    },
                    "ping": {
                        "name": "ping",
                        "field_type": {"Named": "Boolean"}
                    }
                }
            },
            "Subscription": {
                "name": "Subscription",
                "kind": "object",
                "fields": {
                    "activePost": {"name": "activePost", "field_type": {"Named": "Post"}}
                }
            },
            "User": {
                "name": "User",
                "kind": "object",
                "fields": {
                    "id": {"name": "id", "field_type": {"NonNull": {"Named": "ID"}}},
                    "name": {"name": "name", "field_type": {"Named": "String"}},
                    "email": {"name": "email", "field_type": {"Named": "String"}},
                    "posts": {
                        "name": "posts",
                        "field_type": {"List": {"Named": "Post"}},
                        "args": {
                            "first": {"name": "first", "input_type": {"Named": "Int"}},
                            "after": {"name": "after", "input_type": {"Named": "String"}}
                        }
                    }
                }
            },
            "Post": {
                "name": "Post",
                "kind": "object",
                "fields": {
                    "id": {"name": "id", "field_type": {"NonNull": {"Named": "ID"}}},
                    "title": {"name": "title", "field_type": {"Named": "String"}},
                    "cursor": {"name": "cursor", "field_type": {"Named": "String"}}
                }
            },
            "ID": {"name": "ID", "kind": "scalar"},
            "Int": {"name": "Int", "kind": "scalar"},
            "String": {"name": "String", "kind": "scalar"},
            "Boolean": {"name": "Boolean", "kind": "scalar"}
        }
    }))
    .expect("schema fixture")
}

pub fn leaf(name: &str) -> Selection {
    Selection::Field(Field::new(name))
}

pub fn obj(name: &str, selections: Vec<Selection>) -> Selection {
    Selection::Field(Field {
        selection_set: selections,
        ..Field::new(name)
    })
}

pub fn arg_field(name: &str, args: Vec<(&str, AstValue)>, selections: Vec<Selection>) -> Selection {
    Selection::Field(Field {
        arguments: args
            .into_iter()
            .map(|(name, value)| Argument {
                name: name.to_string(),
                value,
            })
            .collect(),
        selection_set: selections,
        ..Field::new(name)
    })
}

pub fn operation(kind: OperationKind, selections: Vec<Selection>) -> Document {
    Document::single(Operation {
        kind,
        name: None,
        variable_definitions: Vec::new(),
        selection_set: selections,
    })
}

fn documents() -> StaticSource {
    let mut source = StaticSource::new();
    source.register(
        USER_NAME_Q,
        operation(
            OperationKind::Query,
            vec![obj("user", vec![leaf("id"), leaf("name")])],
        ),
    );
    source.register(
        USER_FULL_Q,
        operation(
            OperationKind::Query,
            vec![obj("user", vec![leaf("id"), leaf("name"), leaf("email")])],
        ),
    );
    for first in [2i64, 4] {
        source.register(
            posts_source(first),
            operation(
                OperationKind::Query,
                vec![obj(
                    "user",
                    vec![
                        leaf("id"),
                        arg_field(
                            "posts",
                            vec![("first", AstValue::Int(first))],
                            vec![leaf("id"), leaf("title"), leaf("cursor")],
                        ),
                    ],
                )],
            ),
        );
    }
    source.register(
        POST7_Q,
        operation(
            OperationKind::Query,
            vec![arg_field(
                "post",
                vec![("id", AstValue::String("7".into()))],
                vec![leaf("id"), leaf("title")],
            )],
        ),
    );
    source.register(
        ACTIVE_POST_S,
        operation(
            OperationKind::Subscription,
            vec![obj("activePost", vec![leaf("id"), leaf("title")])],
        ),
    );
    source
}

/// Yields once so a second caller can observe the in-flight request
/// before the response lands.
#[derive(Default)]
struct YieldOnce {
    yielded: bool,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            Poll::Ready(())
        } else {
            this.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Queue-driven transport with call recording.
pub struct FakeTransport {
    calls: Rc<RefCell<Vec<QueryRequest>>>,
    responses: Rc<RefCell<VecDeque<Result<ResponsePayload, TransportError>>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            calls: Rc::new(RefCell::new(Vec::new())),
            responses: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// A second handle over the same queues; one side moves into the
    /// cache, the other stays with the test.
    pub fn handle(&self) -> FakeTransport {
        FakeTransport {
            calls: self.calls.clone(),
            responses: self.responses.clone(),
        }
    }

    pub fn push_data(&self, data: Value) {
        self.responses
            .borrow_mut()
            .push_back(Ok(ResponsePayload::data(data)));
    }

    pub fn push_error(&self, message: &str) {
        self.responses
            .borrow_mut()
            .push_back(Err(TransportError::new(TransportPhase::Query, message)));
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn call(&self, index: usize) -> QueryRequest {
        self.calls.borrow()[index].clone()
    }
}

impl Transport for FakeTransport {
    fn handle_query(
        &self,
        request: QueryRequest,
    ) -> LocalBoxFuture<'_, Result<ResponsePayload, TransportError>> {
        self.calls.borrow_mut().push(request);
        let response = self
            .responses
            .borrow_mut()
            .pop_front()
            .expect("unexpected transport call");
        Box::pin(async move {
            YieldOnce::default().await;
            response
        })
    }
}

/// Host-container stand-in: the cache owns one handle, the test keeps
/// the other to inspect state and the dispatch log.
pub struct SharedStore {
    inner: Rc<RefCell<MemoryStore>>,
}

impl StateStore for SharedStore {
    fn dispatch(&mut self, action: cachet::CacheAction) {
        self.inner.borrow_mut().dispatch(action);
    }

    fn state(&self) -> Rc<cachet::CacheState> {
        self.inner.borrow().state()
    }
}

#[derive(Default)]
pub struct FakeDriver {
    pub started: Rc<RefCell<Vec<SubscriptionRequest>>>,
    pub stopped: Rc<Cell<usize>>,
}

impl SubscriptionDriver for FakeDriver {
    fn start(&self, request: SubscriptionRequest) -> Box<dyn FnOnce()> {
        self.started.borrow_mut().push(request);
        let stopped = self.stopped.clone();
        Box::new(move || stopped.set(stopped.get() + 1))
    }
}

pub struct Fixture {
    pub cache: Cache,
    pub transport: FakeTransport,
    pub store: Rc<RefCell<MemoryStore>>,
}

pub fn fixture() -> Fixture {
    let transport = FakeTransport::new();
    let handle = transport.handle();
    let store = Rc::new(RefCell::new(MemoryStore::new()));
    let cache = Cache::builder()
        .schema(schema())
        .source(documents())
        .transport(transport)
        .store(SharedStore {
            inner: store.clone(),
        })
        .build()
        .expect("cache fixture");
    Fixture {
        cache,
        transport: handle,
        store,
    }
}

impl Fixture {
    pub fn action_log(&self) -> Vec<&'static str> {
        self.store.borrow().log.clone()
    }
}
