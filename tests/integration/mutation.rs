//! Mutation engine scenarios: projection onto affected callers,
//! optimistic state, invalidate-and-refetch, and failure policy.

use std::cell::Cell;
use std::rc::Rc;

use cachet::{
    CallerKey, Effect, EntityKey, HandlerContext, HandlerOutcome, JsonMap, MutateOptions,
    MutationHandler, QueryOptions,
};
use futures::executor::block_on;
use serde_json::{Value, json};

use crate::fixtures::{USER_NAME_Q, fixture, posts_source};

fn for_caller(id: &str) -> QueryOptions {
    QueryOptions {
        caller_id: Some(id.to_string()),
        ..QueryOptions::default()
    }
}

fn rename_variables(id: &str, name: &str) -> JsonMap {
    let mut variables = JsonMap::new();
    variables.insert("id".to_string(), json!(id));
    variables.insert("name".to_string(), json!(name));
    variables
}

fn fold_title(current: &Value, id: &Value, title: &Value) -> Value {
    let mut data = current.clone();
    if let Some(posts) = data["user"]["posts"].as_array_mut() {
        for post in posts.iter_mut() {
            if post["id"] == *id {
                post["title"] = title.clone();
            }
        }
    }
    data
}

/// Applies the authoritative title to the matching post in place.
struct FoldRename {
    authoritative_calls: Rc<Cell<usize>>,
}

impl MutationHandler for FoldRename {
    fn authoritative(
        &self,
        server_doc: &Value,
        current: &Value,
        _ctx: &HandlerContext<'_>,
    ) -> HandlerOutcome {
        self.authoritative_calls
            .set(self.authoritative_calls.get() + 1);
        HandlerOutcome::Replace(fold_title(current, &server_doc["id"], &server_doc["title"]))
    }
}

/// Guesses the rename optimistically, then folds the server's answer.
struct GuessRename;

impl MutationHandler for GuessRename {
    fn optimistic(
        &self,
        variables: &JsonMap,
        current: &Value,
        _ctx: &HandlerContext<'_>,
    ) -> HandlerOutcome {
        let id = variables.get("id").cloned().unwrap_or(Value::Null);
        let name = variables.get("name").cloned().unwrap_or(Value::Null);
        HandlerOutcome::Replace(fold_title(current, &id, &name))
    }

    fn authoritative(
        &self,
        server_doc: &Value,
        current: &Value,
        _ctx: &HandlerContext<'_>,
    ) -> HandlerOutcome {
        HandlerOutcome::Replace(fold_title(current, &server_doc["id"], &server_doc["title"]))
    }
}

/// Cannot patch its view locally; asks for a refetch.
struct InvalidateOnServer;

impl MutationHandler for InvalidateOnServer {
    fn authoritative(
        &self,
        _server_doc: &Value,
        _current: &Value,
        _ctx: &HandlerContext<'_>,
    ) -> HandlerOutcome {
        HandlerOutcome::Invalidate
    }
}

fn posts_data(first_title: &str) -> Value {
    json!({"user": {"id": "1", "posts": [
        {"id": "p1", "title": first_title, "cursor": "c1"},
        {"id": "p2", "title": "b", "cursor": "c2"}
    ]}})
}

#[test]
fn merged_mutation_covers_only_handler_callers() {
    let fx = fixture();
    let calls = Rc::new(Cell::new(0));

    fx.transport.push_data(posts_data("a"));
    block_on(fx.cache.query(
        &posts_source(2),
        QueryOptions {
            mutation_handlers: vec![(
                "renamePost".to_string(),
                Rc::new(FoldRename {
                    authoritative_calls: calls.clone(),
                }),
            )],
            ..for_caller("feed")
        },
    ))
    .unwrap();

    fx.transport
        .push_data(json!({"user": {"id": "1", "name": "ada"}}));
    block_on(fx.cache.query(USER_NAME_Q, for_caller("who"))).unwrap();
    let who_before = fx.cache.cached_response(&CallerKey::new("who")).unwrap();

    fx.transport.push_data(json!({"renamePost": {
        "c0_id": "p1", "c0_title": "renamed", "c0_cursor": "c1"
    }}));
    block_on(fx.cache.mutate(
        "renamePost",
        MutateOptions {
            variables: rename_variables("p1", "renamed"),
            ..MutateOptions::default()
        },
    ))
    .unwrap();

    // the merged document carries feed's projection and nothing of who
    assert_eq!(
        fx.transport.call(2).query,
        "mutation($id: ID!, $name: String) { renamePost(id: $id, name: $name) \
         { c0_id: id c0_title: title c0_cursor: cursor } }"
    );
    assert_eq!(fx.transport.call(2).variables, rename_variables("p1", "renamed"));
    assert_eq!(calls.get(), 1);

    // only the post entity was merged
    let state = fx.cache.state();
    assert_eq!(
        state.entity(&EntityKey::new("Post", "p1")).unwrap()["title"],
        json!("renamed")
    );

    // who's dependencies do not intersect the change: untouched
    let who_after = fx.cache.cached_response(&CallerKey::new("who")).unwrap();
    assert_eq!(who_before.stamp, who_after.stamp);

    // feed's response was replaced with a fresh stamp
    let feed = fx.cache.cached_response(&CallerKey::new("feed")).unwrap();
    assert_eq!(feed.data["user"]["posts"][0]["title"], json!("renamed"));
    assert_eq!(
        fx.action_log()
            .iter()
            .filter(|kind| **kind == "@@cachet/INSERT_MUTATION")
            .count(),
        1
    );
}

#[test]
fn invalidate_refetches_and_skips_the_local_merge() {
    let fx = fixture();
    let calls = Rc::new(Cell::new(0));

    fx.transport.push_data(posts_data("a"));
    block_on(fx.cache.query(
        &posts_source(2),
        QueryOptions {
            mutation_handlers: vec![("renamePost".to_string(), Rc::new(InvalidateOnServer))],
            ..for_caller("feed")
        },
    ))
    .unwrap();

    fx.transport.push_data(posts_data("a"));
    block_on(fx.cache.query(
        &posts_source(2),
        QueryOptions {
            mutation_handlers: vec![(
                "renamePost".to_string(),
                Rc::new(FoldRename {
                    authoritative_calls: calls.clone(),
                }),
            )],
            ..for_caller("grid")
        },
    ))
    .unwrap();

    // prefixes are assigned in caller order: feed → c0, grid → c1
    fx.transport.push_data(json!({"renamePost": {
        "c0_id": "p1", "c0_title": "renamed", "c0_cursor": "c1",
        "c1_id": "p1", "c1_title": "renamed", "c1_cursor": "c1"
    }}));
    // feed's refetch goes back to the server in full
    fx.transport.push_data(posts_data("renamed"));

    block_on(fx.cache.mutate(
        "renamePost",
        MutateOptions {
            variables: rename_variables("p1", "renamed"),
            ..MutateOptions::default()
        },
    ))
    .unwrap();

    assert_eq!(fx.transport.call_count(), 4);
    assert_eq!(
        fx.transport.call(3).query,
        "query { user { id posts(first: 2) { id title cursor } } }"
    );

    // grid merged locally, feed came back via refetch; both are fresh
    let grid = fx.cache.cached_response(&CallerKey::new("grid")).unwrap();
    assert_eq!(grid.data["user"]["posts"][0]["title"], json!("renamed"));
    let feed = fx.cache.cached_response(&CallerKey::new("feed")).unwrap();
    assert_eq!(feed.data["user"]["posts"][0]["title"], json!("renamed"));
    assert_eq!(calls.get(), 1);

    // exactly one mutation merge: grid's — the invalidated caller
    // contributed nothing
    assert_eq!(
        fx.action_log()
            .iter()
            .filter(|kind| **kind == "@@cachet/INSERT_MUTATION")
            .count(),
        1
    );
}

#[test]
fn optimistic_state_survives_a_failing_server() {
    let fx = fixture();

    fx.transport.push_data(posts_data("a"));
    block_on(fx.cache.query(
        &posts_source(2),
        QueryOptions {
            mutation_handlers: vec![("renamePost".to_string(), Rc::new(GuessRename))],
            ..for_caller("feed")
        },
    ))
    .unwrap();

    fx.transport.push_error("mutation rejected");
    let err = block_on(fx.cache.mutate(
        "renamePost",
        MutateOptions {
            variables: rename_variables("p1", "guess"),
            ..MutateOptions::default()
        },
    ))
    .unwrap_err();

    assert!(matches!(err, cachet::Error::Transport(_)));
    assert_eq!(err.effect(), Effect::Some);
    assert!(err.transience().is_retryable());

    // the optimistic guess stays in place; reverting is the app's call
    let state = fx.cache.state();
    assert_eq!(
        state.entity(&EntityKey::new("Post", "p1")).unwrap()["title"],
        json!("guess")
    );
    assert_eq!(state.error.as_deref(), Some("mutation rejected"));
}

#[test]
fn scalar_mutations_need_no_selection() {
    let fx = fixture();
    fx.transport.push_data(json!({"ping": true}));
    block_on(fx.cache.mutate("ping", MutateOptions::default())).unwrap();
    assert_eq!(fx.transport.call(0).query, "mutation { ping }");
}

#[test]
fn unknown_mutations_fail_loudly() {
    let fx = fixture();
    let err = block_on(fx.cache.mutate("vanish", MutateOptions::default())).unwrap_err();
    assert!(matches!(err, cachet::Error::Contract(_)));
    assert_eq!(fx.transport.call_count(), 0);
}
