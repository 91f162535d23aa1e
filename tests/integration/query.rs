//! Query coordinator scenarios: partial fills, in-flight dedupe,
//! pagination slices, and transport failure policy.

use cachet::{CallerKey, EntityKey, QueryOptions};
use futures::executor::block_on;
use futures::future;
use serde_json::json;

use crate::fixtures::{USER_FULL_Q, USER_NAME_Q, fixture, posts_source};

fn for_caller(id: &str) -> QueryOptions {
    QueryOptions {
        caller_id: Some(id.to_string()),
        ..QueryOptions::default()
    }
}

#[test]
fn partial_local_server_fills_the_rest() {
    let fx = fixture();
    fx.transport
        .push_data(json!({"user": {"id": "1", "name": "ada"}}));
    let first = block_on(fx.cache.query(USER_NAME_Q, for_caller("profile"))).unwrap();
    assert!(first.is_complete);
    assert!(first.first_run);
    assert_eq!(fx.transport.call_count(), 1);

    // widening under the same caller: the local walk serves name, the
    // server is asked for email only
    fx.transport
        .push_data(json!({"user": {"id": "1", "email": "ada@example.com"}}));
    let second = block_on(fx.cache.query(USER_FULL_Q, for_caller("profile"))).unwrap();

    assert_eq!(fx.transport.call_count(), 2);
    assert_eq!(fx.transport.call(1).query, "query { user { email id } }");
    assert!(second.is_complete);
    assert_eq!(
        second.data,
        json!({"user": {"id": "1", "name": "ada", "email": "ada@example.com"}})
    );

    // the merged store holds both fields
    let state = fx.cache.state();
    let body = state.entity(&EntityKey::new("User", "1")).unwrap();
    assert_eq!(body["name"], json!("ada"));
    assert_eq!(body["email"], json!("ada@example.com"));

    // the caller's own response survived its own merge
    assert!(fx.cache.cached_response(&CallerKey::new("profile")).is_some());
}

#[test]
fn identical_cold_queries_share_one_flight() {
    let fx = fixture();
    fx.transport
        .push_data(json!({"user": {"id": "1", "name": "ada"}}));

    let a = fx.cache.query(USER_NAME_Q, for_caller("a"));
    let b = fx.cache.query(USER_NAME_Q, for_caller("b"));
    let (a, b) = block_on(future::join(a, b));
    a.unwrap();
    b.unwrap();

    // exactly one transport invocation
    assert_eq!(fx.transport.call_count(), 1);

    // both callers were served from the single response
    let a = fx.cache.cached_response(&CallerKey::new("a")).unwrap();
    let b = fx.cache.cached_response(&CallerKey::new("b")).unwrap();
    assert!(a.is_complete);
    assert!(b.is_complete);
    assert_eq!(a.data, b.data);

    // both skeletons and variable slots were installed
    let state = fx.cache.state();
    assert!(state.result_for(&CallerKey::new("a")).is_some());
    assert!(state.result_for(&CallerKey::new("b")).is_some());
}

#[test]
fn force_fetch_joins_an_in_flight_request() {
    let fx = fixture();
    fx.transport
        .push_data(json!({"user": {"id": "1", "name": "ada"}}));

    let a = fx.cache.query(USER_NAME_Q, for_caller("a"));
    let again = fx.cache.query(
        USER_NAME_Q,
        QueryOptions {
            force_fetch: true,
            ..for_caller("a")
        },
    );
    let (a, again) = block_on(future::join(a, again));
    a.unwrap();
    again.unwrap();

    // the forced fetch rode along instead of launching a second call
    assert_eq!(fx.transport.call_count(), 1);
}

#[test]
fn pagination_fetches_only_the_missing_slice() {
    let fx = fixture();
    fx.transport.push_data(json!({"user": {"id": "1", "posts": [
        {"id": "p1", "title": "a", "cursor": "c1"},
        {"id": "p2", "title": "b", "cursor": "c2"}
    ]}}));
    let first = block_on(fx.cache.query(&posts_source(2), for_caller("feed"))).unwrap();
    assert!(first.is_complete);

    // four asked, two held: the server sees the missing slice only
    fx.transport.push_data(json!({"user": {"id": "1", "posts": [
        {"id": "p3", "title": "c", "cursor": "c3"},
        {"id": "p4", "title": "d", "cursor": "c4"}
    ]}}));
    let second = block_on(fx.cache.query(&posts_source(4), for_caller("feed"))).unwrap();

    assert_eq!(
        fx.transport.call(1).query,
        r#"query { user { posts(first: 2, after: "c2") { id title cursor } id } }"#
    );
    assert!(second.is_complete);
    let posts = second.data["user"]["posts"].as_array().unwrap();
    let ids: Vec<&str> = posts.iter().map(|p| p["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["p1", "p2", "p3", "p4"]);

    // the same ask again is now fully local
    let third = block_on(fx.cache.query(&posts_source(4), for_caller("feed"))).unwrap();
    assert_eq!(fx.transport.call_count(), 2);
    assert!(third.is_complete);
}

#[test]
fn transport_errors_attach_to_every_waiter() {
    let fx = fixture();
    fx.transport.push_error("503 from gateway");

    let a = fx.cache.query(USER_NAME_Q, for_caller("a"));
    let b = fx.cache.query(USER_NAME_Q, for_caller("b"));
    let (a, _b) = block_on(future::join(a, b));

    let a = a.unwrap();
    assert!(!a.is_complete);
    assert_eq!(a.error.as_deref(), Some("503 from gateway"));

    // the joined caller's cached response carries the error too
    let b = fx.cache.cached_response(&CallerKey::new("b")).unwrap();
    assert_eq!(b.error.as_deref(), Some("503 from gateway"));

    // the store records it; nothing was invalidated
    let state = fx.cache.state();
    assert_eq!(state.error.as_deref(), Some("503 from gateway"));

    // a retry without force_fetch serves the stale response
    let retry = block_on(fx.cache.query(USER_NAME_Q, for_caller("a"))).unwrap();
    assert_eq!(fx.transport.call_count(), 1);
    assert_eq!(retry.error.as_deref(), Some("503 from gateway"));
}

#[test]
fn local_only_never_touches_the_transport() {
    let fx = fixture();
    let response = block_on(fx.cache.query(
        USER_NAME_Q,
        QueryOptions {
            local_only: true,
            ..for_caller("offline")
        },
    ))
    .unwrap();
    assert!(!response.is_complete);
    assert!(response.first_run);
    assert_eq!(fx.transport.call_count(), 0);
}

#[test]
fn set_variables_travels_through_the_store() {
    let fx = fixture();
    fx.transport
        .push_data(json!({"user": {"id": "1", "name": "ada"}}));
    block_on(fx.cache.query(USER_NAME_Q, for_caller("profile"))).unwrap();

    fx.transport
        .push_data(json!({"user": {"id": "1", "name": "ada"}}));
    let mut bag = cachet::JsonMap::new();
    bag.insert("lang".to_string(), json!("en"));
    block_on(fx.cache.set_variables(&CallerKey::new("profile"), bag)).unwrap();

    let state = fx.cache.state();
    assert_eq!(
        state.variables_for(&CallerKey::new("profile")),
        Some(&json!({"lang": "en"}))
    );
    // the refetch hit the server again
    assert_eq!(fx.transport.call_count(), 2);
    assert!(fx.action_log().contains(&"@@cachet/INSERT_QUERY"));
}
