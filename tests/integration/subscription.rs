//! Subscription engine scenarios: patch application, cascade into
//! query callers, teardown, and the error event.

use std::rc::Rc;

use cachet::{CallerKey, PatchOp, QueryOptions, SubscribeOptions, SubscriptionPatch};
use futures::executor::block_on;
use serde_json::json;

use crate::fixtures::{ACTIVE_POST_S, FakeDriver, POST7_Q, fixture};

fn for_caller(id: &str) -> QueryOptions {
    QueryOptions {
        caller_id: Some(id.to_string()),
        ..QueryOptions::default()
    }
}

#[test]
fn update_patch_cascades_into_query_callers() {
    let fx = fixture();

    // a query caller comes to depend on Post:7
    fx.transport
        .push_data(json!({"post": {"id": "7", "title": "original"}}));
    let reader = block_on(fx.cache.query(POST7_Q, for_caller("reader"))).unwrap();
    assert!(reader.is_complete);

    let driver = Rc::new(FakeDriver::default());
    let handle = fx
        .cache
        .subscribe(ACTIVE_POST_S, driver.clone(), SubscribeOptions::default())
        .unwrap();
    assert_eq!(driver.started.borrow().len(), 1);

    // a live update for the same entity arrives
    let updated = fx
        .cache
        .apply_patch(
            ACTIVE_POST_S,
            SubscriptionPatch::new(PatchOp::Update, json!({"id": "7", "title": "updated"})),
        )
        .unwrap();
    assert_eq!(
        updated.data,
        json!({"activePost": {"id": "7", "title": "updated"}})
    );
    assert!(updated.stamp > handle.stamp);

    // the reader's cached view was flushed...
    assert!(fx.cache.cached_response(&CallerKey::new("reader")).is_none());

    // ...and its next read re-denormalizes locally, no server call
    let fresh = block_on(fx.cache.query(POST7_Q, for_caller("reader"))).unwrap();
    assert_eq!(fx.transport.call_count(), 1);
    assert!(fresh.is_complete);
    assert_eq!(fresh.data["post"]["title"], json!("updated"));
}

#[test]
fn add_and_remove_reshape_the_view() {
    let fx = fixture();
    let driver = Rc::new(FakeDriver::default());
    fx.cache
        .subscribe(ACTIVE_POST_S, driver, SubscribeOptions::default())
        .unwrap();

    let added = fx
        .cache
        .apply_patch(
            ACTIVE_POST_S,
            SubscriptionPatch::new(PatchOp::Update, json!({"id": "9", "title": "live"})),
        )
        .unwrap();
    assert_eq!(added.data["activePost"]["id"], json!("9"));

    // the patched entity landed in the store
    let state = fx.cache.state();
    assert_eq!(
        state
            .entity(&cachet::EntityKey::new("Post", "9"))
            .unwrap()["title"],
        json!("live")
    );

    let removed = fx
        .cache
        .apply_patch(
            ACTIVE_POST_S,
            SubscriptionPatch::new(PatchOp::Remove, json!({"id": "9"})),
        )
        .unwrap();
    assert_eq!(removed.data, json!({}));
}

#[test]
fn duplicate_subscribe_returns_the_cached_handle() {
    let fx = fixture();
    let driver = Rc::new(FakeDriver::default());
    let first = fx
        .cache
        .subscribe(ACTIVE_POST_S, driver.clone(), SubscribeOptions::default())
        .unwrap();
    let second = fx
        .cache
        .subscribe(ACTIVE_POST_S, driver.clone(), SubscribeOptions::default())
        .unwrap();
    assert_eq!(first, second);
    // the wire was only opened once
    assert_eq!(driver.started.borrow().len(), 1);
}

#[test]
fn unsubscribe_tears_down_the_wire() {
    let fx = fixture();
    let driver = Rc::new(FakeDriver::default());
    fx.cache
        .subscribe(ACTIVE_POST_S, driver.clone(), SubscribeOptions::default())
        .unwrap();

    fx.cache.unsubscribe(ACTIVE_POST_S).unwrap();
    assert_eq!(driver.stopped.get(), 1);

    // patches for the dead subscription are contract violations
    let err = fx
        .cache
        .apply_patch(
            ACTIVE_POST_S,
            SubscriptionPatch::new(PatchOp::Update, json!({"id": "7"})),
        )
        .unwrap_err();
    assert!(matches!(err, cachet::Error::Contract(_)));
}

#[test]
fn errors_keep_the_subscription_alive() {
    let fx = fixture();
    let driver = Rc::new(FakeDriver::default());
    fx.cache
        .subscribe(ACTIVE_POST_S, driver.clone(), SubscribeOptions::default())
        .unwrap();

    fx.cache.subscription_error(ACTIVE_POST_S, "socket hiccup");
    assert_eq!(fx.cache.state().error.as_deref(), Some("socket hiccup"));

    // the wire is still up and patches still apply
    assert_eq!(driver.stopped.get(), 0);
    let handle = fx
        .cache
        .apply_patch(
            ACTIVE_POST_S,
            SubscriptionPatch::new(PatchOp::Update, json!({"id": "7", "title": "still here"})),
        )
        .unwrap();
    assert_eq!(handle.data["activePost"]["title"], json!("still here"));
    // applying the patch cleared the error again
    assert!(fx.cache.state().error.is_none());
}
