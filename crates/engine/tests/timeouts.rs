//! Bounded retrieval: a local timeout abandons the wait, never the stage.

mod support;

use std::time::Duration;

use rill_engine::{Continuation, HandlerRegistry};
use rill_types::RetrievalError;

#[tokio::test]
async fn get_within_times_out_without_cancelling_the_stage() {
    let mut registry = HandlerRegistry::new();
    registry.function("late-val", |_: (), _: ()| Ok(99i64)).expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let timer = flow.delay(Duration::from_millis(300)).await.expect("timer");
    let value = flow
        .then_apply::<(), i64>(&timer, Continuation::stateless("late-val"))
        .await
        .expect("apply");

    let err = flow.get_within(&value, Duration::from_millis(30)).await.unwrap_err();
    assert!(matches!(err, RetrievalError::WaitTimeout(d) if d == Duration::from_millis(30)));

    // The stage kept running remotely; a later unbounded wait observes the
    // real outcome.
    assert_eq!(flow.get(&value).await.expect("value"), 99);
}

#[tokio::test]
async fn get_within_returns_the_value_when_it_is_already_there() {
    let harness = support::harness(HandlerRegistry::new());
    let flow = harness.flow().await;

    let stage = flow.completed_value(&7i64).await.expect("value");
    let value: i64 = flow.get_within(&stage, Duration::from_millis(50)).await.expect("value");
    assert_eq!(value, 7);
}

#[tokio::test]
async fn get_within_surfaces_failures_as_completed_errors() {
    let harness = support::harness(HandlerRegistry::new());
    let flow = harness.flow().await;

    let stage = flow
        .failed::<i64>(rill_types::WrappedError::new("tests::Boom", "x"))
        .await
        .expect("failed");
    let err = flow.get_within(&stage, Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, RetrievalError::Completed(_)));
}

#[tokio::test]
async fn get_now_falls_back_while_the_stage_is_pending() {
    let mut registry = HandlerRegistry::new();
    registry.function("late-val", |_: (), _: ()| Ok(5i64)).expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let timer = flow.delay(Duration::from_secs(20)).await.expect("timer");
    let pending = flow
        .then_apply::<(), i64>(&timer, Continuation::stateless("late-val"))
        .await
        .expect("apply");
    assert_eq!(flow.get_now(&pending, -1i64).await.expect("fallback"), -1);

    let done = flow.completed_value(&3i64).await.expect("value");
    assert_eq!(flow.get_now(&done, 0i64).await.expect("value"), 3);
}

#[tokio::test]
async fn delay_resolves_after_the_requested_duration() {
    let harness = support::harness(HandlerRegistry::new());
    let flow = harness.flow().await;

    let started = std::time::Instant::now();
    let timer = flow.delay(Duration::from_millis(120)).await.expect("timer");
    flow.get::<()>(&timer).await.expect("empty");
    assert!(started.elapsed() >= Duration::from_millis(120));
}
