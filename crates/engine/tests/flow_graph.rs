//! Value combinators end to end: already-resolved stages, chained
//! transformations, composition, and error recovery.

mod support;

use rill_engine::{Continuation, HandlerRegistry};
use rill_types::{FlowError, WrappedError};

#[tokio::test]
async fn completed_value_round_trips() {
    let harness = support::harness(HandlerRegistry::new());
    let flow = harness.flow().await;

    let stage = flow.completed_value(&"hello".to_string()).await.expect("stage");
    let value: String = flow.get(&stage).await.expect("value");
    assert_eq!(value, "hello");
}

#[tokio::test]
async fn then_apply_chains_transformations_in_order() {
    let mut registry = HandlerRegistry::new();
    registry.function("double", |_: (), x: i64| Ok(x * 2)).expect("register");
    registry.function("add", |delta: i64, x: i64| Ok(x + delta)).expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let seed = flow.completed_value(&10i64).await.expect("seed");
    let doubled = flow
        .then_apply::<i64, i64>(&seed, Continuation::stateless("double"))
        .await
        .expect("doubled");
    let shifted = flow
        .then_apply::<i64, i64>(&doubled, Continuation::new("add", &3i64).expect("continuation"))
        .await
        .expect("shifted");

    assert_eq!(flow.get(&shifted).await.expect("value"), 23);
}

#[tokio::test]
async fn supply_chained_through_four_increments() {
    let mut registry = HandlerRegistry::new();
    registry.supplier("seed", |n: i64| Ok(n)).expect("register");
    registry.function("inc", |_: (), x: i64| Ok(x + 1)).expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let mut stage = flow
        .supply::<i64>(Continuation::new("seed", &0i64).expect("continuation"))
        .await
        .expect("supply");
    for _ in 0..4 {
        stage = flow
            .then_apply::<i64, i64>(&stage, Continuation::stateless("inc"))
            .await
            .expect("apply");
    }

    assert_eq!(flow.get(&stage).await.expect("value"), 4);
}

#[tokio::test]
async fn supply_failure_is_recovered_by_exceptionally() {
    let mut registry = HandlerRegistry::new();
    registry
        .supplier("explode", |_: ()| -> Result<String, WrappedError> {
            Err(WrappedError::new("tests::Boom", "boom"))
        })
        .expect("register");
    registry
        .recovery("describe", |err| Ok(format!("recovered: {err}")))
        .expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let failing = flow
        .supply::<String>(Continuation::stateless("explode"))
        .await
        .expect("supply");
    let recovered = flow
        .exceptionally(&failing, Continuation::stateless("describe"))
        .await
        .expect("exceptionally");

    let message: String = flow.get(&recovered).await.expect("recovered");
    assert_eq!(message, "recovered: tests::Boom: boom");
}

#[tokio::test]
async fn exceptionally_passes_success_through_without_invoking() {
    let mut registry = HandlerRegistry::new();
    registry
        .recovery("describe", |err| Ok(format!("recovered: {err}")))
        .expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let fine = flow.completed_value(&7i64).await.expect("value");
    let guarded = flow
        .exceptionally(&fine, Continuation::stateless("describe"))
        .await
        .expect("exceptionally");
    assert_eq!(flow.get(&guarded).await.expect("value"), 7);
}

#[tokio::test]
async fn failure_short_circuits_ordinary_combinators() {
    let mut registry = HandlerRegistry::new();
    registry.function("inc", |_: (), x: i64| Ok(x + 1)).expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let failed = flow
        .failed::<i64>(WrappedError::new("tests::Boom", "upstream"))
        .await
        .expect("failed stage");
    let dependent = flow
        .then_apply::<i64, i64>(&failed, Continuation::stateless("inc"))
        .await
        .expect("apply");

    let err = flow.get(&dependent).await.unwrap_err();
    match err.cause {
        FlowError::Wrapped(fault) => {
            assert_eq!(fault.type_name, "tests::Boom");
            assert_eq!(fault.message, "upstream");
        }
        other => panic!("expected wrapped fault, got {other:?}"),
    }
}

#[tokio::test]
async fn handle_sees_both_outcomes() {
    let mut registry = HandlerRegistry::new();
    registry
        .outcome_function("fallback", |value: Option<i64>, error| match (value, error) {
            (Some(v), None) => Ok(v * 10),
            (None, Some(_)) => Ok(-1),
            other => Err(WrappedError::new("tests::Shape", format!("unexpected outcome pair: {other:?}"))),
        })
        .expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let fine = flow.completed_value(&4i64).await.expect("value");
    let handled = flow
        .handle::<i64, i64>(&fine, Continuation::stateless("fallback"))
        .await
        .expect("handle");
    assert_eq!(flow.get(&handled).await.expect("value"), 40);

    let failed = flow.failed::<i64>(WrappedError::new("tests::Boom", "x")).await.expect("failed");
    let handled = flow
        .handle::<i64, i64>(&failed, Continuation::stateless("fallback"))
        .await
        .expect("handle");
    assert_eq!(flow.get(&handled).await.expect("value"), -1);
}

#[tokio::test]
async fn when_complete_preserves_outcome_unless_observer_fails() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let observed = std::sync::Arc::new(AtomicUsize::new(0));
    let seen = observed.clone();

    let mut registry = HandlerRegistry::new();
    registry
        .outcome_consumer("observe", move |_value: Option<i64>, _error| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("register");
    registry
        .outcome_consumer("grumpy", |_value: Option<i64>, _error| {
            Err(WrappedError::new("tests::Observer", "observer exploded"))
        })
        .expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let fine = flow.completed_value(&5i64).await.expect("value");
    let observed_stage = flow
        .when_complete(&fine, Continuation::stateless("observe"))
        .await
        .expect("when_complete");
    assert_eq!(flow.get(&observed_stage).await.expect("value"), 5);
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    let superseded = flow
        .when_complete(&fine, Continuation::stateless("grumpy"))
        .await
        .expect("when_complete");
    let err = flow.get(&superseded).await.unwrap_err();
    assert!(matches!(err.cause, FlowError::Wrapped(fault) if fault.type_name == "tests::Observer"));
}

#[tokio::test]
async fn then_compose_adopts_the_inner_stage_result() {
    let mut registry = HandlerRegistry::new();
    registry
        .composer("fan-out", |flow, offset: i64, x: i64| async move {
            flow.completed_value(&(x + offset))
                .await
                .map_err(|e| WrappedError::from_error(&e))
        })
        .expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let seed = flow.completed_value(&5i64).await.expect("seed");
    let composed = flow
        .then_compose::<i64, i64>(&seed, Continuation::new("fan-out", &100i64).expect("continuation"))
        .await
        .expect("compose");

    assert_eq!(flow.get(&composed).await.expect("value"), 105);
}

#[tokio::test]
async fn then_combine_merges_two_stages() {
    let mut registry = HandlerRegistry::new();
    registry
        .bifunction("sum", |_: (), a: i64, b: i64| Ok(a + b))
        .expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let left = flow.completed_value(&2i64).await.expect("left");
    let right = flow.completed_value(&3i64).await.expect("right");
    let combined = flow
        .then_combine::<i64, i64, i64>(&left, &right, Continuation::stateless("sum"))
        .await
        .expect("combine");

    assert_eq!(flow.get(&combined).await.expect("value"), 5);
}

#[tokio::test]
async fn then_accept_consumes_the_value() {
    use std::sync::atomic::{AtomicI64, Ordering};
    let sink = std::sync::Arc::new(AtomicI64::new(0));
    let target = sink.clone();

    let mut registry = HandlerRegistry::new();
    registry
        .consumer("stash", move |x: i64| {
            target.store(x, Ordering::SeqCst);
            Ok(())
        })
        .expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let value = flow.completed_value(&41i64).await.expect("value");
    let accepted = flow
        .then_accept(&value, Continuation::stateless("stash"))
        .await
        .expect("accept");
    flow.get::<()>(&accepted).await.expect("empty result");
    assert_eq!(sink.load(Ordering::SeqCst), 41);
}

#[tokio::test]
async fn then_run_fires_after_success_without_seeing_the_value() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let runs = std::sync::Arc::new(AtomicUsize::new(0));
    let sink = runs.clone();

    let mut registry = HandlerRegistry::new();
    registry
        .runnable("tick", move || {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let value = flow.completed_value(&"ignored".to_string()).await.expect("value");
    let ran = flow.then_run(&value, Continuation::stateless("tick")).await.expect("run");
    flow.get::<()>(&ran).await.expect("empty");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exceptionally_compose_recovers_through_a_new_stage() {
    let mut registry = HandlerRegistry::new();
    registry
        .recovery_composer("retry-with-default", |flow, _err| async move {
            flow.completed_value(&0i64).await.map_err(|e| WrappedError::from_error(&e))
        })
        .expect("register");
    let harness = support::harness(registry);
    let flow = harness.flow().await;

    let failed = flow
        .failed::<i64>(WrappedError::new("tests::Boom", "x"))
        .await
        .expect("failed");
    let recovered = flow
        .exceptionally_compose(&failed, Continuation::stateless("retry-with-default"))
        .await
        .expect("compose");
    assert_eq!(flow.get(&recovered).await.expect("value"), 0);
}

#[tokio::test]
async fn non_serializable_capture_fails_before_any_remote_call() {
    use std::collections::HashMap;

    let harness = support::harness(HandlerRegistry::new());
    let flow = harness.flow().await;

    let mut unserializable = HashMap::new();
    unserializable.insert((1u8, 2u8), "x");
    let err = Continuation::new("h", &unserializable).unwrap_err();
    assert!(matches!(err, FlowError::ContinuationSerialization { .. }));

    // Nothing reached the blob store or the completer.
    assert!(harness.blobs.is_empty());
    drop(flow);
}
