//! Continuation codec: tagged descriptors, the handler registry, and the
//! datum/value conversions.
//!
//! A continuation never serializes code. It is a descriptor
//! `{handler_id, state}` where `handler_id` resolves through a
//! [`HandlerRegistry`] populated at process start and `state` is whatever
//! the caller captured, encoded as JSON. Captured state is serialized at
//! construction time, so a non-serializable capture fails in the calling
//! invocation before any request leaves the process.

use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use rill_client::{
    blobs::BlobStoreClient,
    protocol::{
        CONTENT_TYPE_CONTINUATION, CONTENT_TYPE_ERROR, CONTENT_TYPE_JSON, CompletionResult, Datum, HttpReq, HttpResp,
        wrapped_error_bytes,
    },
};
use rill_types::{FlowError, FlowId, StageId, WrappedError};

use crate::flow::{Flow, Stage};

/// Serialized unit of user code: a registered handler plus its captured
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    pub handler_id: String,
    pub state: Value,
}

impl Continuation {
    /// Capture `state` for the handler registered under `handler_id`.
    ///
    /// Fails locally with `ContinuationSerialization` when the state cannot
    /// be encoded; nothing has been sent anywhere at that point.
    pub fn new<S: Serialize>(handler_id: impl Into<String>, state: &S) -> Result<Self, FlowError> {
        let state = serde_json::to_value(state)
            .map_err(|e| FlowError::continuation_serialization(format!("captured state did not serialize: {e}")))?;
        Ok(Self {
            handler_id: handler_id.into(),
            state,
        })
    }

    /// A continuation with no captured state.
    pub fn stateless(handler_id: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            state: Value::Null,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FlowError> {
        serde_json::to_vec(self).map_err(|e| FlowError::continuation_serialization(format!("descriptor did not serialize: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FlowError> {
        serde_json::from_slice(bytes)
            .map_err(|e| FlowError::invalid_stage_response(format!("continuation descriptor did not parse: {e}")))
    }
}

/// One decoded dependency argument handed to a handler.
#[derive(Debug, Clone)]
pub enum StageArg {
    /// A successful JSON value.
    Value(Value),
    /// A successful empty resolution.
    Empty,
    /// A reference to another stage.
    Stage(StageId),
    /// A materialized HTTP request (externally completed stage).
    HttpRequest(rill_types::HttpRequestInfo),
    /// A materialized HTTP response (function invocation).
    HttpResponse(rill_types::HttpResponseInfo),
    /// An upstream failure.
    Error(FlowError),
}

/// What a handler hands back to the completer.
#[derive(Debug, Clone)]
pub enum HandlerOutput {
    Value(Value),
    Stage(StageId),
    Empty,
}

/// A unit of user code invokable by the dispatch layer.
///
/// `arity` is the number of dependency arguments the completer is expected
/// to deliver; the dispatcher refuses mismatches before invoking.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn arity(&self) -> usize;

    async fn invoke(&self, flow: &Flow, state: Value, args: Vec<StageArg>) -> Result<HandlerOutput, WrappedError>;
}

#[derive(Debug, Error)]
#[error("handler '{0}' is already registered")]
pub struct DuplicateHandler(pub String);

/// Registry resolving `handler_id`s to invokable handlers.
///
/// Populate it once at process start with the same ids on every container
/// that may be asked to run a continuation of the flow.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
}

struct SyncHandler<F> {
    arity: usize,
    f: F,
}

#[async_trait]
impl<F> StageHandler for SyncHandler<F>
where
    F: Fn(Value, Vec<StageArg>) -> Result<HandlerOutput, WrappedError> + Send + Sync,
{
    fn arity(&self) -> usize {
        self.arity
    }

    async fn invoke(&self, _flow: &Flow, state: Value, args: Vec<StageArg>) -> Result<HandlerOutput, WrappedError> {
        (self.f)(state, args)
    }
}

struct ComposeHandler<F> {
    f: F,
}

#[async_trait]
impl<F> StageHandler for ComposeHandler<F>
where
    F: Fn(Flow, Value, Vec<StageArg>) -> BoxFuture<'static, Result<HandlerOutput, WrappedError>> + Send + Sync,
{
    fn arity(&self) -> usize {
        1
    }

    async fn invoke(&self, flow: &Flow, state: Value, args: Vec<StageArg>) -> Result<HandlerOutput, WrappedError> {
        (self.f)(flow.clone(), state, args).await
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, handler: Arc<dyn StageHandler>) -> Result<(), DuplicateHandler> {
        let id = id.into();
        if self.handlers.contains_key(&id) {
            return Err(DuplicateHandler(id));
        }
        self.handlers.insert(id, handler);
        Ok(())
    }

    pub fn resolve(&self, id: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(id).cloned()
    }

    /// No-argument handler producing a value from its captured state.
    pub fn supplier<S, R, F>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        S: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(S) -> Result<R, WrappedError> + Send + Sync + 'static,
    {
        self.register(
            id,
            Arc::new(SyncHandler {
                arity: 0,
                f: move |state: Value, _args: Vec<StageArg>| {
                    let state: S = decode_state(state)?;
                    encode_handler_value(f(state)?)
                },
            }),
        )
    }

    /// One-argument value transformer; receives captured state first.
    pub fn function<S, A, R, F>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        S: DeserializeOwned + 'static,
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(S, A) -> Result<R, WrappedError> + Send + Sync + 'static,
    {
        self.register(
            id,
            Arc::new(SyncHandler {
                arity: 1,
                f: move |state: Value, mut args: Vec<StageArg>| {
                    let state: S = decode_state(state)?;
                    let arg: A = decode_arg(args.remove(0))?;
                    encode_handler_value(f(state, arg)?)
                },
            }),
        )
    }

    /// Two-argument combiner; receives captured state first.
    pub fn bifunction<S, A, B, R, F>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        S: DeserializeOwned + 'static,
        A: DeserializeOwned + 'static,
        B: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(S, A, B) -> Result<R, WrappedError> + Send + Sync + 'static,
    {
        self.register(
            id,
            Arc::new(SyncHandler {
                arity: 2,
                f: move |state: Value, mut args: Vec<StageArg>| {
                    let state: S = decode_state(state)?;
                    let b: B = decode_arg(args.remove(1))?;
                    let a: A = decode_arg(args.remove(0))?;
                    encode_handler_value(f(state, a, b)?)
                },
            }),
        )
    }

    /// One-argument side-effecting handler; resolves to empty.
    pub fn consumer<A, F>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        A: DeserializeOwned + 'static,
        F: Fn(A) -> Result<(), WrappedError> + Send + Sync + 'static,
    {
        self.register(
            id,
            Arc::new(SyncHandler {
                arity: 1,
                f: move |_state: Value, mut args: Vec<StageArg>| {
                    let arg: A = decode_arg(args.remove(0))?;
                    f(arg)?;
                    Ok(HandlerOutput::Empty)
                },
            }),
        )
    }

    /// Two-argument side-effecting handler; resolves to empty.
    pub fn biconsumer<A, B, F>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        A: DeserializeOwned + 'static,
        B: DeserializeOwned + 'static,
        F: Fn(A, B) -> Result<(), WrappedError> + Send + Sync + 'static,
    {
        self.register(
            id,
            Arc::new(SyncHandler {
                arity: 2,
                f: move |_state: Value, mut args: Vec<StageArg>| {
                    let b: B = decode_arg(args.remove(1))?;
                    let a: A = decode_arg(args.remove(0))?;
                    f(a, b)?;
                    Ok(HandlerOutput::Empty)
                },
            }),
        )
    }

    /// No-argument, no-result handler.
    pub fn runnable<F>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        F: Fn() -> Result<(), WrappedError> + Send + Sync + 'static,
    {
        self.register(
            id,
            Arc::new(SyncHandler {
                arity: 0,
                f: move |_state: Value, _args: Vec<StageArg>| {
                    f()?;
                    Ok(HandlerOutput::Empty)
                },
            }),
        )
    }

    /// Error recovery handler for `exceptionally`: receives the upstream
    /// failure and produces a replacement value.
    pub fn recovery<R, F>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        R: Serialize + 'static,
        F: Fn(FlowError) -> Result<R, WrappedError> + Send + Sync + 'static,
    {
        self.register(
            id,
            Arc::new(SyncHandler {
                arity: 1,
                f: move |_state: Value, mut args: Vec<StageArg>| match args.remove(0) {
                    StageArg::Error(err) => encode_handler_value(f(err)?),
                    other => Err(arg_shape_fault(&format!("recovery handler expected an error argument, got {other:?}"))),
                },
            }),
        )
    }

    /// `handle`-style handler: called with `(value, error)` whichever way
    /// the upstream resolved; the return value replaces the outcome.
    pub fn outcome_function<A, R, F>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(Option<A>, Option<FlowError>) -> Result<R, WrappedError> + Send + Sync + 'static,
    {
        self.register(
            id,
            Arc::new(SyncHandler {
                arity: 2,
                f: move |_state: Value, mut args: Vec<StageArg>| {
                    let err = decode_outcome_error(args.remove(1));
                    let value: Option<A> = decode_outcome_value(args.remove(0))?;
                    encode_handler_value(f(value, err)?)
                },
            }),
        )
    }

    /// `when_complete`-style observer: sees `(value, error)` but the
    /// upstream outcome is preserved unless the observer itself fails.
    pub fn outcome_consumer<A, F>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        A: DeserializeOwned + 'static,
        F: Fn(Option<A>, Option<FlowError>) -> Result<(), WrappedError> + Send + Sync + 'static,
    {
        self.register(
            id,
            Arc::new(SyncHandler {
                arity: 2,
                f: move |_state: Value, mut args: Vec<StageArg>| {
                    let err = decode_outcome_error(args.remove(1));
                    let value: Option<A> = decode_outcome_value(args.remove(0))?;
                    f(value, err)?;
                    Ok(HandlerOutput::Empty)
                },
            }),
        )
    }

    /// Composing handler for `then_compose`: builds a new stage against the
    /// flow and the dependent stage adopts its result.
    pub fn composer<S, A, R, F, Fut>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        S: DeserializeOwned + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Send + 'static,
        F: Fn(Flow, S, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Stage<R>, WrappedError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(
            id,
            Arc::new(ComposeHandler {
                f: move |flow: Flow, state: Value, mut args: Vec<StageArg>| {
                    let f = Arc::clone(&f);
                    Box::pin(async move {
                        let state: S = decode_state(state)?;
                        let arg: A = decode_arg(args.remove(0))?;
                        let stage = f(flow, state, arg).await?;
                        Ok(HandlerOutput::Stage(stage.id().clone()))
                    }) as BoxFuture<'static, Result<HandlerOutput, WrappedError>>
                },
            }),
        )
    }

    /// Composing recovery handler for `exceptionally_compose`.
    pub fn recovery_composer<R, F, Fut>(&mut self, id: &str, f: F) -> Result<(), DuplicateHandler>
    where
        R: Send + 'static,
        F: Fn(Flow, FlowError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Stage<R>, WrappedError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(
            id,
            Arc::new(ComposeHandler {
                f: move |flow: Flow, _state: Value, mut args: Vec<StageArg>| {
                    let f = Arc::clone(&f);
                    Box::pin(async move {
                        match args.remove(0) {
                            StageArg::Error(err) => {
                                let stage = f(flow, err).await?;
                                Ok(HandlerOutput::Stage(stage.id().clone()))
                            }
                            other => Err(arg_shape_fault(&format!(
                                "recovery handler expected an error argument, got {other:?}"
                            ))),
                        }
                    }) as BoxFuture<'static, Result<HandlerOutput, WrappedError>>
                },
            }),
        )
    }
}

fn arg_shape_fault(message: &str) -> WrappedError {
    WrappedError::new("rill_engine::codec::ArgumentShape", message)
}

fn decode_state<S: DeserializeOwned>(state: Value) -> Result<S, WrappedError> {
    serde_json::from_value(state).map_err(|e| WrappedError::new("rill_engine::codec::StateDecode", e.to_string()))
}

fn decode_arg<A: DeserializeOwned>(arg: StageArg) -> Result<A, WrappedError> {
    let value = match arg {
        StageArg::Value(v) => v,
        StageArg::Empty => Value::Null,
        StageArg::HttpRequest(req) => {
            serde_json::to_value(req).map_err(|e| WrappedError::new("rill_engine::codec::ArgDecode", e.to_string()))?
        }
        StageArg::HttpResponse(resp) => {
            serde_json::to_value(resp).map_err(|e| WrappedError::new("rill_engine::codec::ArgDecode", e.to_string()))?
        }
        StageArg::Stage(id) => {
            return Err(arg_shape_fault(&format!("stage reference '{id}' cannot be decoded as a value")));
        }
        StageArg::Error(err) => {
            return Err(arg_shape_fault(&format!("upstream error delivered to a value handler: {err}")));
        }
    };
    serde_json::from_value(value).map_err(|e| WrappedError::new("rill_engine::codec::ArgDecode", e.to_string()))
}

fn decode_outcome_value<A: DeserializeOwned>(arg: StageArg) -> Result<Option<A>, WrappedError> {
    match arg {
        StageArg::Empty => Ok(None),
        StageArg::Error(_) => Ok(None),
        other => decode_arg(other).map(Some),
    }
}

fn decode_outcome_error(arg: StageArg) -> Option<FlowError> {
    match arg {
        StageArg::Error(err) => Some(err),
        _ => None,
    }
}

fn encode_handler_value<R: Serialize>(value: R) -> Result<HandlerOutput, WrappedError> {
    serde_json::to_value(value)
        .map(HandlerOutput::Value)
        .map_err(|e| WrappedError::new("rill_engine::codec::ResultEncode", e.to_string()))
}

/// Decode one wire result into a handler argument, resolving blob-backed
/// payloads through the blob store.
pub async fn decode_result(
    blobs: &dyn BlobStoreClient,
    flow_id: &FlowId,
    result: &CompletionResult,
) -> Result<StageArg, FlowError> {
    let prefix = flow_id.as_str();
    if result.successful {
        match &result.datum {
            Datum::Empty {} => Ok(StageArg::Empty),
            Datum::Blob(blob) => {
                let bytes = blobs.read_blob(prefix, &blob.blob_id, &blob.content_type).await?;
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| FlowError::result_serialization(format!("blob payload did not parse: {e}")))?;
                Ok(StageArg::Value(value))
            }
            Datum::StageRef { stage_id } => Ok(StageArg::Stage(stage_id.clone())),
            Datum::HttpReq(req) => Ok(StageArg::HttpRequest(req.clone().into_info(blobs, prefix).await?)),
            Datum::HttpResp(resp) => Ok(StageArg::HttpResponse(resp.clone().into_info(blobs, prefix).await?)),
            Datum::Status { state } => {
                let value = serde_json::to_value(state)
                    .map_err(|e| FlowError::result_serialization(format!("status datum did not encode: {e}")))?;
                Ok(StageArg::Value(value))
            }
            Datum::Error { kind, message } => Ok(StageArg::Error(kind.into_flow_error(message.clone()))),
        }
    } else {
        match &result.datum {
            Datum::Error { kind, message } => Ok(StageArg::Error(kind.into_flow_error(message.clone()))),
            Datum::Blob(blob) if blob.content_type == CONTENT_TYPE_ERROR => {
                let bytes = blobs.read_blob(prefix, &blob.blob_id, &blob.content_type).await?;
                let fault: WrappedError = serde_json::from_slice(&bytes)
                    .map_err(|e| FlowError::result_serialization(format!("wrapped fault did not parse: {e}")))?;
                Ok(StageArg::Error(FlowError::Wrapped(fault)))
            }
            Datum::Blob(blob) => Err(FlowError::result_serialization(format!(
                "failed stage carried unexpected blob content type '{}'",
                blob.content_type
            ))),
            Datum::HttpResp(resp) => {
                let response = resp.clone().into_info(blobs, prefix).await?;
                Ok(StageArg::Error(FlowError::FunctionInvocation { response }))
            }
            Datum::HttpReq(req) => {
                let request = req.clone().into_info(blobs, prefix).await?;
                Ok(StageArg::Error(FlowError::ExternalCompletion { request }))
            }
            other => Ok(StageArg::Error(FlowError::platform(format!(
                "stage failed with unexpected datum: {other:?}"
            )))),
        }
    }
}

/// Encode a plain value as a blob-backed success datum.
pub async fn encode_value<T: Serialize + ?Sized>(
    blobs: &dyn BlobStoreClient,
    flow_id: &FlowId,
    value: &T,
) -> Result<Datum, FlowError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| FlowError::continuation_serialization(format!("value did not serialize: {e}")))?;
    let blob = blobs.write_blob(flow_id.as_str(), bytes, CONTENT_TYPE_JSON).await?;
    Ok(Datum::Blob(blob))
}

/// Encode a user fault as an error-tagged blob datum.
pub async fn encode_fault(blobs: &dyn BlobStoreClient, flow_id: &FlowId, fault: &WrappedError) -> Result<Datum, FlowError> {
    let blob = blobs
        .write_blob(flow_id.as_str(), wrapped_error_bytes(fault), CONTENT_TYPE_ERROR)
        .await?;
    Ok(Datum::Blob(blob))
}

/// Encode a handler's output as the datum reported back to the completer.
pub async fn encode_output(
    blobs: &dyn BlobStoreClient,
    flow_id: &FlowId,
    output: HandlerOutput,
) -> Result<Datum, FlowError> {
    match output {
        HandlerOutput::Empty => Ok(Datum::empty()),
        HandlerOutput::Stage(stage_id) => Ok(Datum::StageRef { stage_id }),
        HandlerOutput::Value(value) => encode_value(blobs, flow_id, &value).await,
    }
}

/// Write a continuation descriptor through the blob store, returning the
/// closure reference carried by stage-creation requests.
pub async fn push_continuation(
    blobs: &dyn BlobStoreClient,
    flow_id: &FlowId,
    continuation: &Continuation,
) -> Result<rill_client::protocol::BlobRef, FlowError> {
    let bytes = continuation.encode()?;
    blobs.write_blob(flow_id.as_str(), bytes, CONTENT_TYPE_CONTINUATION).await
}

/// Build the wire form of an HTTP request for `invoke_function`, pushing
/// the body into the blob store.
pub async fn encode_http_request(
    blobs: &dyn BlobStoreClient,
    flow_id: &FlowId,
    info: &rill_types::HttpRequestInfo,
) -> Result<HttpReq, FlowError> {
    HttpReq::from_info(blobs, flow_id.as_str(), info).await
}

/// Build the wire form of an HTTP response (used by test backends and the
/// dispatch layer when relaying invocation results).
pub async fn encode_http_response(
    blobs: &dyn BlobStoreClient,
    flow_id: &FlowId,
    info: &rill_types::HttpResponseInfo,
) -> Result<HttpResp, FlowError> {
    HttpResp::from_info(blobs, flow_id.as_str(), info).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn non_serializable_state_fails_before_submission() {
        // Non-string map keys are not representable in JSON.
        let mut state = HashMap::new();
        state.insert((1, 2), "x");
        let err = Continuation::new("h", &state).unwrap_err();
        assert!(matches!(err, FlowError::ContinuationSerialization { .. }));
    }

    #[test]
    fn descriptor_round_trips() {
        let c = Continuation::new("add-one", &7i64).expect("continuation");
        let bytes = c.encode().expect("encode");
        let back = Continuation::decode(&bytes).expect("decode");
        assert_eq!(back, c);
    }

    #[test]
    fn garbage_descriptor_is_an_invalid_stage_response() {
        let err = Continuation::decode(b"not json").unwrap_err();
        assert!(matches!(err, FlowError::InvalidStageResponse { .. }));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.function("inc", |_: (), x: i64| Ok(x + 1)).expect("first");
        let err = registry.function("inc", |_: (), x: i64| Ok(x + 2)).unwrap_err();
        assert_eq!(err.0, "inc");
    }

    #[test]
    fn registry_resolves_registered_handlers() {
        let mut registry = HandlerRegistry::new();
        registry.supplier("seed", |n: i64| Ok(n * 2)).expect("register");
        assert!(registry.resolve("seed").is_some());
        assert!(registry.resolve("missing").is_none());
        assert_eq!(registry.resolve("seed").expect("handler").arity(), 0);
    }
}
