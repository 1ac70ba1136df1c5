//! The stage-graph handle and its combinators.
//!
//! A [`Flow`] is one invocation's view of a computation graph owned by the
//! remote completer. Every combinator issues exactly one completer request
//! and returns a new typed [`Stage`] handle; nothing executes locally.
//! Continuations run later, inside whichever container the completer
//! dispatches them to.
//!
//! The `Flow` is passed around explicitly; there is no ambient
//! "current flow" to resolve through global state.

use std::{marker::PhantomData, sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use rill_client::{
    blobs::BlobStoreClient,
    completer::{CompleterClient, WaitResult},
    protocol::{AddStageRequest, CompletionResult, StageOperation},
};
use rill_types::{
    ExternalCompletion, FlowCompletionError, FlowError, FlowId, Headers, HttpMethod, HttpRequestInfo, HttpResponseInfo,
    RetrievalError, StageId, WrappedError,
};

use crate::codec::{self, Continuation, StageArg};

/// Typed handle to a stage. Only the identifier is held locally; the
/// completer owns the stage's lifetime and resolution state.
#[derive(Debug)]
pub struct Stage<T> {
    id: StageId,
    _out: PhantomData<fn() -> T>,
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _out: PhantomData,
        }
    }
}

impl<T> Stage<T> {
    /// Wrap an existing stage id, e.g. one carried in a dispatch callback.
    pub fn from_id(id: StageId) -> Self {
        Self { id, _out: PhantomData }
    }

    pub fn id(&self) -> &StageId {
        &self.id
    }

    /// The untyped identifier, for dependency lists.
    pub fn erased(&self) -> StageId {
        self.id.clone()
    }
}

/// One invocation's handle to its computation graph.
#[derive(Clone)]
pub struct Flow {
    id: FlowId,
    completer: Arc<dyn CompleterClient>,
    blobs: Arc<dyn BlobStoreClient>,
}

impl Flow {
    /// Create a fresh graph for `function_id` against the completer.
    pub async fn create(
        completer: Arc<dyn CompleterClient>,
        blobs: Arc<dyn BlobStoreClient>,
        function_id: &str,
    ) -> Result<Self, FlowError> {
        let id = completer.create_flow(function_id).await?;
        Ok(Self { id, completer, blobs })
    }

    /// Attach to an existing graph, as done when a dispatch callback
    /// re-enters the container with a flow id.
    pub fn attach(id: FlowId, completer: Arc<dyn CompleterClient>, blobs: Arc<dyn BlobStoreClient>) -> Self {
        Self { id, completer, blobs }
    }

    pub fn id(&self) -> &FlowId {
        &self.id
    }

    pub fn completer(&self) -> &Arc<dyn CompleterClient> {
        &self.completer
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStoreClient> {
        &self.blobs
    }

    async fn add_stage(
        &self,
        operation: StageOperation,
        continuation: Option<&Continuation>,
        deps: Vec<StageId>,
    ) -> Result<StageId, FlowError> {
        let closure = match continuation {
            Some(c) => Some(codec::push_continuation(self.blobs.as_ref(), &self.id, c).await?),
            None => None,
        };
        self.completer
            .add_stage(
                &self.id,
                AddStageRequest {
                    operation,
                    closure,
                    deps,
                    caller_id: None,
                },
            )
            .await
    }

    /// An already-resolved stage holding `value`. The value is written to
    /// the blob store; the completer never schedules anything for it.
    pub async fn completed_value<T: Serialize>(&self, value: &T) -> Result<Stage<T>, FlowError> {
        let datum = codec::encode_value(self.blobs.as_ref(), &self.id, value).await?;
        let id = self.completer.add_value_stage(&self.id, CompletionResult::success(datum)).await?;
        Ok(Stage::from_id(id))
    }

    /// An already-failed stage carrying the given fault.
    pub async fn failed<T>(&self, fault: WrappedError) -> Result<Stage<T>, FlowError> {
        let datum = codec::encode_fault(self.blobs.as_ref(), &self.id, &fault).await?;
        let id = self.completer.add_value_stage(&self.id, CompletionResult::failure(datum)).await?;
        Ok(Stage::from_id(id))
    }

    /// Submit a no-argument continuation for out-of-band execution.
    pub async fn supply<R>(&self, continuation: Continuation) -> Result<Stage<R>, FlowError> {
        let id = self.add_stage(StageOperation::Supply, Some(&continuation), Vec::new()).await?;
        Ok(Stage::from_id(id))
    }

    /// Transform a stage's value once it resolves successfully. Upstream
    /// failure short-circuits without invoking the continuation.
    pub async fn then_apply<T, R>(&self, stage: &Stage<T>, continuation: Continuation) -> Result<Stage<R>, FlowError> {
        let id = self
            .add_stage(StageOperation::ThenApply, Some(&continuation), vec![stage.erased()])
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Chain a continuation that builds a further stage; the new stage
    /// adopts that stage's eventual result.
    pub async fn then_compose<T, R>(&self, stage: &Stage<T>, continuation: Continuation) -> Result<Stage<R>, FlowError> {
        let id = self
            .add_stage(StageOperation::ThenCompose, Some(&continuation), vec![stage.erased()])
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Combine two successful stages through a two-argument continuation.
    pub async fn then_combine<A, B, R>(
        &self,
        left: &Stage<A>,
        right: &Stage<B>,
        continuation: Continuation,
    ) -> Result<Stage<R>, FlowError> {
        let id = self
            .add_stage(
                StageOperation::ThenCombine,
                Some(&continuation),
                vec![left.erased(), right.erased()],
            )
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Consume a stage's value for its side effect.
    pub async fn then_accept<T>(&self, stage: &Stage<T>, continuation: Continuation) -> Result<Stage<()>, FlowError> {
        let id = self
            .add_stage(StageOperation::ThenAccept, Some(&continuation), vec![stage.erased()])
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Run a continuation after a stage resolves successfully, ignoring its
    /// value.
    pub async fn then_run<T>(&self, stage: &Stage<T>, continuation: Continuation) -> Result<Stage<()>, FlowError> {
        let id = self
            .add_stage(StageOperation::ThenRun, Some(&continuation), vec![stage.erased()])
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Consume both values once both stages resolve successfully.
    pub async fn then_accept_both<A, B>(
        &self,
        left: &Stage<A>,
        right: &Stage<B>,
        continuation: Continuation,
    ) -> Result<Stage<()>, FlowError> {
        let id = self
            .add_stage(
                StageOperation::ThenAcceptBoth,
                Some(&continuation),
                vec![left.erased(), right.erased()],
            )
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Transform whichever of the two stages resolves first.
    pub async fn apply_to_either<T, R>(
        &self,
        first: &Stage<T>,
        second: &Stage<T>,
        continuation: Continuation,
    ) -> Result<Stage<R>, FlowError> {
        let id = self
            .add_stage(
                StageOperation::ApplyToEither,
                Some(&continuation),
                vec![first.erased(), second.erased()],
            )
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Consume whichever of the two stages resolves first.
    pub async fn accept_either<T>(
        &self,
        first: &Stage<T>,
        second: &Stage<T>,
        continuation: Continuation,
    ) -> Result<Stage<()>, FlowError> {
        let id = self
            .add_stage(
                StageOperation::AcceptEither,
                Some(&continuation),
                vec![first.erased(), second.erased()],
            )
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Convert an upstream failure into a replacement value; passthrough on
    /// success.
    pub async fn exceptionally<T>(&self, stage: &Stage<T>, continuation: Continuation) -> Result<Stage<T>, FlowError> {
        let id = self
            .add_stage(StageOperation::Exceptionally, Some(&continuation), vec![stage.erased()])
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Like [`Flow::exceptionally`], but the recovery continuation builds a
    /// further stage whose result is adopted.
    pub async fn exceptionally_compose<T>(&self, stage: &Stage<T>, continuation: Continuation) -> Result<Stage<T>, FlowError> {
        let id = self
            .add_stage(StageOperation::ExceptionallyCompose, Some(&continuation), vec![stage.erased()])
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Invoke the continuation with `(value, error)` regardless of outcome;
    /// its return value replaces the result.
    pub async fn handle<T, R>(&self, stage: &Stage<T>, continuation: Continuation) -> Result<Stage<R>, FlowError> {
        let id = self
            .add_stage(StageOperation::Handle, Some(&continuation), vec![stage.erased()])
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Observe `(value, error)` without changing the outcome, unless the
    /// observer itself fails, in which case that failure supersedes.
    pub async fn when_complete<T>(&self, stage: &Stage<T>, continuation: Continuation) -> Result<Stage<T>, FlowError> {
        let id = self
            .add_stage(StageOperation::WhenComplete, Some(&continuation), vec![stage.erased()])
            .await?;
        Ok(Stage::from_id(id))
    }

    /// Empty-success once every dependency succeeds; the first-completing
    /// failure otherwise.
    pub async fn all_of(&self, deps: Vec<StageId>) -> Result<Stage<()>, FlowError> {
        if deps.is_empty() {
            return Err(FlowError::invalid_stage_response("all_of requires at least one stage"));
        }
        let id = self.add_stage(StageOperation::AllOf, None, deps).await?;
        Ok(Stage::from_id(id))
    }

    /// Resolves with whichever dependency resolves first, success or
    /// failure.
    pub async fn any_of(&self, deps: Vec<StageId>) -> Result<Stage<Value>, FlowError> {
        if deps.is_empty() {
            return Err(FlowError::invalid_stage_response("any_of requires at least one stage"));
        }
        let id = self.add_stage(StageOperation::AnyOf, None, deps).await?;
        Ok(Stage::from_id(id))
    }

    /// Resolves successfully after at least `duration`, scheduled by the
    /// completer, never by local sleeping.
    pub async fn delay(&self, duration: Duration) -> Result<Stage<()>, FlowError> {
        let delay_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let id = self.completer.add_delay_stage(&self.id, delay_ms).await?;
        Ok(Stage::from_id(id))
    }

    /// Call another function through the completer. Resolves to the HTTP
    /// response on any answer; fails with an invocation-kind error when the
    /// target cannot be reached at all.
    pub async fn invoke_function(
        &self,
        function_id: &str,
        method: HttpMethod,
        headers: Headers,
        body: Vec<u8>,
    ) -> Result<Stage<HttpResponseInfo>, FlowError> {
        let info = HttpRequestInfo::new(method, headers, body);
        let arg = codec::encode_http_request(self.blobs.as_ref(), &self.id, &info).await?;
        let id = self.completer.add_invoke_function_stage(&self.id, function_id, arg).await?;
        Ok(Stage::from_id(id))
    }

    /// A stage resolved from outside the graph: the first valid request to
    /// either returned URL decides the outcome.
    pub async fn external_future(&self) -> Result<(Stage<HttpRequestInfo>, ExternalCompletion), FlowError> {
        let external = self.completer.create_external_stage(&self.id).await?;
        let stage = Stage::from_id(external.stage_id.clone());
        Ok((stage, external))
    }

    /// Register a hook continuation fired exactly once when the flow
    /// reaches a terminal state. The hook receives the terminal
    /// [`rill_types::FlowState`] as its argument.
    pub async fn add_termination_hook(&self, continuation: Continuation) -> Result<(), FlowError> {
        self.add_stage(StageOperation::TerminationHook, Some(&continuation), Vec::new())
            .await?;
        Ok(())
    }

    /// Signal that the creating invocation has finished describing the
    /// graph. Termination hooks cannot fire before this.
    pub async fn commit(&self) -> Result<(), FlowError> {
        self.completer.commit(&self.id).await
    }

    /// Wait for a stage and return its deserialized value. Failures
    /// anywhere upstream arrive as a [`FlowCompletionError`] carrying the
    /// original cause.
    pub async fn get<T: DeserializeOwned>(&self, stage: &Stage<T>) -> Result<T, FlowCompletionError> {
        debug!(flow_id = %self.id, stage_id = %stage.id(), "awaiting stage");
        match self.completer.await_stage(&self.id, stage.id(), None).await {
            Ok(WaitResult::Completed(result)) => self.decode_typed(result).await,
            Ok(WaitResult::TimedOut) => Err(FlowCompletionError::new(FlowError::platform(
                "completer reported a timeout for an unbounded wait",
            ))),
            Err(err) => Err(FlowCompletionError::new(err)),
        }
    }

    /// Wait for a stage with a deadline. Passing the deadline abandons only
    /// this wait; the remote stage keeps running and a later [`Flow::get`]
    /// observes its real outcome.
    pub async fn get_within<T: DeserializeOwned>(&self, stage: &Stage<T>, timeout: Duration) -> Result<T, RetrievalError> {
        match self.completer.await_stage(&self.id, stage.id(), Some(timeout)).await {
            Ok(WaitResult::Completed(result)) => self.decode_typed(result).await.map_err(RetrievalError::Completed),
            Ok(WaitResult::TimedOut) => {
                warn!(flow_id = %self.id, stage_id = %stage.id(), ?timeout, "abandoning local wait; stage continues remotely");
                Err(RetrievalError::WaitTimeout(timeout))
            }
            Err(err) => Err(RetrievalError::Completed(FlowCompletionError::new(err))),
        }
    }

    /// Near-immediate retrieval: a short bounded wait, falling back to
    /// `value_if_absent` when the stage has not resolved yet.
    pub async fn get_now<T: DeserializeOwned>(&self, stage: &Stage<T>, value_if_absent: T) -> Result<T, FlowCompletionError> {
        match self.get_within(stage, Duration::from_secs(1)).await {
            Ok(value) => Ok(value),
            Err(RetrievalError::WaitTimeout(_)) => Ok(value_if_absent),
            Err(RetrievalError::Completed(err)) => Err(err),
        }
    }

    async fn decode_typed<T: DeserializeOwned>(&self, result: CompletionResult) -> Result<T, FlowCompletionError> {
        let arg = codec::decode_result(self.blobs.as_ref(), &self.id, &result)
            .await
            .map_err(FlowCompletionError::new)?;
        let value = match arg {
            StageArg::Value(value) => value,
            StageArg::Empty => Value::Null,
            StageArg::HttpRequest(req) => serde_json::to_value(req)
                .map_err(|e| FlowCompletionError::new(FlowError::result_serialization(e.to_string())))?,
            StageArg::HttpResponse(resp) => serde_json::to_value(resp)
                .map_err(|e| FlowCompletionError::new(FlowError::result_serialization(e.to_string())))?,
            StageArg::Stage(id) => {
                return Err(FlowCompletionError::new(FlowError::result_serialization(format!(
                    "stage resolved to an unresolved stage reference '{id}'"
                ))));
            }
            StageArg::Error(err) => return Err(FlowCompletionError::new(err)),
        };
        serde_json::from_value(value)
            .map_err(|e| FlowCompletionError::new(FlowError::result_serialization(format!("result did not decode: {e}"))))
    }
}
