//! In-memory completer.
//!
//! Implements the same dependency-trigger semantics the remote service
//! applies: failure short-circuits ordinary combinators, the either/any
//! family adopts the first resolution, `allOf` fails with the
//! first-completing failure, and externally completable stages accept
//! exactly one resolution. Each stage is driven by its own task and
//! resolves a watch channel that awaiting callers subscribe to.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::future::{Either, select, select_all};
use tokio::sync::watch;
use tracing::{debug, warn};

use rill_client::{
    blobs::BlobStoreClient,
    completer::{CompleterClient, WaitResult},
    protocol::{
        AddStageRequest, BlobRef, CompletionResult, Datum, ErrorDatumKind, HttpReq, HttpResp, InvokeStageRequest,
        InvokeStageResponse, StageOperation,
    },
};
use rill_types::{ExternalCompletion, FlowError, FlowId, FlowState, StageId};

use crate::functions::FunctionBackend;

/// Something that can run a continuation when the completer asks for it:
/// in production the container's dispatch layer, in tests an invoker wired
/// straight back into the process.
#[async_trait]
pub trait ContinuationDispatcher: Send + Sync {
    async fn dispatch(&self, request: InvokeStageRequest) -> InvokeStageResponse;
}

struct StageNode {
    external: bool,
    tx: watch::Sender<Option<CompletionResult>>,
}

struct FlowGraph {
    stages: HashMap<StageId, StageNode>,
    next_stage: u64,
    hooks: Vec<BlobRef>,
    hooks_fired: bool,
}

impl FlowGraph {
    fn new() -> Self {
        Self {
            stages: HashMap::new(),
            next_stage: 0,
            hooks: Vec::new(),
            hooks_fired: false,
        }
    }
}

struct Inner {
    flows: Mutex<HashMap<FlowId, FlowGraph>>,
    dispatcher: Mutex<Option<Arc<dyn ContinuationDispatcher>>>,
    functions: Mutex<Option<Arc<dyn FunctionBackend>>>,
    blobs: Arc<dyn BlobStoreClient>,
    flow_counter: AtomicU64,
}

/// In-process [`CompleterClient`] double.
pub struct InMemCompleter {
    inner: Arc<Inner>,
}

impl InMemCompleter {
    pub fn new(blobs: Arc<dyn BlobStoreClient>) -> Self {
        Self {
            inner: Arc::new(Inner {
                flows: Mutex::new(HashMap::new()),
                dispatcher: Mutex::new(None),
                functions: Mutex::new(None),
                blobs,
                flow_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Wire in the continuation dispatcher; stages that need one before it
    /// is set resolve to a platform failure.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn ContinuationDispatcher>) {
        *self.inner.dispatcher.lock().expect("dispatcher lock") = Some(dispatcher);
    }

    /// Wire in the backend answering `invoke_function` stages.
    pub fn set_function_backend(&self, backend: Arc<dyn FunctionBackend>) {
        *self.inner.functions.lock().expect("functions lock") = Some(backend);
    }

    /// Act as an external caller hitting a completion or failure URL.
    /// Returns `false` when the stage was already resolved.
    pub async fn post_external(&self, url: &str, headers: rill_types::Headers, body: Vec<u8>) -> Result<bool, FlowError> {
        let (flow_id, stage_id, completing) = parse_external_url(url)?;
        let info = rill_types::HttpRequestInfo::new(rill_types::HttpMethod::Post, headers, body);
        let wire = HttpReq::from_info(self.inner.blobs.as_ref(), flow_id.as_str(), &info).await?;
        let value = if completing {
            CompletionResult::success(Datum::HttpReq(wire))
        } else {
            CompletionResult::failure(Datum::HttpReq(wire))
        };
        if completing {
            self.complete_stage(&flow_id, &stage_id, value).await
        } else {
            self.fail_stage(&flow_id, &stage_id, value).await
        }
    }
}

impl Inner {
    fn new_stage(&self, flow_id: &FlowId, external: bool) -> Result<StageId, FlowError> {
        let mut flows = self.flows.lock().expect("flows lock");
        let graph = flows
            .get_mut(flow_id)
            .ok_or_else(|| FlowError::platform(format!("no flow '{flow_id}'")))?;
        let stage_id = StageId::new(format!("stage-{}", graph.next_stage));
        graph.next_stage += 1;
        let (tx, _rx) = watch::channel(None);
        graph.stages.insert(stage_id.clone(), StageNode { external, tx });
        Ok(stage_id)
    }

    fn subscribe(&self, flow_id: &FlowId, stage_id: &StageId) -> Result<watch::Receiver<Option<CompletionResult>>, FlowError> {
        let flows = self.flows.lock().expect("flows lock");
        let graph = flows
            .get(flow_id)
            .ok_or_else(|| FlowError::platform(format!("no flow '{flow_id}'")))?;
        let node = graph
            .stages
            .get(stage_id)
            .ok_or_else(|| FlowError::stage_lost(format!("no stage '{stage_id}' in flow '{flow_id}'")))?;
        Ok(node.tx.subscribe())
    }

    /// Resolve a stage exactly once. Later resolutions are rejected.
    fn resolve(&self, flow_id: &FlowId, stage_id: &StageId, result: CompletionResult) -> bool {
        let flows = self.flows.lock().expect("flows lock");
        let Some(node) = flows.get(flow_id).and_then(|graph| graph.stages.get(stage_id)) else {
            return false;
        };
        if node.tx.borrow().is_some() {
            warn!(%flow_id, %stage_id, "rejecting second resolution of stage");
            return false;
        }
        node.tx.send_replace(Some(result));
        true
    }

    /// Wait for a stage's resolution; infrastructure problems surface as a
    /// failed result rather than a transport error.
    async fn wait_result(&self, flow_id: &FlowId, stage_id: &StageId) -> CompletionResult {
        let mut rx = match self.subscribe(flow_id, stage_id) {
            Ok(rx) => rx,
            Err(err) => return failure_of(&err),
        };
        let resolved = rx.wait_for(|value| value.is_some()).await;
        match resolved {
            Ok(value) => value.clone().expect("resolved stage carries a result"),
            Err(_) => failure_of(&FlowError::platform(format!("stage '{stage_id}' channel closed"))),
        }
    }

    async fn invoke_continuation(
        &self,
        flow_id: &FlowId,
        stage_id: &StageId,
        closure: Option<BlobRef>,
        args: Vec<CompletionResult>,
    ) -> CompletionResult {
        let Some(closure) = closure else {
            return failure_of(&FlowError::invalid_stage_response(format!(
                "stage '{stage_id}' has no continuation to run"
            )));
        };
        let dispatcher = self.dispatcher.lock().expect("dispatcher lock").clone();
        let Some(dispatcher) = dispatcher else {
            return failure_of(&FlowError::platform("no continuation dispatcher attached"));
        };
        let response = dispatcher
            .dispatch(InvokeStageRequest {
                flow_id: flow_id.clone(),
                stage_id: stage_id.clone(),
                closure,
                args,
            })
            .await;
        response.result
    }

    /// Follow successful stage-reference results until a concrete datum
    /// appears, adopting the referenced stage's outcome.
    async fn adopt_stage_refs(&self, flow_id: &FlowId, mut result: CompletionResult) -> CompletionResult {
        loop {
            let next = match &result.datum {
                Datum::StageRef { stage_id } if result.successful => stage_id.clone(),
                _ => return result,
            };
            result = self.wait_result(flow_id, &next).await;
        }
    }

    /// Wait for both dependencies; the first-completing failure wins.
    async fn both_or_first_failure(
        &self,
        flow_id: &FlowId,
        left: &StageId,
        right: &StageId,
    ) -> Result<(CompletionResult, CompletionResult), CompletionResult> {
        let left_wait = Box::pin(self.wait_result(flow_id, left));
        let right_wait = Box::pin(self.wait_result(flow_id, right));
        match select(left_wait, right_wait).await {
            Either::Left((l, right_rest)) => {
                if !l.successful {
                    return Err(l);
                }
                let r = right_rest.await;
                if !r.successful { Err(r) } else { Ok((l, r)) }
            }
            Either::Right((r, left_rest)) => {
                if !r.successful {
                    return Err(r);
                }
                let l = left_rest.await;
                if !l.successful { Err(l) } else { Ok((l, r)) }
            }
        }
    }

    /// First resolution across the dependencies, success or failure.
    async fn first_resolution(&self, flow_id: &FlowId, deps: &[StageId]) -> CompletionResult {
        let waits: Vec<Pin<Box<dyn Future<Output = CompletionResult> + Send + '_>>> = deps
            .iter()
            .map(|dep| Box::pin(self.wait_result(flow_id, dep)) as Pin<Box<dyn Future<Output = CompletionResult> + Send + '_>>)
            .collect();
        let (result, _index, _rest) = select_all(waits).await;
        result
    }

    async fn compute(
        &self,
        flow_id: &FlowId,
        stage_id: &StageId,
        operation: StageOperation,
        closure: Option<BlobRef>,
        deps: &[StageId],
    ) -> CompletionResult {
        use StageOperation::*;

        match operation {
            Supply => {
                let invoked = self.invoke_continuation(flow_id, stage_id, closure, Vec::new()).await;
                self.adopt_stage_refs(flow_id, invoked).await
            }
            ThenApply | ThenAccept | ThenCompose => {
                let dep = self.wait_result(flow_id, &deps[0]).await;
                if !dep.successful {
                    return dep;
                }
                let invoked = self.invoke_continuation(flow_id, stage_id, closure, vec![dep]).await;
                self.adopt_stage_refs(flow_id, invoked).await
            }
            ThenRun => {
                let dep = self.wait_result(flow_id, &deps[0]).await;
                if !dep.successful {
                    return dep;
                }
                self.invoke_continuation(flow_id, stage_id, closure, Vec::new()).await
            }
            Exceptionally | ExceptionallyCompose => {
                let dep = self.wait_result(flow_id, &deps[0]).await;
                if dep.successful {
                    return dep;
                }
                let invoked = self.invoke_continuation(flow_id, stage_id, closure, vec![dep]).await;
                self.adopt_stage_refs(flow_id, invoked).await
            }
            Handle => {
                let dep = self.wait_result(flow_id, &deps[0]).await;
                let (value, error) = split_outcome(dep);
                let invoked = self.invoke_continuation(flow_id, stage_id, closure, vec![value, error]).await;
                self.adopt_stage_refs(flow_id, invoked).await
            }
            WhenComplete => {
                let dep = self.wait_result(flow_id, &deps[0]).await;
                let (value, error) = split_outcome(dep.clone());
                let observed = self.invoke_continuation(flow_id, stage_id, closure, vec![value, error]).await;
                // The observer preserves the outcome unless it failed itself.
                if observed.successful { dep } else { observed }
            }
            ThenCombine | ThenAcceptBoth => match self.both_or_first_failure(flow_id, &deps[0], &deps[1]).await {
                Ok((left, right)) => {
                    let invoked = self.invoke_continuation(flow_id, stage_id, closure, vec![left, right]).await;
                    self.adopt_stage_refs(flow_id, invoked).await
                }
                Err(failure) => failure,
            },
            ApplyToEither | AcceptEither => {
                let first = self.first_resolution(flow_id, deps).await;
                if !first.successful {
                    return first;
                }
                let invoked = self.invoke_continuation(flow_id, stage_id, closure, vec![first]).await;
                self.adopt_stage_refs(flow_id, invoked).await
            }
            AllOf => {
                let mut waits: Vec<Pin<Box<dyn Future<Output = CompletionResult> + Send + '_>>> = deps
                    .iter()
                    .map(|dep| {
                        Box::pin(self.wait_result(flow_id, dep)) as Pin<Box<dyn Future<Output = CompletionResult> + Send + '_>>
                    })
                    .collect();
                while !waits.is_empty() {
                    let (result, _index, rest) = select_all(waits).await;
                    if !result.successful {
                        return result;
                    }
                    waits = rest;
                }
                CompletionResult::success(Datum::empty())
            }
            AnyOf => self.first_resolution(flow_id, deps).await,
            CompletedValue | Delay | InvokeFunction | ExternalCompletion | TerminationHook => failure_of(
                &FlowError::invalid_stage_response(format!("operation '{}' is not continuation-driven", operation.as_str())),
            ),
        }
    }
}

fn spawn_driver(
    inner: Arc<Inner>,
    flow_id: FlowId,
    stage_id: StageId,
    operation: StageOperation,
    closure: Option<BlobRef>,
    deps: Vec<StageId>,
) {
    tokio::spawn(async move {
        let result = inner.compute(&flow_id, &stage_id, operation, closure, &deps).await;
        inner.resolve(&flow_id, &stage_id, result);
    });
}

#[async_trait]
impl CompleterClient for InMemCompleter {
    async fn create_flow(&self, function_id: &str) -> Result<FlowId, FlowError> {
        let flow_id = FlowId::new(format!("flow-{}", self.inner.flow_counter.fetch_add(1, Ordering::Relaxed)));
        debug!(%flow_id, function_id, "creating in-memory flow");
        self.inner
            .flows
            .lock()
            .expect("flows lock")
            .insert(flow_id.clone(), FlowGraph::new());
        Ok(flow_id)
    }

    async fn add_stage(&self, flow_id: &FlowId, request: AddStageRequest) -> Result<StageId, FlowError> {
        let expected_deps: usize = match request.operation {
            StageOperation::Supply => 0,
            StageOperation::TerminationHook => 0,
            StageOperation::ThenCombine | StageOperation::ThenAcceptBoth => 2,
            StageOperation::ApplyToEither | StageOperation::AcceptEither => 2,
            StageOperation::AllOf | StageOperation::AnyOf => {
                if request.deps.is_empty() {
                    return Err(FlowError::invalid_stage_response("at least one dependency required"));
                }
                request.deps.len()
            }
            StageOperation::CompletedValue
            | StageOperation::Delay
            | StageOperation::InvokeFunction
            | StageOperation::ExternalCompletion => {
                return Err(FlowError::invalid_stage_response(format!(
                    "operation '{}' has a dedicated creation call",
                    request.operation.as_str()
                )));
            }
            _ => 1,
        };
        if request.deps.len() != expected_deps {
            return Err(FlowError::invalid_stage_response(format!(
                "operation '{}' expects {} dependencies, got {}",
                request.operation.as_str(),
                expected_deps,
                request.deps.len()
            )));
        }

        // Dependencies must already exist; no forward references, no cycles.
        for dep in &request.deps {
            self.inner.subscribe(flow_id, dep)?;
        }

        if request.operation == StageOperation::TerminationHook {
            let closure = request
                .closure
                .ok_or_else(|| FlowError::invalid_stage_response("termination hook requires a continuation"))?;
            let mut flows = self.inner.flows.lock().expect("flows lock");
            let graph = flows
                .get_mut(flow_id)
                .ok_or_else(|| FlowError::platform(format!("no flow '{flow_id}'")))?;
            let stage_id = StageId::new(format!("stage-{}", graph.next_stage));
            graph.next_stage += 1;
            graph.hooks.push(closure);
            return Ok(stage_id);
        }

        let stage_id = self.inner.new_stage(flow_id, false)?;
        spawn_driver(
            Arc::clone(&self.inner),
            flow_id.clone(),
            stage_id.clone(),
            request.operation,
            request.closure,
            request.deps,
        );
        Ok(stage_id)
    }

    async fn add_value_stage(&self, flow_id: &FlowId, value: CompletionResult) -> Result<StageId, FlowError> {
        let stage_id = self.inner.new_stage(flow_id, false)?;
        self.inner.resolve(flow_id, &stage_id, value);
        Ok(stage_id)
    }

    async fn add_delay_stage(&self, flow_id: &FlowId, delay_ms: u64) -> Result<StageId, FlowError> {
        let stage_id = self.inner.new_stage(flow_id, false)?;
        let inner = Arc::clone(&self.inner);
        let flow = flow_id.clone();
        let stage = stage_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            inner.resolve(&flow, &stage, CompletionResult::success(Datum::empty()));
        });
        Ok(stage_id)
    }

    async fn add_invoke_function_stage(&self, flow_id: &FlowId, function_id: &str, arg: HttpReq) -> Result<StageId, FlowError> {
        let stage_id = self.inner.new_stage(flow_id, false)?;
        let inner = Arc::clone(&self.inner);
        let flow = flow_id.clone();
        let stage = stage_id.clone();
        let function_id = function_id.to_string();
        tokio::spawn(async move {
            let backend = inner.functions.lock().expect("functions lock").clone();
            let result = match backend {
                None => failure_of(&FlowError::platform("no function backend attached")),
                Some(backend) => match arg.into_info(inner.blobs.as_ref(), flow.as_str()).await {
                    Err(err) => failure_of(&err),
                    Ok(request) => match backend.invoke(&function_id, request).await {
                        Err(err) => failure_of(&err),
                        Ok(response) => {
                            let successful = response.is_success();
                            match HttpResp::from_info(inner.blobs.as_ref(), flow.as_str(), &response).await {
                                Err(err) => failure_of(&err),
                                Ok(wire) => CompletionResult {
                                    successful,
                                    datum: Datum::HttpResp(wire),
                                },
                            }
                        }
                    },
                },
            };
            inner.resolve(&flow, &stage, result);
        });
        Ok(stage_id)
    }

    async fn create_external_stage(&self, flow_id: &FlowId) -> Result<ExternalCompletion, FlowError> {
        let stage_id = self.inner.new_stage(flow_id, true)?;
        Ok(ExternalCompletion {
            stage_id: stage_id.clone(),
            completion_url: format!("inmem://flows/{flow_id}/stages/{stage_id}/complete"),
            failure_url: format!("inmem://flows/{flow_id}/stages/{stage_id}/fail"),
        })
    }

    async fn complete_stage(&self, flow_id: &FlowId, stage_id: &StageId, value: CompletionResult) -> Result<bool, FlowError> {
        self.resolve_external(flow_id, stage_id, value)
    }

    async fn fail_stage(&self, flow_id: &FlowId, stage_id: &StageId, value: CompletionResult) -> Result<bool, FlowError> {
        self.resolve_external(flow_id, stage_id, value)
    }

    async fn await_stage(
        &self,
        flow_id: &FlowId,
        stage_id: &StageId,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, FlowError> {
        let mut rx = self.inner.subscribe(flow_id, stage_id)?;
        let wait = async {
            let value = rx
                .wait_for(|value| value.is_some())
                .await
                .map_err(|_| FlowError::platform(format!("stage '{stage_id}' channel closed")))?;
            Ok::<_, FlowError>(value.clone().expect("resolved stage carries a result"))
        };
        match timeout {
            None => Ok(WaitResult::Completed(wait.await?)),
            Some(duration) => match tokio::time::timeout(duration, wait).await {
                Ok(result) => Ok(WaitResult::Completed(result?)),
                Err(_) => Ok(WaitResult::TimedOut),
            },
        }
    }

    async fn commit(&self, flow_id: &FlowId) -> Result<(), FlowError> {
        let hooks = {
            let mut flows = self.inner.flows.lock().expect("flows lock");
            let graph = flows
                .get_mut(flow_id)
                .ok_or_else(|| FlowError::platform(format!("no flow '{flow_id}'")))?;
            if graph.hooks_fired {
                return Ok(());
            }
            graph.hooks_fired = true;
            std::mem::take(&mut graph.hooks)
        };

        let terminal = CompletionResult::success(Datum::status(FlowState::Succeeded));
        for (index, closure) in hooks.into_iter().enumerate() {
            let hook_stage = StageId::new(format!("hook-{index}"));
            debug!(%flow_id, %hook_stage, "firing termination hook");
            let _ = self
                .inner
                .invoke_continuation(flow_id, &hook_stage, Some(closure), vec![terminal.clone()])
                .await;
        }
        Ok(())
    }
}

impl InMemCompleter {
    fn resolve_external(&self, flow_id: &FlowId, stage_id: &StageId, value: CompletionResult) -> Result<bool, FlowError> {
        {
            let flows = self.inner.flows.lock().expect("flows lock");
            let node = flows
                .get(flow_id)
                .and_then(|graph| graph.stages.get(stage_id))
                .ok_or_else(|| FlowError::stage_lost(format!("no stage '{stage_id}' in flow '{flow_id}'")))?;
            if !node.external {
                return Err(FlowError::invalid_stage_response(format!(
                    "stage '{stage_id}' is not externally completable"
                )));
            }
        }
        Ok(self.inner.resolve(flow_id, stage_id, value))
    }
}

fn failure_of(err: &FlowError) -> CompletionResult {
    CompletionResult::failure(Datum::error(ErrorDatumKind::from_flow_error(err), err.to_string()))
}

/// Split a resolution into the `(value, error)` argument pair delivered to
/// `handle`/`when_complete` continuations.
fn split_outcome(result: CompletionResult) -> (CompletionResult, CompletionResult) {
    if result.successful {
        (result, CompletionResult::success(Datum::empty()))
    } else {
        (CompletionResult::success(Datum::empty()), result)
    }
}

fn parse_external_url(url: &str) -> Result<(FlowId, StageId, bool), FlowError> {
    let rest = url
        .strip_prefix("inmem://flows/")
        .ok_or_else(|| FlowError::invalid_stage_response(format!("not an in-memory completion URL: '{url}'")))?;
    let mut parts = rest.split('/');
    let flow = parts.next();
    let stages = parts.next();
    let stage = parts.next();
    let terminal = parts.next();
    match (flow, stages, stage, terminal, parts.next()) {
        (Some(flow), Some("stages"), Some(stage), Some("complete"), None) => {
            Ok((FlowId::new(flow), StageId::new(stage), true))
        }
        (Some(flow), Some("stages"), Some(stage), Some("fail"), None) => Ok((FlowId::new(flow), StageId::new(stage), false)),
        _ => Err(FlowError::invalid_stage_response(format!(
            "not an in-memory completion URL: '{url}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_urls_parse_back_to_their_stage() {
        let (flow, stage, completing) = parse_external_url("inmem://flows/flow-0/stages/stage-3/complete").expect("parse");
        assert_eq!(flow, FlowId::new("flow-0"));
        assert_eq!(stage, StageId::new("stage-3"));
        assert!(completing);

        let (_, _, completing) = parse_external_url("inmem://flows/flow-0/stages/stage-3/fail").expect("parse");
        assert!(!completing);

        assert!(parse_external_url("https://elsewhere/complete").is_err());
        assert!(parse_external_url("inmem://flows/f/stages/s/complete/extra").is_err());
    }

    #[test]
    fn split_outcome_fills_exactly_one_slot() {
        let success = CompletionResult::success(Datum::empty());
        let (value, error) = split_outcome(success.clone());
        assert!(value.successful);
        assert!(error.successful);

        let failure = CompletionResult::failure(Datum::error(ErrorDatumKind::UnknownError, "boom"));
        let (value, error) = split_outcome(failure.clone());
        assert!(value.successful);
        assert!(!error.successful);
        assert_eq!(error, failure);
    }
}
