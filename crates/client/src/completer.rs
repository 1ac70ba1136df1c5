//! Stage-graph operations against the completer service.
//!
//! [`CompleterClient`] is the seam the stage graph talks through; the
//! in-process test double implements it too. [`RemoteCompleter`] is the
//! HTTP implementation: every operation is exactly one `POST` (plus one
//! `GET` per await poll), and a failed call is fatal only to the operation
//! that issued it; stages already created are unaffected.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use rill_types::{ExternalCompletion, FlowError, FlowId, StageId};

use crate::{
    CompleterApiClient,
    protocol::{
        AddDelayStageRequest, AddInvokeFunctionStageRequest, AddStageRequest, AddStageResponse, AddValueStageRequest,
        AwaitStageResponse, CompleteStageRequest, CompletionResult, CreateExternalStageResponse, CreateGraphRequest,
        CreateGraphResponse, HttpReq,
    },
};

/// Server-side long-poll window used when awaiting without a deadline.
const AWAIT_POLL_WINDOW: Duration = Duration::from_secs(30);

/// Slack added to the per-request timeout so the server answers first.
const AWAIT_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Outcome of awaiting a stage: resolution, or the deadline passed.
///
/// A timed-out wait abandons nothing remotely: the stage keeps running
/// and can be awaited again.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitResult {
    Completed(CompletionResult),
    TimedOut,
}

/// Operations the stage graph needs from a completer.
#[async_trait]
pub trait CompleterClient: Send + Sync {
    /// Create a new flow graph for the given function.
    async fn create_flow(&self, function_id: &str) -> Result<FlowId, FlowError>;

    /// Append a continuation-backed or dependency-only stage.
    async fn add_stage(&self, flow_id: &FlowId, request: AddStageRequest) -> Result<StageId, FlowError>;

    /// Append an already-resolved stage carrying the given result.
    async fn add_value_stage(&self, flow_id: &FlowId, value: CompletionResult) -> Result<StageId, FlowError>;

    /// Append a timer stage resolved by the completer's scheduler.
    async fn add_delay_stage(&self, flow_id: &FlowId, delay_ms: u64) -> Result<StageId, FlowError>;

    /// Append a stage that invokes another function through the completer.
    async fn add_invoke_function_stage(&self, flow_id: &FlowId, function_id: &str, arg: HttpReq) -> Result<StageId, FlowError>;

    /// Append an externally completable stage and obtain its resolution
    /// URLs.
    async fn create_external_stage(&self, flow_id: &FlowId) -> Result<ExternalCompletion, FlowError>;

    /// Resolve an externally completable stage with a success result.
    /// Returns `false` when the stage was already resolved.
    async fn complete_stage(&self, flow_id: &FlowId, stage_id: &StageId, value: CompletionResult) -> Result<bool, FlowError>;

    /// Resolve an externally completable stage with a failure result.
    /// Returns `false` when the stage was already resolved.
    async fn fail_stage(&self, flow_id: &FlowId, stage_id: &StageId, value: CompletionResult) -> Result<bool, FlowError>;

    /// Wait for a stage to resolve, bounded by `timeout` when given.
    async fn await_stage(&self, flow_id: &FlowId, stage_id: &StageId, timeout: Option<Duration>)
    -> Result<WaitResult, FlowError>;

    /// Mark the graph committed; termination hooks may fire from here on.
    async fn commit(&self, flow_id: &FlowId) -> Result<(), FlowError>;
}

/// HTTP implementation of [`CompleterClient`].
#[derive(Debug, Clone)]
pub struct RemoteCompleter {
    api: CompleterApiClient,
}

impl RemoteCompleter {
    pub fn new(api: CompleterApiClient) -> Self {
        Self { api }
    }

    async fn post_json<B: serde::Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, FlowError> {
        let response = self
            .api
            .request(Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|e| FlowError::platform(format!("completer request to '{path}' failed: {e}")))?;
        let status = response.status();
        if !is_successful(status) {
            let text = response.text().await.unwrap_or_default();
            return Err(unexpected_status(status, &text));
        }
        response
            .json()
            .await
            .map_err(|e| FlowError::platform(format!("invalid completer response from '{path}': {e}")))
    }

    async fn resolve_stage(
        &self,
        flow_id: &FlowId,
        stage_id: &StageId,
        terminal: &str,
        value: CompletionResult,
    ) -> Result<bool, FlowError> {
        let path = format!("/flows/{}/stages/{}/{}", flow_id, stage_id, terminal);
        let response = self
            .api
            .request(Method::POST, &path)
            .json(&CompleteStageRequest { value })
            .send()
            .await
            .map_err(|e| FlowError::platform(format!("completer request to '{path}' failed: {e}")))?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            // first writer already won
            return Ok(false);
        }
        if !is_successful(status) {
            let text = response.text().await.unwrap_or_default();
            return Err(unexpected_status(status, &text));
        }
        Ok(true)
    }

    async fn poll_stage(
        &self,
        flow_id: &FlowId,
        stage_id: &StageId,
        window: Duration,
    ) -> Result<WaitResult, FlowError> {
        let path = format!("/flows/{}/stages/{}/await", flow_id, stage_id);
        let response = self
            .api
            .request(Method::GET, &path)
            .query(&[("timeout_ms", window.as_millis().to_string())])
            .timeout(window + AWAIT_TIMEOUT_SLACK)
            .send()
            .await
            .map_err(|e| FlowError::platform(format!("completer await for stage '{stage_id}' failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::REQUEST_TIMEOUT {
            return Ok(WaitResult::TimedOut);
        }
        if !is_successful(status) {
            let text = response.text().await.unwrap_or_default();
            return Err(unexpected_status(status, &text));
        }
        let parsed: AwaitStageResponse = response
            .json()
            .await
            .map_err(|e| FlowError::platform(format!("invalid await response for stage '{stage_id}': {e}")))?;
        Ok(WaitResult::Completed(parsed.result))
    }
}

#[async_trait]
impl CompleterClient for RemoteCompleter {
    async fn create_flow(&self, function_id: &str) -> Result<FlowId, FlowError> {
        let response: CreateGraphResponse = self
            .post_json(
                "/flows",
                &CreateGraphRequest {
                    function_id: function_id.to_string(),
                },
            )
            .await?;
        debug!(flow_id = %response.flow_id, "created flow");
        Ok(response.flow_id)
    }

    async fn add_stage(&self, flow_id: &FlowId, request: AddStageRequest) -> Result<StageId, FlowError> {
        debug!(%flow_id, operation = request.operation.as_str(), deps = request.deps.len(), "adding stage");
        let response: AddStageResponse = self.post_json(&format!("/flows/{flow_id}/stage"), &request).await?;
        Ok(response.stage_id)
    }

    async fn add_value_stage(&self, flow_id: &FlowId, value: CompletionResult) -> Result<StageId, FlowError> {
        let response: AddStageResponse = self
            .post_json(&format!("/flows/{flow_id}/value"), &AddValueStageRequest { value })
            .await?;
        Ok(response.stage_id)
    }

    async fn add_delay_stage(&self, flow_id: &FlowId, delay_ms: u64) -> Result<StageId, FlowError> {
        let response: AddStageResponse = self
            .post_json(&format!("/flows/{flow_id}/delay"), &AddDelayStageRequest { delay_ms })
            .await?;
        Ok(response.stage_id)
    }

    async fn add_invoke_function_stage(&self, flow_id: &FlowId, function_id: &str, arg: HttpReq) -> Result<StageId, FlowError> {
        let response: AddStageResponse = self
            .post_json(
                &format!("/flows/{flow_id}/invoke"),
                &AddInvokeFunctionStageRequest {
                    function_id: function_id.to_string(),
                    arg,
                },
            )
            .await?;
        Ok(response.stage_id)
    }

    async fn create_external_stage(&self, flow_id: &FlowId) -> Result<ExternalCompletion, FlowError> {
        let response = self
            .api
            .request(Method::POST, &format!("/flows/{flow_id}/external"))
            .send()
            .await
            .map_err(|e| FlowError::platform(format!("completer request failed: {e}")))?;
        let status = response.status();
        if !is_successful(status) {
            let text = response.text().await.unwrap_or_default();
            return Err(unexpected_status(status, &text));
        }
        let parsed: CreateExternalStageResponse = response
            .json()
            .await
            .map_err(|e| FlowError::platform(format!("invalid external stage response: {e}")))?;
        Ok(ExternalCompletion {
            stage_id: parsed.stage_id,
            completion_url: parsed.completion_url,
            failure_url: parsed.failure_url,
        })
    }

    async fn complete_stage(&self, flow_id: &FlowId, stage_id: &StageId, value: CompletionResult) -> Result<bool, FlowError> {
        self.resolve_stage(flow_id, stage_id, "complete", value).await
    }

    async fn fail_stage(&self, flow_id: &FlowId, stage_id: &StageId, value: CompletionResult) -> Result<bool, FlowError> {
        self.resolve_stage(flow_id, stage_id, "fail", value).await
    }

    async fn await_stage(
        &self,
        flow_id: &FlowId,
        stage_id: &StageId,
        timeout: Option<Duration>,
    ) -> Result<WaitResult, FlowError> {
        match timeout {
            Some(deadline) => self.poll_stage(flow_id, stage_id, deadline).await,
            None => loop {
                // Poll in bounded windows so a slow stage never pins one
                // request open indefinitely.
                match self.poll_stage(flow_id, stage_id, AWAIT_POLL_WINDOW).await? {
                    WaitResult::Completed(result) => return Ok(WaitResult::Completed(result)),
                    WaitResult::TimedOut => continue,
                }
            },
        }
    }

    async fn commit(&self, flow_id: &FlowId) -> Result<(), FlowError> {
        let response = self
            .api
            .request(Method::POST, &format!("/flows/{flow_id}/commit"))
            .send()
            .await
            .map_err(|e| FlowError::platform(format!("completer commit failed: {e}")))?;
        let status = response.status();
        if !is_successful(status) {
            let text = response.text().await.unwrap_or_default();
            return Err(unexpected_status(status, &text));
        }
        Ok(())
    }
}

fn is_successful(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::CREATED
}

fn unexpected_status(status: StatusCode, body: &str) -> FlowError {
    let body = if body.is_empty() { "<empty body>" } else { body };
    FlowError::platform(format!("received unexpected response ({}) from completer: {}", status.as_u16(), body))
}
