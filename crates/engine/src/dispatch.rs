//! Continuation dispatch: handling a completer callback inside the
//! container.
//!
//! The completer re-enters the function container with an
//! [`InvokeStageRequest`] naming a stage, its closure blob, and one result
//! per dependency. The invoker resolves the closure to a registered
//! handler, feeds it the decoded arguments, and answers with a single
//! [`InvokeStageResponse`]. Every failure mode (unknown handler, arity
//! mismatch, user fault) is reported as an error result, never as a
//! transport-level failure, and nothing is retried here.

use std::sync::Arc;

use tracing::{debug, warn};

use rill_client::protocol::{CompletionResult, Datum, ErrorDatumKind, InvokeStageRequest, InvokeStageResponse};
use rill_types::{FlowError, WrappedError};

use crate::{
    codec::{self, Continuation, HandlerRegistry},
    flow::Flow,
};

/// Invoker handling flow-stage callbacks for one process.
pub struct ContinuationInvoker {
    registry: Arc<HandlerRegistry>,
}

impl ContinuationInvoker {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Run one dispatch callback to completion. The `flow` must be attached
    /// to the id named in the request.
    pub async fn invoke_stage(&self, flow: &Flow, request: InvokeStageRequest) -> InvokeStageResponse {
        debug!(flow_id = %request.flow_id, stage_id = %request.stage_id, args = request.args.len(), "dispatching continuation");
        let result = match self.try_invoke(flow, &request).await {
            Ok(result) => result,
            Err(err) => {
                warn!(stage_id = %request.stage_id, %err, "continuation dispatch failed");
                CompletionResult::failure(error_datum(&err))
            }
        };
        InvokeStageResponse { result }
    }

    async fn try_invoke(&self, flow: &Flow, request: &InvokeStageRequest) -> Result<CompletionResult, FlowError> {
        let closure = &request.closure;
        if closure.content_type != rill_client::protocol::CONTENT_TYPE_CONTINUATION {
            return Err(FlowError::invalid_stage_response(format!(
                "closure content type '{}' is not a continuation descriptor",
                closure.content_type
            )));
        }

        let bytes = flow
            .blobs()
            .read_blob(request.flow_id.as_str(), &closure.blob_id, &closure.content_type)
            .await?;
        let continuation = Continuation::decode(&bytes)?;

        let handler = self.registry.resolve(&continuation.handler_id).ok_or_else(|| {
            FlowError::invalid_stage_response(format!("no handler registered for '{}'", continuation.handler_id))
        })?;

        if handler.arity() != request.args.len() {
            return Err(FlowError::invalid_stage_response(format!(
                "handler '{}' takes {} argument(s) but the completer delivered {}",
                continuation.handler_id,
                handler.arity(),
                request.args.len()
            )));
        }

        let mut args = Vec::with_capacity(request.args.len());
        for result in &request.args {
            args.push(codec::decode_result(flow.blobs().as_ref(), &request.flow_id, result).await?);
        }

        match handler.invoke(flow, continuation.state, args).await {
            Ok(output) => {
                let datum = codec::encode_output(flow.blobs().as_ref(), &request.flow_id, output).await?;
                Ok(CompletionResult::success(datum))
            }
            Err(fault) => Ok(self.encode_user_fault(flow, request, fault).await),
        }
    }

    /// A user fault travels as data; if even that fails to store, fall back
    /// to an inline error datum so the failure is never dropped.
    async fn encode_user_fault(&self, flow: &Flow, request: &InvokeStageRequest, fault: WrappedError) -> CompletionResult {
        match codec::encode_fault(flow.blobs().as_ref(), &request.flow_id, &fault).await {
            Ok(datum) => CompletionResult::failure(datum),
            Err(store_err) => {
                warn!(stage_id = %request.stage_id, %store_err, "failed to store user fault; inlining");
                CompletionResult::failure(Datum::error(ErrorDatumKind::UnknownError, fault.to_string()))
            }
        }
    }
}

fn error_datum(err: &FlowError) -> Datum {
    Datum::error(ErrorDatumKind::from_flow_error(err), err.to_string())
}
