//! Error taxonomy for the stage-graph client.
//!
//! One tagged enum covers every failure the graph can propagate, from
//! local serialization problems to completer-reported invocation
//! ambiguity. Callers match on the kind; there is no subclass tree to
//! walk.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{HttpRequestInfo, HttpResponseInfo};

/// Every failure kind a stage or a graph operation can produce.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    /// A continuation or captured value could not be serialized. Raised
    /// locally, before any request leaves the process.
    #[error("continuation serialization failed: {message}")]
    ContinuationSerialization { message: String },

    /// A resolved datum could not be decoded into the requested type.
    #[error("result deserialization failed: {message}")]
    ResultSerialization { message: String },

    /// The target function was reached but answered with a non-success
    /// outcome. The full response is retained for inspection.
    #[error("function invocation returned status {}", .response.status_code)]
    FunctionInvocation { response: HttpResponseInfo },

    /// The completer gave up waiting for the target function.
    #[error("function invocation timed out: {message}")]
    FunctionTimeout { message: String },

    /// The completer could not reach the target function at all; there is
    /// no response to carry.
    #[error("function invocation failed: {message}")]
    FunctionInvokeFailed { message: String },

    /// The completer reports the stage invocation failed. The continuation
    /// may or may not have run; never retried here.
    #[error("stage invocation failed: {message}")]
    StageInvokeFailed { message: String },

    /// The completer lost track of the stage (crash-recovery ambiguity).
    #[error("stage lost: {message}")]
    StageLost { message: String },

    /// The completer timed the stage out.
    #[error("stage timed out: {message}")]
    StageTimeout { message: String },

    /// The container answered a dispatch callback with something the
    /// completer could not accept.
    #[error("invalid stage response: {message}")]
    InvalidStageResponse { message: String },

    /// Completer or transport failure. The message is remote in origin;
    /// no local backtrace is attached.
    #[error("platform error: {message}")]
    Platform { message: String },

    /// The stage was resolved through its failure URL; carries the
    /// resolving request.
    #[error("stage failed via its external failure URL")]
    ExternalCompletion { request: HttpRequestInfo },

    /// A user continuation failed; the fault travels as data.
    #[error(transparent)]
    Wrapped(#[from] WrappedError),
}

impl FlowError {
    pub fn continuation_serialization(message: impl Into<String>) -> Self {
        Self::ContinuationSerialization { message: message.into() }
    }

    pub fn result_serialization(message: impl Into<String>) -> Self {
        Self::ResultSerialization { message: message.into() }
    }

    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform { message: message.into() }
    }

    pub fn stage_invoke_failed(message: impl Into<String>) -> Self {
        Self::StageInvokeFailed { message: message.into() }
    }

    pub fn stage_lost(message: impl Into<String>) -> Self {
        Self::StageLost { message: message.into() }
    }

    pub fn stage_timeout(message: impl Into<String>) -> Self {
        Self::StageTimeout { message: message.into() }
    }

    pub fn function_timeout(message: impl Into<String>) -> Self {
        Self::FunctionTimeout { message: message.into() }
    }

    pub fn function_invoke_failed(message: impl Into<String>) -> Self {
        Self::FunctionInvokeFailed { message: message.into() }
    }

    pub fn invalid_stage_response(message: impl Into<String>) -> Self {
        Self::InvalidStageResponse { message: message.into() }
    }
}

/// A user-code failure captured as plain data: original type name,
/// message, and whatever trace text was available. Never reconstructed
/// into a native error chain on the other side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{type_name}: {message}")]
pub struct WrappedError {
    pub type_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl WrappedError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            backtrace: None,
        }
    }

    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        self.backtrace = Some(backtrace.into());
        self
    }

    /// Capture an arbitrary error value, preserving its concrete type name
    /// as diagnostic data.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self::new(std::any::type_name::<E>(), error.to_string())
    }
}

/// Top-level wrapper surfaced by `get`: whatever went wrong anywhere in
/// the graph arrives as the single `cause`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("stage completed exceptionally: {cause}")]
pub struct FlowCompletionError {
    pub cause: FlowError,
}

impl FlowCompletionError {
    pub fn new(cause: FlowError) -> Self {
        Self { cause }
    }
}

impl From<FlowError> for FlowCompletionError {
    fn from(cause: FlowError) -> Self {
        Self { cause }
    }
}

/// Outcome of a bounded wait. A timeout abandons only the local wait; the
/// remote stage keeps running and can be observed again later.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetrievalError {
    #[error("timed out after {0:?} waiting for stage resolution")]
    WaitTimeout(Duration),

    #[error(transparent)]
    Completed(#[from] FlowCompletionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_error_round_trips_as_data() {
        let wrapped = WrappedError::new("my::Error", "boom").with_backtrace("at line 3");
        let json = serde_json::to_string(&wrapped).expect("serialize");
        let back: WrappedError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, wrapped);
    }

    #[test]
    fn wrapped_error_omits_missing_backtrace() {
        let json = serde_json::to_string(&WrappedError::new("E", "msg")).expect("serialize");
        assert!(!json.contains("backtrace"));
    }

    #[test]
    fn completion_error_displays_cause() {
        let err = FlowCompletionError::from(FlowError::platform("completer unreachable"));
        assert!(err.to_string().contains("completer unreachable"));
    }

    #[derive(Debug, Error)]
    #[error("disk gone")]
    struct DiskError;

    #[test]
    fn from_error_preserves_type_name() {
        let wrapped = WrappedError::from_error(&DiskError);
        assert!(wrapped.type_name.ends_with("DiskError"));
        assert_eq!(wrapped.message, "disk gone");
    }
}
