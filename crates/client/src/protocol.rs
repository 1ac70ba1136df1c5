//! Wire model for the completer protocol.
//!
//! Every request and response body exchanged with the completer service is
//! defined here, along with the tagged [`Datum`] representation of resolved
//! stage payloads. The shapes mirror what the service actually sends;
//! nothing in this module performs I/O except the blob-backed HTTP message
//! conversions at the bottom.

use serde::{Deserialize, Serialize};

use rill_types::{FlowError, FlowId, FlowState, Headers, HttpMethod, HttpRequestInfo, HttpResponseInfo, StageId, WrappedError};

use crate::blobs::BlobStoreClient;

/// Content type tagging serialized continuation descriptors.
pub const CONTENT_TYPE_CONTINUATION: &str = "application/vnd.rill.continuation+json";
/// Content type for plain JSON values written through the blob store.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type for wrapped user faults travelling as blob payloads.
pub const CONTENT_TYPE_ERROR: &str = "application/vnd.rill.error+json";
/// Fallback content type for opaque request/response bodies.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Reference to a write-once payload held by the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub blob_id: String,
    pub content_type: String,
    pub length: u64,
}

/// Stage operation kinds, spelled the way the completer expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageOperation {
    Supply,
    ThenApply,
    ThenCompose,
    ThenCombine,
    ThenAccept,
    ThenRun,
    ThenAcceptBoth,
    ApplyToEither,
    AcceptEither,
    Exceptionally,
    ExceptionallyCompose,
    Handle,
    WhenComplete,
    CompletedValue,
    InvokeFunction,
    Delay,
    AllOf,
    AnyOf,
    ExternalCompletion,
    TerminationHook,
}

impl StageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supply => "supply",
            Self::ThenApply => "thenApply",
            Self::ThenCompose => "thenCompose",
            Self::ThenCombine => "thenCombine",
            Self::ThenAccept => "thenAccept",
            Self::ThenRun => "thenRun",
            Self::ThenAcceptBoth => "thenAcceptBoth",
            Self::ApplyToEither => "applyToEither",
            Self::AcceptEither => "acceptEither",
            Self::Exceptionally => "exceptionally",
            Self::ExceptionallyCompose => "exceptionallyCompose",
            Self::Handle => "handle",
            Self::WhenComplete => "whenComplete",
            Self::CompletedValue => "completedValue",
            Self::InvokeFunction => "invokeFunction",
            Self::Delay => "delay",
            Self::AllOf => "allOf",
            Self::AnyOf => "anyOf",
            Self::ExternalCompletion => "externalCompletion",
            Self::TerminationHook => "terminationHook",
        }
    }
}

/// Error categories a completer can attach to an `error` datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDatumKind {
    UnknownError,
    StageTimeout,
    StageFailed,
    FunctionTimeout,
    FunctionInvokeFailed,
    StageLost,
    InvalidStageResponse,
}

impl ErrorDatumKind {
    /// The wire category a taxonomy error collapses to.
    pub fn from_flow_error(err: &FlowError) -> Self {
        match err {
            FlowError::StageTimeout { .. } => Self::StageTimeout,
            FlowError::StageInvokeFailed { .. } => Self::StageFailed,
            FlowError::FunctionTimeout { .. } => Self::FunctionTimeout,
            FlowError::FunctionInvokeFailed { .. } => Self::FunctionInvokeFailed,
            FlowError::StageLost { .. } => Self::StageLost,
            FlowError::InvalidStageResponse { .. } => Self::InvalidStageResponse,
            _ => Self::UnknownError,
        }
    }

    /// Lift a wire error category into the client taxonomy.
    pub fn into_flow_error(self, message: String) -> FlowError {
        match self {
            Self::StageTimeout => FlowError::StageTimeout { message },
            Self::StageFailed => FlowError::StageInvokeFailed { message },
            Self::FunctionTimeout => FlowError::FunctionTimeout { message },
            Self::FunctionInvokeFailed => FlowError::FunctionInvokeFailed { message },
            Self::StageLost => FlowError::StageLost { message },
            Self::InvalidStageResponse => FlowError::InvalidStageResponse { message },
            Self::UnknownError => FlowError::Platform { message },
        }
    }
}

/// HTTP request datum payload; the body lives in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpReq {
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BlobRef>,
}

/// HTTP response datum payload; the body lives in the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResp {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BlobRef>,
}

/// Resolved payload of a stage. Exactly one variant per resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datum {
    Empty {},
    Blob(BlobRef),
    StageRef {
        stage_id: StageId,
    },
    Error {
        #[serde(rename = "type")]
        kind: ErrorDatumKind,
        message: String,
    },
    HttpReq(HttpReq),
    HttpResp(HttpResp),
    Status {
        #[serde(rename = "type")]
        state: FlowState,
    },
}

impl Datum {
    pub fn empty() -> Self {
        Self::Empty {}
    }

    pub fn error(kind: ErrorDatumKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn status(state: FlowState) -> Self {
        Self::Status { state }
    }
}

/// A stage's resolution: success flag plus the datum carrying the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub successful: bool,
    pub datum: Datum,
}

impl CompletionResult {
    pub fn success(datum: Datum) -> Self {
        Self {
            successful: true,
            datum,
        }
    }

    pub fn failure(datum: Datum) -> Self {
        Self {
            successful: false,
            datum,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGraphRequest {
    pub function_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGraphResponse {
    pub flow_id: FlowId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddStageRequest {
    pub operation: StageOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closure: Option<BlobRef>,
    #[serde(default)]
    pub deps: Vec<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddStageResponse {
    pub flow_id: FlowId,
    pub stage_id: StageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddValueStageRequest {
    pub value: CompletionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddDelayStageRequest {
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddInvokeFunctionStageRequest {
    pub function_id: String,
    pub arg: HttpReq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExternalStageResponse {
    pub flow_id: FlowId,
    pub stage_id: StageId,
    pub completion_url: String,
    pub failure_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteStageRequest {
    pub value: CompletionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwaitStageResponse {
    pub result: CompletionResult,
}

/// Completer-initiated callback asking the container to run a continuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeStageRequest {
    pub flow_id: FlowId,
    pub stage_id: StageId,
    pub closure: BlobRef,
    #[serde(default)]
    pub args: Vec<CompletionResult>,
}

/// The container's answer to an [`InvokeStageRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeStageResponse {
    pub result: CompletionResult,
}

impl HttpReq {
    /// Build the wire form of a request, pushing the body into the blob
    /// store under the flow's prefix.
    pub async fn from_info(blobs: &dyn BlobStoreClient, prefix: &str, info: &HttpRequestInfo) -> Result<Self, FlowError> {
        let body = if info.body.is_empty() {
            None
        } else {
            let content_type = info.headers.content_type().unwrap_or(CONTENT_TYPE_OCTET_STREAM).to_string();
            Some(blobs.write_blob(prefix, info.body.clone(), &content_type).await?)
        };
        Ok(Self {
            method: info.method,
            headers: info.headers.clone(),
            body,
        })
    }

    /// Materialize the request, pulling the body back out of the blob store.
    pub async fn into_info(self, blobs: &dyn BlobStoreClient, prefix: &str) -> Result<HttpRequestInfo, FlowError> {
        let body = match &self.body {
            Some(blob) => blobs.read_blob(prefix, &blob.blob_id, &blob.content_type).await?,
            None => Vec::new(),
        };
        Ok(HttpRequestInfo::new(self.method, self.headers, body))
    }
}

impl HttpResp {
    pub async fn from_info(blobs: &dyn BlobStoreClient, prefix: &str, info: &HttpResponseInfo) -> Result<Self, FlowError> {
        let body = if info.body.is_empty() {
            None
        } else {
            let content_type = info.headers.content_type().unwrap_or(CONTENT_TYPE_OCTET_STREAM).to_string();
            Some(blobs.write_blob(prefix, info.body.clone(), &content_type).await?)
        };
        Ok(Self {
            status_code: info.status_code,
            headers: info.headers.clone(),
            body,
        })
    }

    pub async fn into_info(self, blobs: &dyn BlobStoreClient, prefix: &str) -> Result<HttpResponseInfo, FlowError> {
        let body = match &self.body {
            Some(blob) => blobs.read_blob(prefix, &blob.blob_id, &blob.content_type).await?,
            None => Vec::new(),
        };
        Ok(HttpResponseInfo::new(self.status_code, self.headers, body))
    }
}

/// A user fault encoded as an error-tagged blob payload.
pub fn wrapped_error_bytes(fault: &WrappedError) -> Vec<u8> {
    serde_json::to_vec(fault).unwrap_or_else(|_| b"{}".to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datum_variants_are_wrapper_tagged() {
        let json = serde_json::to_value(Datum::empty()).expect("serialize");
        assert_eq!(json, serde_json::json!({"empty": {}}));

        let json = serde_json::to_value(Datum::StageRef {
            stage_id: StageId::new("3"),
        })
        .expect("serialize");
        assert_eq!(json, serde_json::json!({"stage_ref": {"stage_id": "3"}}));
    }

    #[test]
    fn error_datum_carries_wire_kind() {
        let json = serde_json::to_value(Datum::error(ErrorDatumKind::StageLost, "gone")).expect("serialize");
        assert_eq!(json, serde_json::json!({"error": {"type": "stage_lost", "message": "gone"}}));

        let back: Datum = serde_json::from_value(json).expect("deserialize");
        match back {
            Datum::Error { kind, message } => {
                assert_eq!(kind, ErrorDatumKind::StageLost);
                assert_eq!(message, "gone");
            }
            other => panic!("unexpected datum: {other:?}"),
        }
    }

    #[test]
    fn error_kind_maps_into_taxonomy() {
        let err = ErrorDatumKind::StageFailed.into_flow_error("crashed".into());
        assert!(matches!(err, FlowError::StageInvokeFailed { .. }));

        let err = ErrorDatumKind::UnknownError.into_flow_error("???".into());
        assert!(matches!(err, FlowError::Platform { .. }));
    }

    #[test]
    fn stage_operation_wire_names() {
        let json = serde_json::to_string(&StageOperation::ThenAcceptBoth).expect("serialize");
        assert_eq!(json, "\"thenAcceptBoth\"");
        assert_eq!(StageOperation::AllOf.as_str(), "allOf");
    }

    #[test]
    fn add_stage_request_omits_absent_closure() {
        let req = AddStageRequest {
            operation: StageOperation::AllOf,
            closure: None,
            deps: vec![StageId::new("1"), StageId::new("2")],
            caller_id: None,
        };
        let json = serde_json::to_string(&req).expect("serialize");
        assert!(!json.contains("closure"));
        assert!(json.contains("\"deps\":[\"1\",\"2\"]"));
    }
}
