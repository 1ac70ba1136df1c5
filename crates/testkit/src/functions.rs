//! Stub backend for outbound function invocations.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use rill_types::{FlowError, HttpRequestInfo, HttpResponseInfo};

/// Target of `invoke_function` stages: something that can answer an HTTP
/// request addressed to a function id.
#[async_trait]
pub trait FunctionBackend: Send + Sync {
    async fn invoke(&self, function_id: &str, request: HttpRequestInfo) -> Result<HttpResponseInfo, FlowError>;
}

/// Canned-response backend. Functions without a registered response are
/// treated as unreachable.
#[derive(Default)]
pub struct StubFunctionBackend {
    responses: Mutex<HashMap<String, HttpResponseInfo>>,
}

impl StubFunctionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(&self, function_id: impl Into<String>, response: HttpResponseInfo) {
        self.responses
            .lock()
            .expect("stub backend lock")
            .insert(function_id.into(), response);
    }
}

#[async_trait]
impl FunctionBackend for StubFunctionBackend {
    async fn invoke(&self, function_id: &str, _request: HttpRequestInfo) -> Result<HttpResponseInfo, FlowError> {
        let responses = self.responses.lock().expect("stub backend lock");
        responses
            .get(function_id)
            .cloned()
            .ok_or_else(|| FlowError::function_invoke_failed(format!("no route to function '{function_id}'")))
    }
}
