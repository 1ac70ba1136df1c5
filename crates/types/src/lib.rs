//! Shared type definitions for the Rill stage-graph client.
//!
//! This crate holds the vocabulary the rest of the workspace speaks:
//! flow/stage identifiers, the HTTP surface types carried by
//! `invoke_function` and externally completed stages, and the error
//! taxonomy every component reports through.

use std::{error::Error, fmt, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{FlowCompletionError, FlowError, RetrievalError, WrappedError};

/// Identifier of one invocation's computation graph.
///
/// Issued by the completer when the graph is created; every subsequent
/// request names it. Carries no structure beyond being unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a single stage within a flow, unique per flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal (or not yet known) state of a whole flow, as reported to
/// termination hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowState {
    #[default]
    #[serde(rename = "unknown_state")]
    Unknown,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "killed")]
    Killed,
}

/// HTTP method for outbound function invocations, lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ParseHttpMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            "PATCH" => Ok(Self::Patch),
            _ => Err(ParseHttpMethodError),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseHttpMethodError;

impl fmt::Display for ParseHttpMethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid HTTP method")
    }
}

impl Error for ParseHttpMethodError {}

pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Ordered HTTP header collection with case-insensitive lookup.
///
/// Insertion order is preserved so requests go out the way callers built
/// them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    entries: IndexMap<String, String>,
}

impl Headers {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Set a header, replacing any value stored under the same name in any
    /// casing.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.entries.retain(|existing, _| !existing.eq_ignore_ascii_case(&key));
        self.entries.insert(key, value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(CONTENT_TYPE_HEADER)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Materialized HTTP request, as seen by an externally completed stage or
/// sent through `invoke_function`. The body has already been pulled out of
/// the blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestInfo {
    pub method: HttpMethod,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequestInfo {
    pub fn new(method: HttpMethod, headers: Headers, body: Vec<u8>) -> Self {
        Self { method, headers, body }
    }
}

/// Materialized HTTP response from an outbound function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponseInfo {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponseInfo {
    pub fn new(status_code: u16, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            status_code,
            headers,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Resolution endpoints for an externally completable stage.
///
/// Whichever URL receives a valid request first resolves the stage; the
/// completer rejects everything after that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalCompletion {
    pub stage_id: StageId,
    pub completion_url: String,
    pub failure_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_lookup_is_case_insensitive() {
        let headers = Headers::from_pairs([("Content-Type", "application/json"), ("X-Trace", "abc")]);
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("X-TRACE"), Some("abc"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn headers_set_replaces_other_casings() {
        let mut headers = Headers::from_pairs([("content-type", "text/plain")]);
        headers.set("Content-Type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.content_type(), Some("application/json"));
    }

    #[test]
    fn http_method_round_trips_through_wire_name() {
        let json = serde_json::to_string(&HttpMethod::Delete).expect("serialize");
        assert_eq!(json, "\"delete\"");
        let back: HttpMethod = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, HttpMethod::Delete);
    }

    #[test]
    fn http_method_parses_mixed_case() {
        assert_eq!("pAtCh".parse::<HttpMethod>(), Ok(HttpMethod::Patch));
        assert!("fetch".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn flow_state_wire_names() {
        let json = serde_json::to_string(&FlowState::Unknown).expect("serialize");
        assert_eq!(json, "\"unknown_state\"");
        assert_eq!(
            serde_json::from_str::<FlowState>("\"succeeded\"").expect("deserialize"),
            FlowState::Succeeded
        );
    }
}
