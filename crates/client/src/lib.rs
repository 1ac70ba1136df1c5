//! Completer API client utilities.
//!
//! This crate provides the HTTP plumbing for talking to the completer
//! service. It focuses on:
//!
//! - Constructing an HTTP client with sensible defaults
//! - Resolving and validating the completer base URL from `COMPLETER_BASE_URL`
//! - The wire model for every protocol body ([`protocol`])
//! - Blob store access ([`blobs`]) and the stage-graph operations
//!   ([`completer`])
//!
//! The primary entry point is [`CompleterApiClient`]. Create an instance via
//! [`CompleterApiClient::from_env`] (or [`CompleterApiClient::new`] with an
//! explicit base), then hand it to a
//! [`RemoteCompleter`](completer::RemoteCompleter).

use std::time::Duration;

use reqwest::RequestBuilder;
use tracing::debug;
use url::Url;

use rill_types::FlowError;

pub mod blobs;
pub mod completer;
pub mod protocol;

pub use blobs::{BlobStoreClient, RemoteBlobStore};
pub use completer::{CompleterClient, RemoteCompleter, WaitResult};

/// Environment variable naming the completer base URL.
pub const COMPLETER_BASE_URL_VAR: &str = "COMPLETER_BASE_URL";

/// Default base when the environment does not say otherwise.
const DEFAULT_COMPLETER_BASE_URL: &str = "http://completer-svc:8081";

/// Versioned API prefix appended to the base URL.
const API_PATH: &str = "/v1";

/// Blob store prefix appended to the base URL.
const BLOBS_PATH: &str = "/blobs";

/// Hostnames allowed to use plain HTTP for local development.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

/// Default timeout for plain protocol calls. Await requests override this
/// per-request since they long-poll.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin wrapper around a configured `reqwest::Client` for completer access.
///
/// The client pre-configures a request timeout and builds requests against
/// a validated base URL. One instance is shared by the protocol client and
/// the blob store client.
#[derive(Debug, Clone)]
pub struct CompleterApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl CompleterApiClient {
    /// Construct a client for an explicit base URL.
    ///
    /// Non-localhost hosts must use HTTPS; `localhost`/`127.0.0.1` may use
    /// any scheme.
    pub fn new(base_url: impl Into<String>) -> Result<Self, FlowError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        validate_base_url(&base_url)?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FlowError::platform(format!("failed to build http client: {e}")))?;

        Ok(Self { base_url, http })
    }

    /// Construct a client from `COMPLETER_BASE_URL`, falling back to the
    /// compiled-in default.
    pub fn from_env() -> Result<Self, FlowError> {
        let base = std::env::var(COMPLETER_BASE_URL_VAR).unwrap_or_else(|_| DEFAULT_COMPLETER_BASE_URL.to_string());
        Self::new(base)
    }

    /// Base for the versioned protocol endpoints.
    pub fn api_base(&self) -> String {
        format!("{}{}", self.base_url, API_PATH)
    }

    /// Base for the blob store endpoints.
    pub fn blobs_base(&self) -> String {
        format!("{}{}", self.base_url, BLOBS_PATH)
    }

    /// The shared underlying HTTP client.
    pub fn http(&self) -> reqwest::Client {
        self.http.clone()
    }

    /// Build a request for a method and API-relative path.
    pub fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.api_base(), path);
        debug!(%url, "building completer request");
        self.http.request(method, url)
    }

    /// A blob store client sharing this client's connection pool.
    pub fn blob_store(&self) -> RemoteBlobStore {
        RemoteBlobStore::new(self.blobs_base(), self.http())
    }
}

/// Validate that a base URL is acceptable for use by the client.
///
/// Rules:
/// - `localhost` or `127.0.0.1`: any scheme is allowed
/// - otherwise: scheme must be HTTPS and the URL must include a host
fn validate_base_url(base: &str) -> Result<(), FlowError> {
    let parsed = Url::parse(base).map_err(|e| FlowError::platform(format!("invalid completer base URL '{base}': {e}")))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| FlowError::platform(format!("completer base URL '{base}' must include a host")))?;

    if LOCALHOST_DOMAINS.iter().any(|&allowed| host.eq_ignore_ascii_case(allowed)) {
        return Ok(());
    }

    // Docker-style single-label service names stay inside the deployment
    // network and are exempt from the HTTPS rule as well.
    if !host.contains('.') {
        return Ok(());
    }

    if parsed.scheme() != "https" {
        return Err(FlowError::platform(format!(
            "completer base URL must use https for non-local hosts; got '{}://'",
            parsed.scheme()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_localhost_over_plain_http() {
        assert!(CompleterApiClient::new("http://localhost:8081").is_ok());
        assert!(CompleterApiClient::new("http://127.0.0.1:8081/").is_ok());
    }

    #[test]
    fn accepts_single_label_service_hosts() {
        assert!(CompleterApiClient::new("http://completer-svc:8081").is_ok());
    }

    #[test]
    fn rejects_plain_http_for_public_hosts() {
        let err = CompleterApiClient::new("http://completer.example.com").unwrap_err();
        assert!(matches!(err, FlowError::Platform { .. }));
    }

    #[test]
    fn rejects_unparseable_urls() {
        assert!(CompleterApiClient::new("not a url").is_err());
    }

    #[test]
    fn trims_trailing_slash_before_joining_paths() {
        let client = CompleterApiClient::new("http://localhost:8081/").expect("client");
        assert_eq!(client.api_base(), "http://localhost:8081/v1");
        assert_eq!(client.blobs_base(), "http://localhost:8081/blobs");
    }

    #[test]
    fn from_env_honors_override() {
        temp_env::with_var(COMPLETER_BASE_URL_VAR, Some("http://localhost:9999"), || {
            let client = CompleterApiClient::from_env().expect("client");
            assert_eq!(client.api_base(), "http://localhost:9999/v1");
        });
    }

    #[test]
    fn from_env_falls_back_to_default() {
        temp_env::with_var(COMPLETER_BASE_URL_VAR, None::<&str>, || {
            let client = CompleterApiClient::from_env().expect("client");
            assert_eq!(client.api_base(), "http://completer-svc:8081/v1");
        });
    }
}
