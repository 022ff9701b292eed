//! Authenticated request execution
//!
//! Every platform call goes through `AuthenticatedClient::execute`. It asks the
//! token manager for headers first, so a missing credential fails before any
//! round trip. A 401 from the platform invalidates the rejected token, renews
//! it once and resends the request once; a second 401 is final. Worst case is
//! two round trips plus one renewal.

use gateway_auth::{Authorization, SUBJECT_HEADER, TokenManager};
use reqwest::{Method, StatusCode};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};

/// Body of an outbound platform request.
#[derive(Debug, Clone)]
enum RequestBody {
    Empty,
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// A platform request that can be built more than once.
///
/// `reqwest::RequestBuilder` is consumed by `send()`, so the executor keeps
/// this description around to rebuild the request for the 401 retry.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add a form-encoded field. Replaces any JSON body.
    pub fn form_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let field = (key.into(), value.into());
        match &mut self.body {
            RequestBody::Form(fields) => fields.push(field),
            body => *body = RequestBody::Form(vec![field]),
        }
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// HTTP client bound to the platform base URL and the process token manager.
#[derive(Clone)]
pub struct AuthenticatedClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenManager,
}

impl AuthenticatedClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tokens: TokenManager) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// The underlying client, for calls that must not carry the bearer token.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Send `request` with credentials, renewing and retrying once on 401.
    ///
    /// Returns the response only for 2xx statuses. Other statuses become
    /// `Error::Status` with the body text preserved.
    #[instrument(
        skip_all,
        fields(
            request_id = %format!("req_{}", uuid::Uuid::new_v4().as_simple()),
            method = %request.method(),
            path = %request.path(),
        )
    )]
    pub async fn execute(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        let auth = self.tokens.authorize().await?;
        let response = self.send(request, &auth).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        let body = read_body(response).await;
        warn!(body = %body, "platform rejected token, renewing and retrying once");
        self.tokens.invalidate_if_current(&auth.access_token);

        let auth = match self.tokens.authorize().await {
            Ok(auth) => auth,
            Err(e) => {
                record_retry("renewal_failed");
                return Err(e.into());
            }
        };
        let response = self.send(request, &auth).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let body = read_body(response).await;
            record_retry("rejected");
            return Err(Error::Authentication(format!(
                "platform rejected renewed token: {body}"
            )));
        }

        record_retry("recovered");
        check_status(response).await
    }

    async fn send(&self, request: &ApiRequest, auth: &Authorization) -> Result<reqwest::Response> {
        let url = self.url_for(&request.path);
        debug!(url = %url, "sending platform request");

        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .bearer_auth(&auth.access_token)
            .header(SUBJECT_HEADER, &auth.subject_id);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Json(body) => builder.json(body),
        };

        builder.send().await.map_err(|e| {
            Error::Network(format!("{} {} failed: {e}", request.method, request.path))
        })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = read_body(response).await;
    debug!(status = status.as_u16(), "platform returned error status");
    Err(Error::Status {
        status: status.as_u16(),
        body,
    })
}

async fn read_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"))
}

fn record_retry(outcome: &'static str) {
    metrics::counter!("gateway_auth_retries_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockUpstream, start_upstream};
    use std::sync::atomic::Ordering;

    #[test]
    fn url_joining_handles_slashes() {
        let tokens = gateway_auth::TokenManager::new(
            reqwest::Client::new(),
            crate::test_support::auth_config("http://unused"),
            None,
        );
        let client = AuthenticatedClient::new(reqwest::Client::new(), "http://p/api/", tokens);
        assert_eq!(client.url_for("/get-file"), "http://p/api/get-file");
        assert_eq!(client.url_for("get-file"), "http://p/api/get-file");
    }

    #[test]
    fn form_fields_accumulate() {
        let request = ApiRequest::post("generate-upload-url")
            .form_field("file_name", "a.pdf")
            .form_field("file_size", "10");
        match request.body {
            RequestBody::Form(fields) => assert_eq!(fields.len(), 2),
            other => panic!("expected form body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn injects_bearer_and_subject_headers() {
        let (mock, client) = start_upstream().await;

        let response = client.execute(&ApiRequest::get("echo")).await.unwrap();
        let json: serde_json::Value = response.json().await.unwrap();

        assert_eq!(json["authorization"], "Bearer at-signin-1");
        assert_eq!(json["userid"], "42");
        assert_eq!(mock.platform_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_once_after_401() {
        let (mock, client) = start_upstream().await;
        mock.unauthorized_responses.store(1, Ordering::SeqCst);

        let response = client.execute(&ApiRequest::get("echo")).await.unwrap();
        assert_eq!(response.status(), 200);
        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["authorization"], "Bearer at-refresh-1");

        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.signin_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.platform_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_401_is_terminal() {
        let (mock, client) = start_upstream().await;
        mock.unauthorized_responses.store(5, Ordering::SeqCst);

        let err = client.execute(&ApiRequest::get("echo")).await.unwrap_err();

        assert!(matches!(err, Error::Authentication(_)), "got: {err:?}");
        assert_eq!(mock.platform_calls.load(Ordering::SeqCst), 2);
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_errors_propagate_with_body_and_no_retry() {
        let (mock, client) = start_upstream().await;
        mock.fail_status.store(500, Ordering::SeqCst);

        let err = client.execute(&ApiRequest::get("echo")).await.unwrap_err();

        match err {
            Error::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "upstream exploded");
            }
            other => panic!("expected status error, got {other:?}"),
        }
        assert_eq!(mock.platform_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unobtainable_token_skips_the_round_trip() {
        let (mock, base) = MockUpstream::serve().await;
        let mut config = crate::test_support::auth_config(&base);
        config.password = "wrong".into();
        let tokens = gateway_auth::TokenManager::new(reqwest::Client::new(), config, None);
        let client = AuthenticatedClient::new(reqwest::Client::new(), format!("{base}/api"), tokens);

        let err = client.execute(&ApiRequest::get("echo")).await.unwrap_err();

        assert!(matches!(err, Error::Authentication(_)), "got: {err:?}");
        assert_eq!(mock.platform_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dead_platform_is_network_error() {
        let (_mock, base) = MockUpstream::serve().await;
        let tokens = gateway_auth::TokenManager::new(
            reqwest::Client::new(),
            crate::test_support::auth_config(&base),
            None,
        );
        let client = AuthenticatedClient::new(reqwest::Client::new(), "http://127.0.0.1:1", tokens);

        let err = client.execute(&ApiRequest::get("echo")).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)), "got: {err:?}");
    }
}
