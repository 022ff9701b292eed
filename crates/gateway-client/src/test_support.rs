//! Local stand-in for the auth provider and document platform.
//!
//! One axum server serves both: `/auth/*` mimics the provider, `/api/*` the
//! platform, `/upload` a presigned storage URL. Every platform route counts
//! its calls and can be scripted to answer 401 or a fixed error status.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use gateway_auth::{AuthConfig, TokenManager};
use tokio::net::TcpListener;

use crate::executor::AuthenticatedClient;

#[derive(Default)]
pub struct MockUpstream {
    pub signin_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub platform_calls: AtomicUsize,
    /// Number of upcoming platform calls answered with 401
    pub unauthorized_responses: AtomicUsize,
    /// Non-zero makes every platform call answer with this status
    pub fail_status: AtomicU16,
    /// Statuses handed out by `get-file`, one per call; "Pending" once exhausted
    pub file_statuses: Mutex<VecDeque<String>>,
    /// Raw body served by `chat-stream`
    pub chat_body: Mutex<String>,
    pub last_query: Mutex<Vec<(String, String)>>,
    pub uploaded_bytes: AtomicUsize,
}

impl MockUpstream {
    pub async fn serve() -> (Arc<Self>, String) {
        let mock = Arc::new(Self::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = Router::new()
            .route("/auth/signin", post(signin))
            .route("/auth/refresh", post(refresh))
            .route("/api/echo", get(echo))
            .route("/api/get-file", get(get_file))
            .route("/api/generate-upload-url", post(generate_upload_url))
            .route("/api/chat-stream", post(chat_stream))
            .route("/upload", put(upload))
            .with_state(mock.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (mock, base)
    }

    pub fn script_statuses(&self, statuses: &[&str]) {
        let mut queue = self.file_statuses.lock().unwrap();
        queue.extend(statuses.iter().map(|s| s.to_string()));
    }

    /// Shared gate for platform routes: count, check the bearer token, apply scripts.
    fn gate(&self, headers: &HeaderMap) -> Option<Response> {
        self.platform_calls.fetch_add(1, Ordering::SeqCst);
        let scripted_401 = self
            .unauthorized_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let bearer_ok = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("Bearer at-"));
        if scripted_401 || !bearer_ok {
            return Some((StatusCode::UNAUTHORIZED, "token expired").into_response());
        }
        let status = self.fail_status.load(Ordering::SeqCst);
        if status != 0 {
            let status = StatusCode::from_u16(status).unwrap();
            return Some((status, "upstream exploded").into_response());
        }
        None
    }
}

pub fn auth_config(base: &str) -> AuthConfig {
    AuthConfig {
        signin_url: format!("{base}/auth/signin"),
        refresh_url: format!("{base}/auth/refresh"),
        email: "svc@example.com".into(),
        password: "pw".into(),
        token_ttl: Duration::from_secs(3600),
        refresh_buffer: Duration::from_secs(300),
    }
}

/// Mock server plus a client pointed at its `/api` prefix.
pub async fn start_upstream() -> (Arc<MockUpstream>, AuthenticatedClient) {
    let (mock, base) = MockUpstream::serve().await;
    let tokens = TokenManager::new(reqwest::Client::new(), auth_config(&base), None);
    let client = AuthenticatedClient::new(reqwest::Client::new(), format!("{base}/api"), tokens);
    (mock, client)
}

async fn signin(
    State(mock): State<Arc<MockUpstream>>,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> Response {
    let n = mock.signin_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if body["password"] != "pw" {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    axum::Json(serde_json::json!({
        "accessToken": format!("at-signin-{n}"),
        "refreshToken": format!("rt-signin-{n}"),
        "id": 42
    }))
    .into_response()
}

async fn refresh(State(mock): State<Arc<MockUpstream>>) -> Response {
    let n = mock.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    axum::Json(serde_json::json!({
        "accessToken": format!("at-refresh-{n}"),
        "refreshToken": format!("rt-refresh-{n}"),
        "id": 42
    }))
    .into_response()
}

async fn echo(State(mock): State<Arc<MockUpstream>>, headers: HeaderMap) -> Response {
    if let Some(rejection) = mock.gate(&headers) {
        return rejection;
    }
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    axum::Json(serde_json::json!({
        "authorization": header("authorization"),
        "userid": header("userid"),
    }))
    .into_response()
}

async fn get_file(
    State(mock): State<Arc<MockUpstream>>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    if let Some(rejection) = mock.gate(&headers) {
        return rejection;
    }
    *mock.last_query.lock().unwrap() = query.clone();
    let file_id = query
        .iter()
        .find(|(k, _)| k == "file_id")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    let status = mock
        .file_statuses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| "Pending".into());
    axum::Json(serde_json::json!({
        "file_id": file_id,
        "status": status,
        "error": if status == "Failed" { "ocr crashed" } else { "" },
    }))
    .into_response()
}

async fn generate_upload_url(
    State(mock): State<Arc<MockUpstream>>,
    headers: HeaderMap,
    axum::Form(form): axum::Form<Vec<(String, String)>>,
) -> Response {
    if let Some(rejection) = mock.gate(&headers) {
        return rejection;
    }
    let field = |name: &str| {
        form.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();
    axum::Json(serde_json::json!({
        "file_id": format!("file-{}", field("file_name")),
        "upload_url": format!("http://{host}/upload"),
        "collection_id": field("collection_id"),
        "file_size": field("file_size"),
    }))
    .into_response()
}

async fn chat_stream(
    State(mock): State<Arc<MockUpstream>>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    if let Some(rejection) = mock.gate(&headers) {
        return rejection;
    }
    *mock.last_query.lock().unwrap() = query;
    let body = mock.chat_body.lock().unwrap().clone();
    (
        StatusCode::OK,
        [("content-type", "application/x-ndjson")],
        body,
    )
        .into_response()
}

async fn upload(State(mock): State<Arc<MockUpstream>>, body: axum::body::Bytes) -> StatusCode {
    mock.uploaded_bytes.fetch_add(body.len(), Ordering::SeqCst);
    StatusCode::OK
}
