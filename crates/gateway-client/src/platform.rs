//! Typed calls to the document platform

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::executor::{ApiRequest, AuthenticatedClient};
use crate::job::{JobStatusSnapshot, JobStatusSource};
use crate::poller::{JobPoller, PollConfig};
use crate::stream::{DecodedEvent, StreamAccumulator, decode_stream};

pub const GENERATE_UPLOAD_URL_PATH: &str = "generate-upload-url";
pub const FILE_STATUS_PATH: &str = "get-file";
pub const CHAT_STREAM_PATH: &str = "chat-stream";

/// Where to upload a document, as handed out by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadDescriptor {
    pub file_id: String,
    pub upload_url: String,
    /// Any other fields the platform includes
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatRequest {
    pub document_ids: Vec<String>,
    pub agent: String,
    /// Continue an earlier conversation
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    fn to_api_request(&self) -> ApiRequest {
        let request = ApiRequest::post(CHAT_STREAM_PATH)
            .query("document_ids", self.document_ids.join(","))
            .query("agent", self.agent.clone());
        match &self.conversation_id {
            Some(id) => request.query("conversation_id", id.clone()),
            None => request,
        }
    }
}

/// Document platform client. Cheap to clone.
#[derive(Clone)]
pub struct PlatformClient {
    api: AuthenticatedClient,
}

impl PlatformClient {
    pub fn new(api: AuthenticatedClient) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &AuthenticatedClient {
        &self.api
    }

    /// A poller that reads job status from this platform.
    pub fn poller(&self, config: PollConfig) -> JobPoller {
        JobPoller::new(Arc::new(self.clone()), config)
    }

    pub async fn generate_upload_url(
        &self,
        file_name: &str,
        file_size: u64,
        collection_id: &str,
    ) -> Result<UploadDescriptor> {
        let request = ApiRequest::post(GENERATE_UPLOAD_URL_PATH)
            .form_field("file_name", file_name)
            .form_field("file_size", file_size.to_string())
            .form_field("collection_id", collection_id);
        let response = self.api.execute(&request).await?;
        let descriptor: UploadDescriptor = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid upload descriptor: {e}")))?;
        info!(file_id = %descriptor.file_id, file_name, "upload url issued");
        Ok(descriptor)
    }

    /// PUT the document to its presigned URL. The URL carries its own
    /// authorization, so no bearer token is sent.
    pub async fn upload(&self, descriptor: &UploadDescriptor, body: Bytes) -> Result<()> {
        let size = body.len();
        let response = self
            .api
            .http()
            .put(&descriptor.upload_url)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("upload of {} failed: {e}", descriptor.file_id)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(file_id = %descriptor.file_id, bytes = size, "document uploaded");
        Ok(())
    }

    pub async fn file_status(&self, file_id: &str) -> Result<JobStatusSnapshot> {
        let request = ApiRequest::get(FILE_STATUS_PATH).query("file_id", file_id);
        let response = self.api.execute(&request).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("invalid status response for {file_id}: {e}")))?;
        JobStatusSnapshot::from_json(file_id, body)
    }

    /// Open a chat stream. Errors before the first byte (auth, status) are
    /// returned here; errors mid-stream arrive as items.
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<DecodedEvent>>> {
        let response = self.api.execute(&request.to_api_request()).await?;
        Ok(decode_stream(response.bytes_stream()))
    }

    /// Run a chat to completion and return the accumulated answer.
    pub async fn chat(&self, request: &ChatRequest) -> Result<StreamAccumulator> {
        let mut events = self.chat_stream(request).await?;
        let mut answer = StreamAccumulator::new();
        while let Some(event) = events.next().await {
            answer.accumulate(event?);
            if answer.finished {
                break;
            }
        }
        debug!(
            chars = answer.full_text.len(),
            finished = answer.finished,
            "chat stream drained"
        );
        Ok(answer)
    }
}

impl JobStatusSource for PlatformClient {
    fn fetch_status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatusSnapshot>> + Send + 'a>> {
        Box::pin(self.file_status(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::test_support::start_upstream;
    use std::sync::atomic::Ordering;

    fn fast_polling() -> PollConfig {
        PollConfig {
            short_interval_ms: 1,
            short_tier_attempts: 2,
            medium_interval_ms: 2,
            medium_tier_attempts: 4,
            long_interval_ms: 3,
            max_attempts: 10,
            error_backoff_ms: 1,
            max_error_backoff_ms: 5,
            max_consecutive_errors: 3,
        }
    }

    #[tokio::test]
    async fn upload_url_then_upload() {
        let (mock, api) = start_upstream().await;
        let platform = PlatformClient::new(api);

        let descriptor = platform
            .generate_upload_url("report.pdf", 2048, "col-1")
            .await
            .unwrap();
        assert_eq!(descriptor.file_id, "file-report.pdf");
        assert_eq!(descriptor.extra["collection_id"], "col-1");
        assert_eq!(descriptor.extra["file_size"], "2048");

        platform
            .upload(&descriptor, Bytes::from_static(b"%PDF-1.7"))
            .await
            .unwrap();
        assert_eq!(mock.uploaded_bytes.load(Ordering::SeqCst), 8);
        // Only the descriptor request went through the authenticated path
        assert_eq!(mock.platform_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn file_status_maps_remote_state() {
        let (mock, api) = start_upstream().await;
        mock.script_statuses(&["Processing", "Error"]);
        let platform = PlatformClient::new(api);

        let first = platform.file_status("f-7").await.unwrap();
        assert_eq!(first.state, JobState::Processing);
        assert_eq!(first.job_id, "f-7");
        assert_eq!(
            *mock.last_query.lock().unwrap(),
            vec![("file_id".to_string(), "f-7".to_string())]
        );

        let second = platform.file_status("f-7").await.unwrap();
        assert_eq!(second.state, JobState::Failed);
    }

    #[tokio::test]
    async fn poller_reads_platform_until_ready() {
        let (mock, api) = start_upstream().await;
        mock.script_statuses(&["Pending", "Pending", "Processing", "Ready"]);
        let poller = PlatformClient::new(api).poller(fast_polling());

        let snapshot = poller.await_ready("f-1").await.unwrap();

        assert_eq!(snapshot.state, JobState::Ready);
        assert_eq!(snapshot.raw["file_id"], "f-1");
        assert_eq!(mock.platform_calls.load(Ordering::SeqCst), 4);
        assert_eq!(mock.signin_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_failure_detail_reaches_caller() {
        let (mock, api) = start_upstream().await;
        mock.script_statuses(&["Pending", "Failed"]);
        let poller = PlatformClient::new(api).poller(fast_polling());

        let err = poller.await_ready("f-1").await.unwrap_err();

        assert!(
            matches!(&err, Error::JobFailed { detail, .. } if detail == "ocr crashed"),
            "got: {err:?}"
        );
        assert_eq!(mock.platform_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_errors_trip_the_breaker() {
        let (mock, api) = start_upstream().await;
        mock.fail_status.store(503, Ordering::SeqCst);
        let poller = PlatformClient::new(api).poller(fast_polling());

        let err = poller.await_ready("f-1").await.unwrap_err();

        match err {
            Error::JobPollingError {
                consecutive_errors,
                last_error,
                ..
            } => {
                assert_eq!(consecutive_errors, 3);
                assert!(last_error.contains("upstream exploded"), "{last_error}");
            }
            other => panic!("expected JobPollingError, got {other:?}"),
        }
        assert_eq!(mock.platform_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_survives_one_token_rejection() {
        let (mock, api) = start_upstream().await;
        mock.script_statuses(&["Ready"]);
        mock.unauthorized_responses.store(1, Ordering::SeqCst);
        let poller = PlatformClient::new(api).poller(fast_polling());

        let snapshot = poller.await_ready("f-1").await.unwrap();

        assert_eq!(snapshot.state, JobState::Ready);
        assert_eq!(mock.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chat_accumulates_streamed_answer() {
        let (mock, api) = start_upstream().await;
        *mock.chat_body.lock().unwrap() = [
            r#"{"conversation_id":"conv-1"}"#,
            r#"{"detected_language":"en"}"#,
            r#"{"content_delta":"Hi"}"#,
            "garbage",
            r#"{"content_delta":" there"}"#,
            r#"{"step":"Finished","content":{"chatbot_message":{"content":"Hi there","citations":[{"doc":"d1"}]}}}"#,
        ]
        .join("\n");
        let platform = PlatformClient::new(api);

        let answer = platform
            .chat(&ChatRequest {
                document_ids: vec!["d1".into(), "d2".into()],
                agent: "auditor".into(),
                conversation_id: Some("conv-0".into()),
            })
            .await
            .unwrap();

        assert!(answer.finished);
        assert_eq!(answer.full_text, "Hi there");
        assert_eq!(answer.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(answer.detected_language.as_deref(), Some("en"));
        assert_eq!(answer.citations, Some(serde_json::json!([{"doc": "d1"}])));

        let query = mock.last_query.lock().unwrap().clone();
        assert!(query.contains(&("document_ids".into(), "d1,d2".into())));
        assert!(query.contains(&("agent".into(), "auditor".into())));
        assert!(query.contains(&("conversation_id".into(), "conv-0".into())));
    }

    #[tokio::test]
    async fn chat_without_finish_returns_partial_answer() {
        let (mock, api) = start_upstream().await;
        *mock.chat_body.lock().unwrap() = "{\"content_delta\":\"cut\"}\n{\"content\":\" off\"}".into();
        let platform = PlatformClient::new(api);

        let answer = platform.chat(&ChatRequest::default()).await.unwrap();

        assert!(!answer.finished);
        assert_eq!(answer.full_text, "cut off");
    }

    #[tokio::test]
    async fn chat_stream_status_error_is_returned_before_streaming() {
        let (mock, api) = start_upstream().await;
        mock.fail_status.store(422, Ordering::SeqCst);
        let platform = PlatformClient::new(api);

        let err = platform.chat(&ChatRequest::default()).await.unwrap_err();

        assert!(matches!(err, Error::Status { status: 422, .. }), "got: {err:?}");
    }
}
