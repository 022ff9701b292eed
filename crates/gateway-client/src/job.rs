//! Remote job status and the source abstraction the poller reads from

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

/// State of a remote job as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl JobState {
    /// Map a remote status string. `Error` is treated as `Failed`. Only an
    /// explicit `Ready` is success; anything unrecognised counts as still
    /// processing so the attempt cap bounds it.
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "pending" => JobState::Pending,
            "processing" => JobState::Processing,
            "ready" => JobState::Ready,
            "failed" | "error" => JobState::Failed,
            other => {
                warn!(status = other, "unknown job status, treating as processing");
                JobState::Processing
            }
        }
    }
}

/// One status observation of a remote job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusSnapshot {
    pub job_id: String,
    pub state: JobState,
    /// Full response body, for callers that need platform-specific fields
    pub raw: Value,
}

impl JobStatusSnapshot {
    /// Build a snapshot from a status response body. A body without a string
    /// `status` field is a protocol error.
    pub fn from_json(job_id: &str, raw: Value) -> Result<Self> {
        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol(format!("status response for {job_id} has no status")))?;
        Ok(Self {
            job_id: job_id.to_string(),
            state: JobState::parse(status),
            raw,
        })
    }

    /// Failure detail reported by the platform, falling back to the raw body.
    pub fn failure_detail(&self) -> String {
        ["error", "message", "detail"]
            .iter()
            .filter_map(|key| self.raw.get(*key))
            .find_map(|value| match value {
                Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
                Value::Null | Value::String(_) => None,
                other => Some(other.to_string()),
            })
            .unwrap_or_else(|| self.raw.to_string())
    }
}

/// Anything that can report the current status of a job.
///
/// Uses `Pin<Box<dyn Future>>` so the poller can hold an `Arc<dyn JobStatusSource>`.
pub trait JobStatusSource: Send + Sync {
    fn fetch_status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatusSnapshot>> + Send + 'a>>;
}
