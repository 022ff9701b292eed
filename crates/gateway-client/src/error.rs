//! Error types for platform calls, job polling and streaming

/// Errors surfaced to route handlers.
///
/// `JobFailed`, `JobTimeout` and `JobPollingError` are deliberately distinct so
/// a caller can tell "the remote job broke" from "we gave up waiting" from
/// "we could not reach the platform".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("platform returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected platform response: {0}")]
    Protocol(String),

    #[error("job {job_id} failed: {detail}")]
    JobFailed { job_id: String, detail: String },

    #[error("job {job_id} not ready after {attempts} attempts")]
    JobTimeout { job_id: String, attempts: u32 },

    #[error("polling job {job_id} failed {consecutive_errors} times in a row: {last_error}")]
    JobPollingError {
        job_id: String,
        consecutive_errors: u32,
        last_error: String,
    },
}

impl Error {
    /// Whether a status poll that hit this error may be retried.
    ///
    /// Authentication failures already went through the executor's single
    /// renew-and-retry and are final; job outcomes are final by definition.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Status { .. } | Error::Protocol(_)
        )
    }
}

impl From<gateway_auth::Error> for Error {
    fn from(err: gateway_auth::Error) -> Self {
        match err {
            gateway_auth::Error::Network(msg) => Error::Network(msg),
            gateway_auth::Error::Authentication(msg) => Error::Authentication(msg),
            other => Error::Authentication(other.to_string()),
        }
    }
}

/// Result alias for platform operations.
pub type Result<T> = std::result::Result<T, Error>;
