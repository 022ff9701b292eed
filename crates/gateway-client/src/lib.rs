//! Platform-facing side of the integration gateway
//!
//! Everything here sits on top of `gateway_auth::TokenManager`:
//!
//! - `AuthenticatedClient` injects the bearer token and subject header, and on
//!   a 401 renews once and retries once
//! - `PlatformClient` wraps the document platform endpoints (upload URLs, file
//!   status, chat stream)
//! - `JobPoller` waits for a remote job to become ready with tiered backoff and
//!   a consecutive-error circuit breaker
//! - `stream` decodes the line-delimited chat event protocol
//!
//! Route handlers call these directly and serialize the results themselves.

pub mod error;
pub mod executor;
pub mod job;
pub mod platform;
pub mod poller;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use executor::{ApiRequest, AuthenticatedClient};
pub use job::{JobState, JobStatusSnapshot, JobStatusSource};
pub use platform::{ChatRequest, PlatformClient, UploadDescriptor};
pub use poller::{JobPoller, JobProgress, PollConfig, PollPhase, PollUpdate};
pub use stream::{DecodedEvent, StreamAccumulator, decode_line, decode_stream};
