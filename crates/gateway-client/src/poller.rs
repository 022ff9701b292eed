//! Remote job polling with tiered backoff and a circuit breaker
//!
//! A poll session fetches job status strictly sequentially. Between fetches it
//! sleeps for an interval chosen by attempt count: short for the first tier,
//! medium for the second, long after that. Transient fetch failures back off in
//! proportion to the number of failures in a row, and enough of them in a row
//! trips the breaker. A successful fetch always resets that count.
//!
//! `JobPoller::watch` exposes the session as a finite stream of progress
//! updates; `JobPoller::await_ready` drains it and returns the ready snapshot.
//! Dropping either stops polling at the next suspension point.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::Deserialize;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::error::{Error, Result};
use crate::job::{JobState, JobStatusSnapshot, JobStatusSource};

/// Highest percentage reported while the job is still running.
const MAX_PENDING_PERCENT: u8 = 95;
const INITIAL_PERCENT: u32 = 5;

/// Poll timing and budgets.
///
/// Tier boundaries are cumulative attempt counts: attempts `1..=short_tier_attempts`
/// use the short interval, attempts up to `medium_tier_attempts` the medium one,
/// and everything after that the long one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub short_interval_ms: u64,
    pub short_tier_attempts: u32,
    pub medium_interval_ms: u64,
    pub medium_tier_attempts: u32,
    pub long_interval_ms: u64,
    /// Hard cap on status fetches, failed ones included
    pub max_attempts: u32,
    pub error_backoff_ms: u64,
    pub max_error_backoff_ms: u64,
    /// Failures in a row that trip the breaker
    pub max_consecutive_errors: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            short_interval_ms: 1_000,
            short_tier_attempts: 5,
            medium_interval_ms: 3_000,
            medium_tier_attempts: 15,
            long_interval_ms: 5_000,
            max_attempts: 60,
            error_backoff_ms: 2_000,
            max_error_backoff_ms: 30_000,
            max_consecutive_errors: 5,
        }
    }
}

impl PollConfig {
    /// Sleep after a non-terminal fetch that was attempt number `attempt`.
    pub fn interval_for(&self, attempt: u32) -> Duration {
        let ms = if attempt <= self.short_tier_attempts {
            self.short_interval_ms
        } else if attempt <= self.medium_tier_attempts {
            self.medium_interval_ms
        } else {
            self.long_interval_ms
        };
        Duration::from_millis(ms)
    }

    /// Sleep after the `consecutive_errors`-th failure in a row.
    pub fn error_backoff(&self, consecutive_errors: u32) -> Duration {
        let ms = self
            .error_backoff_ms
            .saturating_mul(u64::from(consecutive_errors))
            .min(self.max_error_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Synthetic progress after `attempt` fetches. Derived from the attempt
    /// count only; the platform reports no real progress.
    pub fn progress_for(&self, attempt: u32) -> JobProgress {
        let budget = self.max_attempts.max(1);
        let scaled = INITIAL_PERCENT + attempt.saturating_mul(90) / budget;
        let percent = scaled.min(u32::from(MAX_PENDING_PERCENT)) as u8;
        let phase = if attempt <= self.short_tier_attempts {
            PollPhase::Queued
        } else if attempt <= self.medium_tier_attempts {
            PollPhase::Processing
        } else {
            PollPhase::Finalizing
        };
        JobProgress {
            attempt,
            percent,
            phase,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Queued,
    Processing,
    Finalizing,
    Complete,
}

impl PollPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PollPhase::Queued => "queued",
            PollPhase::Processing => "processing",
            PollPhase::Finalizing => "finalizing",
            PollPhase::Complete => "complete",
        }
    }
}

/// Estimated progress. Not authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobProgress {
    pub attempt: u32,
    pub percent: u8,
    pub phase: PollPhase,
}

/// One item of a poll session.
#[derive(Debug, Clone, PartialEq)]
pub enum PollUpdate {
    Progress(JobProgress),
    /// Always the last item of a successful session
    Ready(JobStatusSnapshot),
}

/// Mutable state of one poll invocation.
#[derive(Debug)]
struct PollSession {
    job_id: String,
    attempt: u32,
    consecutive_errors: u32,
    last_backoff: Duration,
}

enum WatchState {
    Polling {
        session: PollSession,
        sleep_before: Option<Duration>,
    },
    Ready(JobStatusSnapshot),
    Done,
}

/// Waits for remote jobs to become ready.
#[derive(Clone)]
pub struct JobPoller {
    source: Arc<dyn JobStatusSource>,
    config: PollConfig,
}

impl JobPoller {
    pub fn new(source: Arc<dyn JobStatusSource>, config: PollConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll `job_id` until it is ready, failed, or a budget runs out.
    ///
    /// Nothing is fetched until the stream is first polled. The stream ends
    /// after `PollUpdate::Ready` or after the first `Err` item.
    pub fn watch(&self, job_id: impl Into<String>) -> BoxStream<'static, Result<PollUpdate>> {
        let job_id = job_id.into();
        let span = info_span!("job_poll", job_id = %job_id);
        let source = self.source.clone();
        let config = self.config.clone();
        let initial = WatchState::Polling {
            session: PollSession {
                job_id,
                attempt: 0,
                consecutive_errors: 0,
                last_backoff: Duration::ZERO,
            },
            sleep_before: None,
        };

        stream::unfold(initial, move |state| {
            let source = source.clone();
            let config = config.clone();
            async move { step(source.as_ref(), &config, state).await }.instrument(span.clone())
        })
        .boxed()
    }

    /// Drive `watch` to completion and return the ready snapshot.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn await_ready(&self, job_id: &str) -> Result<JobStatusSnapshot> {
        let mut updates = self.watch(job_id);
        while let Some(update) = updates.next().await {
            match update? {
                PollUpdate::Ready(snapshot) => return Ok(snapshot),
                PollUpdate::Progress(progress) => {
                    debug!(attempt = progress.attempt, percent = progress.percent, "job pending");
                }
            }
        }
        Err(Error::Protocol(format!(
            "poll session for {job_id} ended without a result"
        )))
    }
}

async fn step(
    source: &dyn JobStatusSource,
    config: &PollConfig,
    state: WatchState,
) -> Option<(Result<PollUpdate>, WatchState)> {
    let (mut session, sleep_before) = match state {
        WatchState::Done => return None,
        WatchState::Ready(snapshot) => {
            return Some((Ok(PollUpdate::Ready(snapshot)), WatchState::Done));
        }
        WatchState::Polling {
            session,
            sleep_before,
        } => (session, sleep_before),
    };

    if let Some(delay) = sleep_before {
        tokio::time::sleep(delay).await;
    }

    session.attempt += 1;
    let fetched = source.fetch_status(&session.job_id).await;

    match fetched {
        Ok(snapshot) => {
            session.consecutive_errors = 0;
            session.last_backoff = Duration::ZERO;
            match snapshot.state {
                JobState::Ready => {
                    record_poll("ready");
                    info!(attempt = session.attempt, "job ready");
                    let done = JobProgress {
                        attempt: session.attempt,
                        percent: 100,
                        phase: PollPhase::Complete,
                    };
                    Some((Ok(PollUpdate::Progress(done)), WatchState::Ready(snapshot)))
                }
                JobState::Failed => {
                    record_poll("failed");
                    let detail = snapshot.failure_detail();
                    warn!(attempt = session.attempt, detail = %detail, "job failed remotely");
                    let err = Error::JobFailed {
                        job_id: session.job_id,
                        detail,
                    };
                    Some((Err(err), WatchState::Done))
                }
                JobState::Pending | JobState::Processing => {
                    record_poll("pending");
                    if let Some(timeout) = out_of_attempts(config, &session) {
                        return Some((Err(timeout), WatchState::Done));
                    }
                    let delay = config.interval_for(session.attempt);
                    debug!(
                        attempt = session.attempt,
                        state = ?snapshot.state,
                        delay_ms = delay.as_millis() as u64,
                        "job not ready"
                    );
                    next_progress(config, session, delay)
                }
            }
        }
        Err(err) if err.is_transient() => {
            record_poll("error");
            session.consecutive_errors += 1;
            warn!(
                attempt = session.attempt,
                consecutive_errors = session.consecutive_errors,
                error = %err,
                "job status fetch failed"
            );
            if session.consecutive_errors >= config.max_consecutive_errors {
                record_poll("circuit_open");
                let err = Error::JobPollingError {
                    job_id: session.job_id,
                    consecutive_errors: session.consecutive_errors,
                    last_error: err.to_string(),
                };
                return Some((Err(err), WatchState::Done));
            }
            if let Some(timeout) = out_of_attempts(config, &session) {
                return Some((Err(timeout), WatchState::Done));
            }
            let delay = config.error_backoff(session.consecutive_errors);
            debug!(
                previous_ms = session.last_backoff.as_millis() as u64,
                next_ms = delay.as_millis() as u64,
                "backing off after fetch error"
            );
            session.last_backoff = delay;
            next_progress(config, session, delay)
        }
        Err(err) => Some((Err(err), WatchState::Done)),
    }
}

fn out_of_attempts(config: &PollConfig, session: &PollSession) -> Option<Error> {
    if session.attempt < config.max_attempts {
        return None;
    }
    record_poll("timeout");
    warn!(attempts = session.attempt, "job poll budget exhausted");
    Some(Error::JobTimeout {
        job_id: session.job_id.clone(),
        attempts: session.attempt,
    })
}

fn next_progress(
    config: &PollConfig,
    session: PollSession,
    delay: Duration,
) -> Option<(Result<PollUpdate>, WatchState)> {
    let progress = config.progress_for(session.attempt);
    Some((
        Ok(PollUpdate::Progress(progress)),
        WatchState::Polling {
            session,
            sleep_before: Some(delay),
        },
    ))
}

fn record_poll(outcome: &'static str) {
    metrics::counter!("gateway_job_polls_total", "outcome" => outcome).increment(1);
}
