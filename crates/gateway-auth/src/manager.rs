//! Single-flight token lifecycle
//!
//! `TokenManager` guarantees a usable access token exists before any platform
//! call. Renewal (refresh, or sign-in as fallback) runs at most once at a time:
//! the first caller to find the token stale publishes a shared future in the
//! in-flight slot, and every concurrent caller awaits that same future instead
//! of issuing its own request. The slot is cleared when the renewal finishes,
//! whatever the outcome. A renewal orphaned by `logout()` is awaited by the
//! next one before it contacts the provider, so provider calls never overlap.
//!
//! Neither lock is ever held across an `.await`, so waiting callers park on the
//! shared future rather than blocking runtime threads.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use common::Secret;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialStore, now_millis};
use crate::error::{Error, Result};
use crate::token::{self, TokenGrant};

/// Auth provider endpoints and service account settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub signin_url: String,
    pub refresh_url: String,
    pub email: String,
    pub password: Secret<String>,
    /// Lifetime assumed when the provider does not report `expiresIn`
    pub token_ttl: Duration,
    /// Tokens within this window of expiry are renewed before use
    pub refresh_buffer: Duration,
}

/// Headers needed for one authenticated platform call.
#[derive(Clone)]
pub struct Authorization {
    pub access_token: String,
    pub subject_id: String,
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("access_token", &"[REDACTED]")
            .field("subject_id", &self.subject_id)
            .finish()
    }
}

type Renewal = Shared<BoxFuture<'static, Result<()>>>;

/// Owner of the gateway's Credential State.
///
/// Cheap to clone; clones share the same state. Construct one per process and
/// hand it to every component that makes authenticated calls.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    config: AuthConfig,
    state: RwLock<Option<Credential>>,
    /// Bumped by `logout()`; renewals started under an older value are discarded
    generation: AtomicU64,
    /// At most one renewal, tagged so a finished renewal only clears itself
    in_flight: Mutex<Option<(u64, Renewal)>>,
    /// Renewal detached by `logout()` that may still be talking to the provider
    orphaned: Mutex<Option<Renewal>>,
    next_renewal_id: AtomicU64,
    store: Option<CredentialStore>,
}

impl TokenManager {
    pub fn new(
        client: reqwest::Client,
        config: AuthConfig,
        store: Option<CredentialStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                state: RwLock::new(None),
                generation: AtomicU64::new(0),
                in_flight: Mutex::new(None),
                orphaned: Mutex::new(None),
                next_renewal_id: AtomicU64::new(0),
                store,
            }),
        }
    }

    /// Load the persisted credential record into memory.
    ///
    /// Returns whether a record was found. Does nothing if a credential is
    /// already held. An expired record is still loaded: its refresh token is
    /// what lets the next ensure skip a full sign-in.
    pub async fn restore(&self) -> Result<bool> {
        let Some(store) = &self.inner.store else {
            return Ok(false);
        };
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let Some(credential) = store.load().await? else {
            return Ok(false);
        };

        let mut state = self.inner.write_state();
        if state.is_some() || self.inner.generation.load(Ordering::SeqCst) != generation {
            return Ok(false);
        }
        *state = Some(credential);
        Ok(true)
    }

    /// Make sure a non-stale token is held, renewing if needed.
    ///
    /// Returns true iff, on return, the stored expiry minus the refresh buffer
    /// is still in the future.
    pub async fn ensure_valid_token(&self) -> bool {
        match self.ensure_fresh().await {
            Ok(()) => self.is_valid(),
            Err(e) => {
                warn!(error = %e, "unable to obtain a valid token");
                false
            }
        }
    }

    /// Ensure a valid token and return the headers for one call.
    pub async fn authorize(&self) -> Result<Authorization> {
        self.ensure_fresh().await?;
        let state = self.inner.read_state();
        match state.as_ref() {
            Some(c) if c.is_fresh(now_millis(), self.inner.config.refresh_buffer) => {
                Ok(Authorization {
                    access_token: c.access.clone(),
                    subject_id: c.subject_id.clone(),
                })
            }
            Some(_) => Err(Error::Authentication(
                "token expired immediately after renewal".into(),
            )),
            None => Err(Error::Authentication(
                "credentials were cleared during renewal".into(),
            )),
        }
    }

    /// Mark the held token as expired while keeping its refresh token.
    ///
    /// This is the one invalidation path: the buffer check and the 401 handler
    /// both end up in the same `is_fresh()` test, and this simply moves the
    /// expiry into the past so that test fails and the next ensure refreshes.
    pub fn force_invalidate(&self) {
        if let Some(credential) = self.inner.write_state().as_mut() {
            credential.expires = 0;
            debug!(subject_id = %credential.subject_id, "token force-invalidated");
        }
    }

    /// Invalidate only if `rejected` is still the held access token.
    ///
    /// A caller whose request was rejected with an old token must not throw
    /// away a newer one another caller already renewed. Returns whether the
    /// held token was invalidated.
    pub fn invalidate_if_current(&self, rejected: &str) -> bool {
        let is_current = self
            .inner
            .read_state()
            .as_ref()
            .is_some_and(|c| c.access == rejected);
        if is_current {
            self.force_invalidate();
        }
        is_current
    }

    /// Drop the credential. The next ensure performs a full sign-in.
    ///
    /// In-memory state is cleared before the first suspension point; the
    /// persisted record is removed afterwards.
    pub async fn logout(&self) {
        {
            let mut state = self.inner.write_state();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            *state = None;
        }
        // A renewal started before logout must not be joined by later callers
        let orphan = self.inner.lock_in_flight().take();
        if let Some((_, renewal)) = orphan {
            *self.inner.lock_orphaned() = Some(renewal);
        }
        info!("logged out, credential cleared");

        if let Some(store) = &self.inner.store
            && let Err(e) = store.clear().await
        {
            warn!(error = %e, "failed to remove persisted credential");
        }
    }

    /// Snapshot of the current credential, if any.
    pub fn credential(&self) -> Option<Credential> {
        self.inner.read_state().clone()
    }

    /// Whether the held token is outside the refresh buffer right now.
    pub fn is_valid(&self) -> bool {
        self.inner.current_is_fresh()
    }

    pub fn refresh_buffer(&self) -> Duration {
        self.inner.config.refresh_buffer
    }

    async fn ensure_fresh(&self) -> Result<()> {
        if self.inner.current_is_fresh() {
            return Ok(());
        }

        let renewal = {
            let mut slot = self.inner.lock_in_flight();
            match slot.as_ref() {
                Some((_, renewal)) => renewal.clone(),
                None => {
                    // Another renewal may have finished between the check above and the lock
                    if self.inner.current_is_fresh() {
                        return Ok(());
                    }
                    let id = self.inner.next_renewal_id.fetch_add(1, Ordering::Relaxed);
                    let orphan = self.inner.lock_orphaned().take();
                    let inner = Arc::clone(&self.inner);
                    let renewal = async move {
                        if let Some(orphan) = orphan {
                            // Its result is discarded by the generation check
                            let _ = orphan.await;
                        }
                        let result = Arc::clone(&inner).renew().await;
                        let mut slot = inner.lock_in_flight();
                        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                            *slot = None;
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some((id, renewal.clone()));
                    renewal
                }
            }
        };

        renewal.await
    }
}

impl Inner {
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, Option<Credential>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, Option<Credential>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<(u64, Renewal)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_orphaned(&self) -> MutexGuard<'_, Option<Renewal>> {
        self.orphaned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_is_fresh(&self) -> bool {
        self.read_state()
            .as_ref()
            .is_some_and(|c| c.is_fresh(now_millis(), self.config.refresh_buffer))
    }

    /// Refresh when a refresh token is held, otherwise (or on failure) sign in.
    async fn renew(self: Arc<Self>) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let current = self.read_state().clone();

        let refreshed = match current {
            Some(credential) => {
                match token::refresh(
                    &self.client,
                    &self.config.refresh_url,
                    &credential.refresh,
                    &credential.subject_id,
                )
                .await
                {
                    Ok(grant) => {
                        record_renewal("refresh", "success");
                        Some(grant)
                    }
                    Err(e) => {
                        record_renewal("refresh", "failure");
                        warn!(error = %e, "token refresh failed, falling back to sign-in");
                        None
                    }
                }
            }
            None => None,
        };

        let grant = match refreshed {
            Some(grant) => grant,
            None => {
                let grant = token::sign_in(
                    &self.client,
                    &self.config.signin_url,
                    &self.config.email,
                    &self.config.password,
                )
                .await
                .inspect_err(|_| record_renewal("signin", "failure"))?;
                record_renewal("signin", "success");
                grant
            }
        };

        self.install(grant, generation).await
    }

    /// Replace the credential wholesale, unless a logout happened meanwhile.
    async fn install(&self, grant: TokenGrant, generation: u64) -> Result<()> {
        let ttl = match grant.expires_in.map(Duration::from_secs) {
            Some(reported) if reported > self.config.refresh_buffer => reported,
            Some(reported) => {
                warn!(
                    reported_secs = reported.as_secs(),
                    buffer_secs = self.config.refresh_buffer.as_secs(),
                    "provider expiry is inside the refresh buffer, using configured ttl"
                );
                self.config.token_ttl
            }
            None => self.config.token_ttl,
        };
        let credential = Credential {
            access: grant.access_token,
            refresh: grant.refresh_token,
            subject_id: grant.subject_id,
            expires: now_millis() + ttl.as_millis() as u64,
        };

        {
            let mut state = self.write_state();
            if self.generation.load(Ordering::SeqCst) != generation {
                info!("logout happened during renewal, discarding new credential");
                return Err(Error::Authentication(
                    "logged out while renewal was in flight".into(),
                ));
            }
            *state = Some(credential.clone());
        }
        info!(
            subject_id = %credential.subject_id,
            ttl_secs = ttl.as_secs(),
            "credential installed"
        );

        if let Some(store) = &self.store {
            let still_current = || self.generation.load(Ordering::SeqCst) == generation;
            match store.save_if(&credential, still_current).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("logout happened before persisting, record left cleared");
                    return Err(Error::Authentication(
                        "logged out while renewal was in flight".into(),
                    ));
                }
                Err(e) => warn!(error = %e, "failed to persist credential"),
            }
        }
        Ok(())
    }
}

fn record_renewal(kind: &'static str, outcome: &'static str) {
    metrics::counter!("gateway_token_renewals_total", "kind" => kind, "outcome" => outcome)
        .increment(1);
}
