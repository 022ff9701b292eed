//! Auth provider calls: sign-in and refresh
//!
//! Both endpoints answer with `{accessToken, refreshToken, id}` and optionally
//! `expiresIn` (seconds). A response missing any of the first three is
//! rejected here, before it can reach the credential state.

use std::fmt;

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::constants::SUBJECT_HEADER;
use crate::error::{Error, Result};

/// Wire shape of the provider response. Every field is optional so that a
/// malformed response is reported as an authentication error, not a decode panic.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    id: Option<serde_json::Value>,
    expires_in: Option<u64>,
}

/// A validated token set returned by sign-in or refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub subject_id: String,
    /// Seconds until the access token expires, when the provider reports it
    pub expires_in: Option<u64>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("subject_id", &self.subject_id)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

impl TokenResponse {
    fn validate(self, what: &str) -> Result<TokenGrant> {
        let access_token = non_empty(self.access_token)
            .ok_or_else(|| Error::Authentication(format!("{what} response missing accessToken")))?;
        let refresh_token = non_empty(self.refresh_token)
            .ok_or_else(|| Error::Authentication(format!("{what} response missing refreshToken")))?;
        // The provider has used both numeric and string ids
        let subject_id = match self.id {
            Some(serde_json::Value::String(s)) => non_empty(Some(s)),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
        .ok_or_else(|| Error::Authentication(format!("{what} response missing id")))?;

        Ok(TokenGrant {
            access_token,
            refresh_token,
            subject_id,
            expires_in: self.expires_in,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Sign in with the service account's email and password.
pub async fn sign_in(
    client: &reqwest::Client,
    url: &str,
    email: &str,
    password: &Secret<String>,
) -> Result<TokenGrant> {
    debug!(url, "signing in");
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "email": email,
            "password": password.expose(),
        }))
        .send()
        .await
        .map_err(|e| Error::Network(format!("sign-in request failed: {e}")))?;

    read_grant(response, "sign-in").await
}

/// Exchange a refresh token for a new token set.
pub async fn refresh(
    client: &reqwest::Client,
    url: &str,
    refresh_token: &str,
    subject_id: &str,
) -> Result<TokenGrant> {
    debug!(url, subject_id, "refreshing token");
    let response = client
        .post(url)
        .bearer_auth(refresh_token)
        .header(SUBJECT_HEADER, subject_id)
        .send()
        .await
        .map_err(|e| Error::Network(format!("token refresh request failed: {e}")))?;

    read_grant(response, "refresh").await
}

async fn read_grant(response: reqwest::Response, what: &str) -> Result<TokenGrant> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Network(format!("reading {what} response: {e}")))?;

    if !status.is_success() {
        return Err(Error::Authentication(format!(
            "{what} returned {status}: {body}"
        )));
    }

    let parsed: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| Error::Authentication(format!("invalid {what} response: {e}")))?;
    parsed.validate(what)
}
