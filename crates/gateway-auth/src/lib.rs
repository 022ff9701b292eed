//! Credential lifecycle for the integration gateway
//!
//! Owns the one piece of shared mutable state in the gateway: the current
//! access/refresh token pair, the subject id they belong to, and their expiry.
//! Everything that talks to the document platform goes through
//! `TokenManager::authorize()` to obtain headers.
//!
//! Credential flow:
//! 1. `TokenManager::restore()` loads a persisted record, if one exists
//! 2. `ensure_valid_token()` signs in with the service account when no token is held
//! 3. Tokens inside the refresh buffer are renewed via `token::refresh()`,
//!    falling back to `token::sign_in()` when the refresh token is rejected
//! 4. A 401 from the platform calls `invalidate_if_current()`, forcing the next
//!    ensure to renew
//! 5. `logout()` drops the credential and deletes the persisted record

pub mod constants;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod token;

pub use constants::*;
pub use credentials::{Credential, CredentialStore, now_millis};
pub use error::{Error, Result};
pub use manager::{AuthConfig, Authorization, TokenManager};
pub use token::{TokenGrant, refresh, sign_in};
