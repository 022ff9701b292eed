//! Auth provider protocol constants

use std::time::Duration;

/// Header carrying the subject id on refresh calls and on every platform request.
pub const SUBJECT_HEADER: &str = "userid";

/// Token lifetime assumed when the provider omits `expiresIn`.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Tokens are treated as expired this long before their real expiry.
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(300);
