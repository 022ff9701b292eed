//! Background token keep-alive
//!
//! Renews the service token ahead of expiry so platform calls rarely pay for
//! a renewal themselves. Renewals still go through the token manager's
//! single-flight path, so a tick that races a request-driven renewal joins it.

use std::time::Duration;

use gateway_auth::TokenManager;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Spawn a task that calls `ensure_valid_token` every `interval`.
///
/// The first tick fires immediately, so the token is warmed at startup.
/// Failures are logged and retried on the next tick.
pub fn spawn_keepalive(tokens: TokenManager, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            keepalive_cycle(&tokens).await;
        }
    })
}

/// One keep-alive pass. Returns whether a valid token is held afterwards.
async fn keepalive_cycle(tokens: &TokenManager) -> bool {
    let valid = tokens.ensure_valid_token().await;
    crate::metrics::set_token_valid(valid);
    if valid {
        debug!("keep-alive: token valid");
    } else {
        warn!("keep-alive: no valid token, will retry next cycle");
    }
    valid
}
