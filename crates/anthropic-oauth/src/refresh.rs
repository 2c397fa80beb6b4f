//! Proactive background token refresh
//!
//! Spawns a periodic task that refreshes the OAuth token before it gets
//! close enough to expiry to stall a request. The task goes through the
//! provider's single-flight path, so it never races a request-time refresh.

use std::sync::Arc;
use std::time::Duration;

use provider::{Provider, RefreshOutcome};
use tracing::{debug, info, warn};

use crate::provider::OAuthProvider;

/// Spawn a background task that proactively refreshes an expiring token.
///
/// Runs every `interval` and refreshes when the token expires within
/// `threshold`. A rejected refresh token stops the task; the provider will
/// keep reporting the rejection to callers until re-authentication.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    provider: Arc<OAuthProvider>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, the token was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Some(RefreshOutcome::Rejected) = refresh_cycle(&provider, threshold).await {
                warn!("background refresh stopped, re-authentication required");
                break;
            }
        }
    })
}

/// Run one cycle. Returns the refresh outcome when a refresh was attempted.
async fn refresh_cycle(provider: &OAuthProvider, threshold: Duration) -> Option<RefreshOutcome> {
    if !provider.expires_within(threshold) {
        debug!("token not within refresh threshold, skipping");
        return None;
    }

    let outcome = provider.refresh_within(threshold).await;
    match outcome {
        RefreshOutcome::Refreshed | RefreshOutcome::NotRequired => {
            info!(outcome = outcome.label(), "background token refresh succeeded");
        }
        RefreshOutcome::Rejected => {
            warn!("background refresh rejected by token endpoint");
        }
        RefreshOutcome::Unavailable { attempts } => {
            warn!(attempts, "background refresh failed (transient), will retry next cycle");
        }
    }
    Some(outcome)
}
