//! Periodic housekeeping: health-file writes, idle-session reaping,
//! conversation expiry, dead-letter retries, and token-file rotation.

use std::sync::Arc;

use {secrecy::Secret, tracing::debug};

use crate::state::GatewayState;

pub async fn run(state: Arc<GatewayState>) {
    let mut health_tick = tokio::time::interval(
        state
            .config
            .health_write_interval
            .max(std::time::Duration::from_secs(1)),
    );
    let mut reap_tick = tokio::time::interval(std::time::Duration::from_secs(60));
    let mut token_tick = tokio::time::interval(std::time::Duration::from_secs(2));
    let mut last_token_file: Option<String> = None;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                if let Some(path) = state.config.health_file_path.clone() {
                    state.health.write_file(&path).await;
                }
                break;
            },
            _ = health_tick.tick() => {
                state.health.set_inflight(state.sessions.total_inflight());
                if let Some(path) = state.config.health_file_path.clone() {
                    state.health.write_file(&path).await;
                }
            },
            _ = reap_tick.tick() => {
                let reaped = state.sessions.reap();
                if reaped > 0 {
                    debug!(reaped, "idle sessions reaped");
                }
                let expired = state.conversations.reap_expired();
                if expired > 0 {
                    debug!(expired, "expired conversations dropped");
                }
                state.conversations.drain_dead_letters().await;
                touch_sessions(&state).await;
            },
            _ = token_tick.tick() => {
                check_token_file(&state, &mut last_token_file).await;
            },
        }
    }
}

/// Best-effort session presence: `session:<id>` cache keys plus the
/// optional persisted last-activity row.
async fn touch_sessions(state: &Arc<GatewayState>) {
    let ttl = state.config.session_idle_ttl;
    for id in state.sessions.ids() {
        let _ = state
            .repo
            .cache()
            .set(&format!("session:{id}"), "1", ttl)
            .await;
        if let Err(e) = state.repo.touch_session(id, chrono::Utc::now()).await {
            debug!(session = %id, error = %e, "session touch not persisted");
        }
    }
}

/// Rotate the accepted token when the token file's contents change.
/// Existing sessions are untouched; only new handshakes see the new token.
async fn check_token_file(state: &Arc<GatewayState>, last_seen: &mut Option<String>) {
    let Some(path) = state.config.auth_token_file.clone() else {
        return;
    };
    let contents = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw.trim().to_string(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "token file unreadable");
            return;
        },
    };
    if contents.is_empty() {
        return;
    }
    if last_seen.as_deref() == Some(contents.as_str()) {
        return;
    }
    // First observation only rotates when the file disagrees with the
    // startup token (or no token was configured at all).
    let needs_rotation = last_seen.is_some()
        || !state.tokens.auth_required()
        || !state.tokens.accepts(&contents);
    if needs_rotation {
        state.tokens.rotate(&Secret::new(contents.clone()));
    }
    *last_seen = Some(contents);
}
