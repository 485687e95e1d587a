//! Health snapshot: served at `/health` and written periodically to the
//! configured health file.

use std::{
    path::Path,
    sync::{
        RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    tracing::debug,
};

use relay_tools::status::StatusSource;

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub listening: bool,
    pub sessions_open: usize,
    pub inflight_global: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub version: String,
}

pub struct HealthState {
    pid: u32,
    started_at: DateTime<Utc>,
    version: String,
    listening: AtomicBool,
    sessions_open: AtomicUsize,
    inflight_global: AtomicUsize,
    last_error: RwLock<Option<String>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            listening: AtomicBool::new(false),
            sessions_open: AtomicUsize::new(0),
            inflight_global: AtomicUsize::new(0),
            last_error: RwLock::new(None),
        }
    }

    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        let open = self.sessions_open.fetch_add(1, Ordering::Relaxed) + 1;
        relay_metrics::gauge!(relay_metrics::daemon::SESSIONS_OPEN).set(open as f64);
    }

    pub fn session_closed(&self) {
        let open = self
            .sessions_open
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(1)
            .saturating_sub(1);
        relay_metrics::gauge!(relay_metrics::daemon::SESSIONS_OPEN).set(open as f64);
    }

    pub fn set_inflight(&self, inflight: usize) {
        self.inflight_global.store(inflight, Ordering::Relaxed);
        relay_metrics::gauge!(relay_metrics::daemon::INFLIGHT_GLOBAL).set(inflight as f64);
    }

    pub fn inflight_inc(&self) {
        let now = self.inflight_global.fetch_add(1, Ordering::Relaxed) + 1;
        relay_metrics::gauge!(relay_metrics::daemon::INFLIGHT_GLOBAL).set(now as f64);
    }

    pub fn inflight_dec(&self) {
        let now = self
            .inflight_global
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(1)
            .saturating_sub(1);
        relay_metrics::gauge!(relay_metrics::daemon::INFLIGHT_GLOBAL).set(now as f64);
    }

    pub fn record_error(&self, error: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.write() {
            *guard = Some(error.into());
        }
    }

    #[must_use]
    pub fn sessions_open(&self) -> usize {
        self.sessions_open.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn inflight_global(&self) -> usize {
        self.inflight_global.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            pid: self.pid,
            started_at: self.started_at,
            listening: self.listening.load(Ordering::Relaxed),
            sessions_open: self.sessions_open(),
            inflight_global: self.inflight_global(),
            last_error: self.last_error.read().ok().and_then(|g| g.clone()),
            version: self.version.clone(),
        }
    }

    /// Rewrite the health file. Best-effort: failures are logged, never
    /// propagated.
    pub async fn write_file(&self, path: &Path) {
        let snapshot = self.snapshot();
        let Ok(body) = serde_json::to_vec_pretty(&snapshot) else {
            return;
        };
        if let Err(e) = tokio::fs::write(path, body).await {
            debug!(path = %path.display(), error = %e, "health file write failed");
        }
    }
}

impl StatusSource for HealthState {
    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(HealthState::snapshot(self)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_gauges_track_open_close() {
        let health = HealthState::new();
        health.session_opened();
        health.session_opened();
        health.session_closed();
        assert_eq!(health.sessions_open(), 1);
    }

    #[test]
    fn snapshot_reflects_state() {
        let health = HealthState::new();
        health.set_listening(true);
        health.set_inflight(3);
        health.record_error("boom");
        let snap = health.snapshot();
        assert!(snap.listening);
        assert_eq!(snap.inflight_global, 3);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
        assert_eq!(snap.pid, std::process::id());
    }

    #[tokio::test]
    async fn write_file_round_trips() {
        let dir = std::env::temp_dir().join(format!("relay-health-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("health.json");
        let health = HealthState::new();
        health.set_listening(true);
        health.write_file(&path).await;
        let body = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(body.contains("\"listening\": true"));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
