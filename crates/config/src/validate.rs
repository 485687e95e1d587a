//! Startup configuration validation.
//!
//! The timeout hierarchy must be strictly layered (tool ≤ daemon ≤ shim);
//! an inverted hierarchy would let an outer layer give up before an inner
//! one, so it is a hard error rather than a warning.

use crate::schema::RelayConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "timeouts", "limits", "auth", "providers", "listener".
    pub category: &'static str,
    /// Dotted env-ish path, e.g. "timeouts.daemon_multiplier".
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(
        &mut self,
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.diagnostics.push(Diagnostic {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate a configuration, returning every problem found.
#[must_use]
pub fn validate(config: &RelayConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    // ── Timeout hierarchy ────────────────────────────────────────────────
    let t = &config.timeouts;
    if t.tool_default.is_zero() {
        result.push(
            Severity::Error,
            "timeouts",
            "timeouts.tool_default",
            "TOOL_DEFAULT_TIMEOUT_S must be positive",
        );
    }
    if t.daemon_multiplier < 1.0 {
        result.push(
            Severity::Error,
            "timeouts",
            "timeouts.daemon_multiplier",
            format!(
                "DAEMON_TIMEOUT_MULTIPLIER={} inverts the hierarchy (daemon wrapper would \
                 expire before the tool)",
                t.daemon_multiplier
            ),
        );
    }
    if t.shim_multiplier < t.daemon_multiplier {
        result.push(
            Severity::Error,
            "timeouts",
            "timeouts.shim_multiplier",
            format!(
                "SHIM_TIMEOUT_MULTIPLIER={} is below DAEMON_TIMEOUT_MULTIPLIER={} (shim would \
                 give up before the daemon)",
                t.shim_multiplier, t.daemon_multiplier
            ),
        );
    }

    // ── Semaphore caps ───────────────────────────────────────────────────
    for (path, value) in [
        ("limits.global", config.limits.global),
        ("limits.per_provider", config.limits.per_provider),
        ("limits.per_session", config.limits.per_session),
    ] {
        if value == 0 {
            result.push(
                Severity::Error,
                "limits",
                path,
                "concurrency cap must be at least 1",
            );
        }
    }
    if config.limits.per_provider > config.limits.global {
        result.push(
            Severity::Warning,
            "limits",
            "limits.per_provider",
            "PROVIDER_INFLIGHT_MAX exceeds GLOBAL_INFLIGHT_MAX; the global cap dominates",
        );
    }

    // ── Listener ─────────────────────────────────────────────────────────
    if config.bind_port == 0 {
        result.push(
            Severity::Error,
            "listener",
            "bind_port",
            "BIND_PORT must be a concrete port",
        );
    }
    if config.max_frame_bytes < 1024 {
        result.push(
            Severity::Error,
            "listener",
            "max_frame_bytes",
            "MAX_FRAME_BYTES below 1 KiB cannot carry a handshake frame",
        );
    }

    // ── Auth ─────────────────────────────────────────────────────────────
    if config.auth_token.is_none() && config.auth_token_file.is_none() {
        result.push(
            Severity::Warning,
            "auth",
            "auth_token",
            "no AUTH_TOKEN configured; all handshakes will be accepted",
        );
    }

    // ── Providers ────────────────────────────────────────────────────────
    if !config.providers.kimi.configured() && !config.providers.glm.configured() {
        result.push(
            Severity::Warning,
            "providers",
            "providers",
            "no provider API key configured; call_tool will fail at routing",
        );
    }
    for (name, ep) in [
        ("kimi", &config.providers.kimi),
        ("glm", &config.providers.glm),
    ] {
        if ep.configured() && ep.preferred_models.is_empty() {
            result.push(
                Severity::Info,
                "providers",
                format!("providers.{name}.preferred_models"),
                "no preference list; built-in model catalog order applies",
            );
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_errors() {
        let result = validate(&RelayConfig::default());
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn inverted_daemon_multiplier_is_fatal() {
        let mut cfg = RelayConfig::default();
        cfg.timeouts.daemon_multiplier = 0.9;
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.path == "timeouts.daemon_multiplier")
        );
    }

    #[test]
    fn shim_below_daemon_is_fatal() {
        let mut cfg = RelayConfig::default();
        cfg.timeouts.daemon_multiplier = 1.5;
        cfg.timeouts.shim_multiplier = 1.2;
        assert!(validate(&cfg).has_errors());
    }

    #[test]
    fn zero_session_cap_is_fatal() {
        let mut cfg = RelayConfig::default();
        cfg.limits.per_session = 0;
        assert!(validate(&cfg).has_errors());
    }

    #[test]
    fn missing_auth_token_is_only_a_warning() {
        let result = validate(&RelayConfig::default());
        assert!(result.count(Severity::Warning) >= 1);
        assert!(!result.has_errors());
    }
}
