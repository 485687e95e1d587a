use std::{path::PathBuf, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::Serialize,
    tracing::warn,
};

// ── Env helpers ──────────────────────────────────────────────────────────────

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparseable env value, using default");
                default
            },
        },
    }
}

fn env_list(key: &str) -> Vec<String> {
    env_string(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_string(key).as_deref() {
        None => default,
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        Some(other) => {
            warn!(key, value = other, "unrecognized flag value, using default");
            default
        },
    }
}

// ── Sections ─────────────────────────────────────────────────────────────────

/// Caps for the three admission layers, plus the per-session wait queue.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConcurrencyLimits {
    pub global: usize,
    pub per_provider: usize,
    pub per_session: usize,
    /// Calls allowed to wait for a session permit once the semaphore is
    /// exhausted. Beyond this the call fails `SessionOverloaded` without
    /// queueing; 0 disables queueing entirely.
    pub session_queue_depth: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            global: 24,
            per_provider: 8,
            per_session: 4,
            session_queue_depth: 8,
        }
    }
}

/// Coordinated timeout hierarchy: tool < daemon wrapper < external shim.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimeoutHierarchy {
    pub tool_default: Duration,
    pub daemon_multiplier: f64,
    pub shim_multiplier: f64,
}

impl Default for TimeoutHierarchy {
    fn default() -> Self {
        Self {
            tool_default: Duration::from_secs(120),
            daemon_multiplier: 1.5,
            shim_multiplier: 2.0,
        }
    }
}

impl TimeoutHierarchy {
    /// Effective deadline for a call: `min(client-supplied, tool default)`,
    /// never above the daemon ceiling.
    #[must_use]
    pub fn deadline_for(&self, client: Option<Duration>, tool_default: Duration) -> Duration {
        let base = client.map_or(tool_default, |c| c.min(tool_default));
        base.min(self.daemon_ceiling(tool_default))
    }

    /// How long the daemon wrapper waits past the tool budget before the
    /// worker is considered stuck.
    #[must_use]
    pub fn daemon_ceiling(&self, tool_budget: Duration) -> Duration {
        tool_budget.mul_f64(self.daemon_multiplier.max(1.0))
    }
}

/// One upstream provider: keys, endpoint, preference list.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub api_keys: Vec<Secret<String>>,
    pub base_url: String,
    pub preferred_models: Vec<String>,
}

impl ProviderEndpoint {
    fn from_env(key_var: &str, url_var: &str, models_var: &str, default_url: &str) -> Self {
        let api_keys = env_list(key_var).into_iter().map(Secret::new).collect();
        Self {
            api_keys,
            base_url: env_string(url_var).unwrap_or_else(|| default_url.to_string()),
            preferred_models: env_list(models_var),
        }
    }

    #[must_use]
    pub fn configured(&self) -> bool {
        self.api_keys
            .iter()
            .any(|k| !k.expose_secret().trim().is_empty())
    }
}

/// Both in-scope providers.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kimi: ProviderEndpoint,
    pub glm: ProviderEndpoint,
}

impl ProviderSettings {
    /// Preference lists in configured provider order, for the router.
    #[must_use]
    pub fn preference_lists(&self) -> Vec<(String, Vec<String>)> {
        vec![
            ("kimi".to_string(), self.kimi.preferred_models.clone()),
            ("glm".to_string(), self.glm.preferred_models.clone()),
        ]
    }
}

/// Capability toggles.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FeatureFlags {
    pub streaming: bool,
    pub websearch: bool,
}

// ── Root config ──────────────────────────────────────────────────────────────

/// Everything the daemon reads from the environment, parsed once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_host: String,
    pub bind_port: u16,

    pub auth_token: Option<Secret<String>>,
    pub auth_token_file: Option<PathBuf>,
    pub token_rotation_grace: Duration,

    pub max_frame_bytes: usize,
    pub limits: ConcurrencyLimits,
    pub timeouts: TimeoutHierarchy,

    pub conversation_ttl: Duration,
    pub session_idle_ttl: Duration,
    pub shutdown_grace: Duration,

    pub providers: ProviderSettings,

    pub health_file_path: Option<PathBuf>,
    pub health_write_interval: Duration,

    pub database_url: Option<String>,
    pub redis_url: Option<String>,

    pub features: FeatureFlags,
    pub tool_allowlist: Vec<String>,
    pub tool_denylist: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".into(),
            bind_port: 8765,
            auth_token: None,
            auth_token_file: None,
            token_rotation_grace: Duration::from_secs(30),
            max_frame_bytes: relay_default_max_frame_bytes(),
            limits: ConcurrencyLimits::default(),
            timeouts: TimeoutHierarchy::default(),
            conversation_ttl: Duration::from_secs(3 * 3600),
            session_idle_ttl: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(10),
            providers: ProviderSettings {
                kimi: ProviderEndpoint {
                    api_keys: Vec::new(),
                    base_url: KIMI_DEFAULT_BASE_URL.into(),
                    preferred_models: Vec::new(),
                },
                glm: ProviderEndpoint {
                    api_keys: Vec::new(),
                    base_url: GLM_DEFAULT_BASE_URL.into(),
                    preferred_models: Vec::new(),
                },
            },
            health_file_path: None,
            health_write_interval: Duration::from_secs(5),
            database_url: None,
            redis_url: None,
            features: FeatureFlags {
                streaming: true,
                websearch: false,
            },
            tool_allowlist: Vec::new(),
            tool_denylist: Vec::new(),
        }
    }
}

pub const KIMI_DEFAULT_BASE_URL: &str = "https://api.moonshot.ai/v1";
pub const GLM_DEFAULT_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";

fn relay_default_max_frame_bytes() -> usize {
    32 * 1024 * 1024
}

impl RelayConfig {
    /// Read the full configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_host: env_string("BIND_HOST").unwrap_or(defaults.bind_host),
            bind_port: env_parse("BIND_PORT", defaults.bind_port),
            auth_token: env_string("AUTH_TOKEN").map(Secret::new),
            auth_token_file: env_string("AUTH_TOKEN_FILE").map(PathBuf::from),
            token_rotation_grace: Duration::from_secs(env_parse("TOKEN_ROTATION_GRACE_S", 30u64)),
            max_frame_bytes: env_parse("MAX_FRAME_BYTES", defaults.max_frame_bytes),
            limits: ConcurrencyLimits {
                global: env_parse("GLOBAL_INFLIGHT_MAX", defaults.limits.global),
                per_provider: env_parse("PROVIDER_INFLIGHT_MAX", defaults.limits.per_provider),
                per_session: env_parse("SESSION_INFLIGHT_MAX", defaults.limits.per_session),
                session_queue_depth: env_parse(
                    "SESSION_QUEUE_DEPTH",
                    defaults.limits.session_queue_depth,
                ),
            },
            timeouts: TimeoutHierarchy {
                tool_default: Duration::from_secs_f64(
                    env_parse("TOOL_DEFAULT_TIMEOUT_S", 120.0f64).max(0.0),
                ),
                daemon_multiplier: env_parse("DAEMON_TIMEOUT_MULTIPLIER", 1.5f64),
                shim_multiplier: env_parse("SHIM_TIMEOUT_MULTIPLIER", 2.0f64),
            },
            conversation_ttl: Duration::from_secs(env_parse("CONVERSATION_TTL_S", 3 * 3600u64)),
            session_idle_ttl: Duration::from_secs(env_parse("SESSION_IDLE_TTL_S", 3600u64)),
            shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_S", 10u64)),
            providers: ProviderSettings {
                kimi: ProviderEndpoint::from_env(
                    "KIMI_API_KEY",
                    "KIMI_BASE_URL",
                    "KIMI_PREFERRED_MODELS",
                    KIMI_DEFAULT_BASE_URL,
                ),
                glm: ProviderEndpoint::from_env(
                    "GLM_API_KEY",
                    "GLM_BASE_URL",
                    "GLM_PREFERRED_MODELS",
                    GLM_DEFAULT_BASE_URL,
                ),
            },
            health_file_path: env_string("HEALTH_FILE_PATH").map(PathBuf::from),
            health_write_interval: Duration::from_secs(env_parse("HEALTH_WRITE_INTERVAL_S", 5u64)),
            database_url: env_string("DATABASE_URL"),
            redis_url: env_string("REDIS_URL"),
            features: FeatureFlags {
                streaming: env_flag("FEATURE_STREAMING", true),
                websearch: env_flag("FEATURE_WEBSEARCH", false),
            },
            tool_allowlist: env_list("TOOL_ALLOWLIST"),
            tool_denylist: env_list("TOOL_DENYLIST"),
        }
    }

    /// Redacted summary for the diagnostics tool and startup log. Secrets
    /// never appear here.
    #[must_use]
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "bind": format!("{}:{}", self.bind_host, self.bind_port),
            "auth_configured": self.auth_token.is_some() || self.auth_token_file.is_some(),
            "max_frame_bytes": self.max_frame_bytes,
            "limits": self.limits,
            "timeouts": {
                "tool_default_s": self.timeouts.tool_default.as_secs_f64(),
                "daemon_multiplier": self.timeouts.daemon_multiplier,
                "shim_multiplier": self.timeouts.shim_multiplier,
            },
            "conversation_ttl_s": self.conversation_ttl.as_secs(),
            "session_idle_ttl_s": self.session_idle_ttl.as_secs(),
            "providers": {
                "kimi": { "configured": self.providers.kimi.configured(), "models": self.providers.kimi.preferred_models.clone() },
                "glm": { "configured": self.providers.glm.configured(), "models": self.providers.glm.preferred_models.clone() },
            },
            "persistence": {
                "database": self.database_url.is_some(),
                "redis": self.redis_url.is_some(),
            },
            "features": self.features,
        })
    }
}
