//! Metric name constants and histogram buckets.
//!
//! Names are registered here so dashboards and tests reference one spelling.

/// Tool dispatch metrics. Labels: `tool`, `provider`, `outcome`.
pub mod tool {
    pub const CALLS_TOTAL: &str = "relay_tool_calls_total";
    pub const CALL_DURATION_SECONDS: &str = "relay_tool_call_duration_seconds";
}

/// Provider metrics. Labels: `provider`, `model`, `direction`.
pub mod provider {
    pub const TOKENS_TOTAL: &str = "relay_provider_tokens_total";
    pub const CALLS_TOTAL: &str = "relay_provider_calls_total";
    pub const FALLBACKS_TOTAL: &str = "relay_provider_fallbacks_total";
}

/// Daemon gauges.
pub mod daemon {
    pub const SESSIONS_OPEN: &str = "relay_sessions_open";
    pub const INFLIGHT_GLOBAL: &str = "relay_inflight_global";
    pub const SINGLEFLIGHT_DEDUP_TOTAL: &str = "relay_singleflight_dedup_total";
    pub const PROGRESS_DROPPED_TOTAL: &str = "relay_progress_dropped_total";
    pub const TOKEN_ROTATIONS_TOTAL: &str = "relay_token_rotations_total";
}

/// Histogram buckets, tuned for LLM-backed calls (long tail).
pub mod buckets {
    pub const TOOL_DURATION: &[f64] = &[
        0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 240.0,
    ];
}
