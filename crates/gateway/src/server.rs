//! Listener assembly and graceful shutdown.

use std::sync::Arc;

use {
    anyhow::Context,
    axum::{
        Router,
        extract::{State, WebSocketUpgrade},
        response::IntoResponse,
        routing::get,
    },
    tokio::net::TcpListener,
    tracing::{info, warn},
};

use {relay_config::RelayConfig, relay_metrics::MetricsHandle};

use crate::{state::GatewayState, watchdog, ws};

/// Validate, build state, bind, and serve until shutdown.
pub async fn serve(config: RelayConfig, metrics: Option<MetricsHandle>) -> anyhow::Result<()> {
    let validation = relay_config::validate(&config);
    for diagnostic in &validation.diagnostics {
        match diagnostic.severity {
            relay_config::Severity::Error => {
                tracing::error!(path = %diagnostic.path, "{}", diagnostic.message);
            },
            relay_config::Severity::Warning => {
                warn!(path = %diagnostic.path, "{}", diagnostic.message);
            },
            relay_config::Severity::Info => {
                info!(path = %diagnostic.path, "{}", diagnostic.message);
            },
        }
    }
    if validation.has_errors() {
        anyhow::bail!("configuration is invalid; refusing to start");
    }

    let addr = format!("{}:{}", config.bind_host, config.bind_port);
    let state = GatewayState::build(config).await;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    serve_on(state, listener, metrics).await
}

/// Serve on an already-bound listener (tests bind port 0 themselves).
pub async fn serve_on(
    state: Arc<GatewayState>,
    listener: TcpListener,
    metrics: Option<MetricsHandle>,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    state.health.set_listening(true);
    info!(addr = %local_addr, "daemon listening");

    tokio::spawn(watchdog::run(Arc::clone(&state)));

    let app = router(Arc::clone(&state), metrics);
    let shutdown_state = Arc::clone(&state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown_state.health.set_listening(false);
            // Drain in the background; completing this future stops the
            // accept loop immediately.
            tokio::spawn(drain(shutdown_state));
        })
        .await?;

    info!("daemon stopped");
    Ok(())
}

#[must_use]
pub fn router(state: Arc<GatewayState>, metrics: Option<MetricsHandle>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_handler));
    if let Some(handle) = metrics {
        app = app.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }
    app.with_state(state)
}

async fn ws_upgrade(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // The transport cap sits above our own so the daemon's frame-size error
    // is what clients observe.
    let transport_cap = state.config.max_frame_bytes.saturating_add(4096);
    ws.max_message_size(transport_cap)
        .on_upgrade(move |socket| ws::handle_connection(socket, state))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    axum::Json(state.health.snapshot())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "sigterm handler unavailable, ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            },
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Grace-bounded drain: let in-flight calls finish, then cancel the rest.
async fn drain(state: Arc<GatewayState>) {
    let grace = state.config.shutdown_grace;
    let deadline = std::time::Instant::now() + grace;

    while std::time::Instant::now() < deadline {
        if state.sessions.total_inflight() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    let remaining = state.sessions.total_inflight();
    if remaining > 0 {
        info!(remaining, "grace expired, cancelling remaining calls");
    }
    state.shutdown.cancel();

    // Give cancelled workers a moment to flush their terminal frames.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    for id in state.sessions.ids() {
        state.sessions.close(id);
    }

    if let Some(path) = state.config.health_file_path.clone() {
        state.health.write_file(&path).await;
    }
}
