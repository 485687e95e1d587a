//! Shared daemon state, constructed once and injected everywhere.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use {
    relay_config::RelayConfig,
    relay_protocol::{PROTOCOL_VERSION, ServerCaps, TimeoutCaps},
    relay_providers::ProviderRegistry,
    relay_sessions::{CharsPerFour, ConversationService},
    relay_storage::Repository,
    relay_tools::{ModelBackend, ToolRegistry, analyze, chat, files, status},
};

use crate::{
    auth::TokenManager, concurrency::ConcurrencyController, exchange::Exchange,
    health::HealthState, session::SessionManager,
};

pub struct GatewayState {
    pub config: RelayConfig,
    pub health: Arc<HealthState>,
    pub tokens: TokenManager,
    pub sessions: SessionManager,
    pub controller: Arc<ConcurrencyController>,
    pub providers: Arc<ProviderRegistry>,
    pub tools: ToolRegistry,
    pub conversations: Arc<ConversationService>,
    pub repo: Arc<Repository>,
    pub backend: Arc<dyn ModelBackend>,
    /// Root cancellation for graceful shutdown; every session token is a
    /// child of this.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    /// Build from configuration, connecting the configured backends.
    pub async fn build(config: RelayConfig) -> Arc<Self> {
        let providers = Arc::new(ProviderRegistry::from_settings(&config.providers));
        Self::build_with_providers(config, providers).await
    }

    /// Build with an explicit provider registry (tests inject fakes here).
    pub async fn build_with_providers(
        config: RelayConfig,
        providers: Arc<ProviderRegistry>,
    ) -> Arc<Self> {
        let health = Arc::new(HealthState::new());
        let shutdown = CancellationToken::new();

        let repo = Arc::new(
            Repository::connect(config.database_url.as_deref(), config.redis_url.as_deref())
                .await,
        );
        let conversations = Arc::new(ConversationService::new(
            Arc::clone(&repo),
            config.conversation_ttl,
            Arc::new(CharsPerFour),
        ));

        let controller = Arc::new(ConcurrencyController::new(
            config.limits.global,
            config.limits.per_provider,
            Arc::clone(&health),
        ));
        let sessions = SessionManager::new(
            config.limits.per_session,
            config.limits.session_queue_depth,
            config.session_idle_ttl,
            Arc::clone(&health),
            shutdown.clone(),
        );

        let backend: Arc<dyn ModelBackend> = Arc::new(Exchange::new(
            Arc::clone(&providers),
            config.providers.preference_lists(),
            Arc::clone(&controller),
            config.features,
        ));

        let tools = default_tool_registry(&config, Arc::clone(&health));
        let tokens = TokenManager::new(config.auth_token.as_ref(), config.token_rotation_grace);

        Arc::new(Self {
            config,
            health,
            tokens,
            sessions,
            controller,
            providers,
            tools,
            conversations,
            repo,
            backend,
            shutdown,
        })
    }

    /// Capabilities advertised in `hello_ack`, filtered for the client.
    #[must_use]
    pub fn server_caps(&self, client_name: &str) -> ServerCaps {
        ServerCaps {
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
            tools: self
                .tools
                .visible_for(client_name)
                .into_iter()
                .map(|d| d.name)
                .collect(),
            models: self
                .providers
                .model_catalog()
                .into_iter()
                .map(|(_, model, _, _)| model)
                .collect(),
            timeouts: TimeoutCaps {
                tool_default_s: self.config.timeouts.tool_default.as_secs_f64(),
                daemon_multiplier: self.config.timeouts.daemon_multiplier,
                shim_multiplier: self.config.timeouts.shim_multiplier,
            },
            max_frame_bytes: self.config.max_frame_bytes,
        }
    }
}

fn default_tool_registry(config: &RelayConfig, health: Arc<HealthState>) -> ToolRegistry {
    let mut registry = ToolRegistry::new(
        config.tool_allowlist.clone(),
        config.tool_denylist.clone(),
    );
    registry.register("chat", chat::factory);
    registry.register("analyze", analyze::factory);
    registry.register("upload_file", files::upload_factory);
    registry.register("query_file", files::query_factory);
    registry.register(
        "status",
        status::factory(
            health as Arc<dyn status::StatusSource>,
            config.summary(),
        ),
    );
    registry
}
