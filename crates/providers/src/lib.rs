//! Upstream LLM provider implementations and registry.
//!
//! Two providers are in scope, both speaking an OpenAI-compatible HTTP
//! dialect: Kimi (Moonshot) and GLM (ZhipuAI). Everything provider-specific
//! lives behind the [`Provider`] trait; the daemon only sees capabilities,
//! typed errors, and cancellation-aware calls.

pub mod error;
pub mod glm;
pub mod key_pool;
pub mod kimi;
pub mod openai_compat;

use std::{pin::Pin, sync::Arc};

use {
    async_trait::async_trait, serde::{Deserialize, Serialize}, tokio_stream::Stream,
    tokio_util::sync::CancellationToken,
};

use relay_config::ProviderSettings;

pub use crate::{
    error::{ProviderError, Result, retry_after_ms_from_headers},
    key_pool::KeyPool,
};

/// Shared HTTP client for LLM providers.
///
/// All providers reuse this client to share connection pools, DNS cache,
/// and TLS sessions.
pub fn shared_http_client() -> &'static reqwest::Client {
    static CLIENT: std::sync::LazyLock<reqwest::Client> =
        std::sync::LazyLock::new(reqwest::Client::new);
    &CLIENT
}

// ── Request/response types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One completion request, already routed to a concrete model.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub websearch: bool,
    /// Image URLs or data URIs, attached to the final user message as
    /// multimodal content parts.
    pub images: Vec<String>,
    /// Provider-side file ids previously returned by `upload_file`.
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Events yielded by a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Text content delta.
    Delta(String),
    /// Stream completed; terminal token accounting.
    Done(TokenUsage),
    /// Stream failed.
    Error(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Metadata for a file upload.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub filename: String,
    pub content_type: String,
}

// ── Capabilities ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SupportMatrix {
    pub images: bool,
    pub files: bool,
    pub websearch: bool,
    pub streaming: bool,
    pub tools: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapability {
    pub name: String,
    pub model_aliases: Vec<String>,
    pub context_window: u32,
    pub supports: SupportMatrix,
}

// ── Provider trait ───────────────────────────────────────────────────────────

/// An upstream LLM service.
///
/// Implementations must honor cancellation at every suspension point,
/// classify failures via [`ProviderError`], and never leak background work
/// past return.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapability;

    /// Context window in tokens for a model this provider serves.
    fn context_window(&self, model: &str) -> u32;

    async fn generate(
        &self,
        cancel: &CancellationToken,
        req: GenerateRequest,
    ) -> Result<GenerateResponse>;

    /// Streaming completion: deltas, then exactly one `Done` or `Error`.
    fn stream(&self, cancel: CancellationToken, req: GenerateRequest) -> EventStream;

    /// Upload a file, returning the provider's external file id. Only
    /// meaningful when `capabilities().supports.files` is set.
    async fn upload_file(
        &self,
        _cancel: &CancellationToken,
        _bytes: Vec<u8>,
        _meta: FileMeta,
    ) -> Result<String> {
        Err(ProviderError::Fatal(format!(
            "{} does not support file upload",
            self.name()
        )))
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// The set of configured providers, in configuration order.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    /// Build from configuration; providers without keys are skipped.
    #[must_use]
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        if settings.kimi.configured() {
            providers.push(Arc::new(kimi::KimiProvider::new(&settings.kimi)));
        }
        if settings.glm.configured() {
            providers.push(Arc::new(glm::GlmProvider::new(&settings.glm)));
        }
        Self { providers }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(Arc::clone)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Map a model alias to its serving provider. Alias sets should be
    /// disjoint across providers; on overlap the first registered wins.
    #[must_use]
    pub fn resolve_model(&self, alias: &str) -> Option<(Arc<dyn Provider>, String)> {
        let alias = alias.trim();
        for provider in &self.providers {
            let caps = provider.capabilities();
            if caps.model_aliases.iter().any(|m| m == alias) {
                return Some((Arc::clone(provider), alias.to_string()));
            }
        }
        None
    }

    #[must_use]
    pub fn capabilities(&self) -> Vec<ProviderCapability> {
        self.providers.iter().map(|p| p.capabilities()).collect()
    }

    /// Flat per-model view for `list_models`.
    #[must_use]
    pub fn model_catalog(&self) -> Vec<(String, String, u32, SupportMatrix)> {
        let mut out = Vec::new();
        for provider in &self.providers {
            let caps = provider.capabilities();
            for model in &caps.model_aliases {
                out.push((
                    caps.name.clone(),
                    model.clone(),
                    provider.context_window(model),
                    caps.supports,
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider {
        name: &'static str,
        models: Vec<String>,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> ProviderCapability {
            ProviderCapability {
                name: self.name.into(),
                model_aliases: self.models.clone(),
                context_window: 128_000,
                supports: SupportMatrix {
                    images: false,
                    files: false,
                    websearch: false,
                    streaming: true,
                    tools: false,
                },
            }
        }

        fn context_window(&self, _model: &str) -> u32 {
            128_000
        }

        async fn generate(
            &self,
            _cancel: &CancellationToken,
            req: GenerateRequest,
        ) -> Result<GenerateResponse> {
            Ok(GenerateResponse {
                content: "ok".into(),
                usage: TokenUsage::default(),
                model: req.model,
            })
        }

        fn stream(&self, _cancel: CancellationToken, _req: GenerateRequest) -> EventStream {
            Box::pin(tokio_stream::empty())
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(vec![
            Arc::new(FakeProvider {
                name: "alpha",
                models: vec!["model-a".into(), "shared".into()],
            }),
            Arc::new(FakeProvider {
                name: "beta",
                models: vec!["model-b".into(), "shared".into()],
            }),
        ])
    }

    #[test]
    fn resolve_model_first_match_wins() {
        let reg = registry();
        let (provider, model) = reg.resolve_model("shared").unwrap();
        assert_eq!(provider.name(), "alpha");
        assert_eq!(model, "shared");
    }

    #[test]
    fn resolve_model_misses_unknown_alias() {
        assert!(registry().resolve_model("nope").is_none());
    }

    #[test]
    fn model_catalog_covers_all_providers() {
        let catalog = registry().model_catalog();
        assert_eq!(catalog.len(), 4);
        assert!(catalog.iter().any(|(p, m, _, _)| p == "beta" && m == "model-b"));
    }
}
