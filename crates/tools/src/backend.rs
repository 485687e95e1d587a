//! The seam between tools and the provider stack.
//!
//! The daemon implements [`ModelBackend`] with routing, per-provider
//! permits, and candidate fallback behind it; tools only express what they
//! need from a completion.

use std::collections::HashMap;

use {async_trait::async_trait, tokio_util::sync::CancellationToken};

use {
    relay_protocol::ErrorShape,
    relay_providers::{ChatMessage, TokenUsage},
    relay_routing::ToolNeeds,
};

use crate::progress::ProgressSink;

/// One completion request, pre-routing.
#[derive(Debug, Clone, Default)]
pub struct BackendRequest {
    /// Model named in the call arguments (may be `auto` or absent).
    pub requested_model: Option<String>,
    /// The tool's declared preferred model.
    pub tool_hint: Option<String>,
    /// Model that served the previous turn of the conversation.
    pub last_used: Option<String>,
    pub needs: ToolNeeds,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub websearch: bool,
    /// Image URLs or data URIs attached to the final user message.
    pub images: Vec<String>,
    /// Stream deltas back as progress frames while the call runs.
    pub stream_progress: bool,
    /// Provider-specific uploaded-file ids, keyed by provider name. The
    /// router only considers providers present here when non-empty.
    pub provider_file_ids: HashMap<String, Vec<String>>,
}

impl BackendRequest {
    #[must_use]
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }
}

/// Outcome of a routed completion.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub provider: String,
    pub model: String,
}

/// Routed, permit-accounted access to the provider registry.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Configured provider names, in registration order.
    fn provider_names(&self) -> Vec<String>;

    /// Execute one completion, walking router candidates on retryable
    /// provider failures. Emits a progress note on each fallback. Provider
    /// permits are acquired within `deadline`; saturation past it fails
    /// `Overloaded` without starting the call.
    async fn complete(
        &self,
        cancel: &CancellationToken,
        deadline: std::time::Instant,
        progress: &dyn ProgressSink,
        req: BackendRequest,
    ) -> Result<BackendResponse, ErrorShape>;

    /// Upload a file to every provider that supports files, returning
    /// `(provider, external_id)` pairs. Partial success is success.
    async fn upload_file(
        &self,
        cancel: &CancellationToken,
        deadline: std::time::Instant,
        bytes: Vec<u8>,
        filename: String,
        content_type: String,
    ) -> Result<Vec<(String, String)>, ErrorShape>;
}
