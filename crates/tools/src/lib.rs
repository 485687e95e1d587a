//! Tool contract, registry, and the built-in tools.
//!
//! Two tool shapes share one trait: a *simple* tool answers a single
//! request, a *workflow* tool threads a continuation id through multiple
//! steps. Tools never talk to providers directly; they go through the
//! [`ModelBackend`] handle, which owns routing, fallback, and permit
//! accounting.

pub mod analyze;
pub mod backend;
pub mod chat;
pub mod files;
pub mod progress;
pub mod registry;
pub mod schema;
pub mod status;

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait, serde_json::Value, tokio_util::sync::CancellationToken, uuid::Uuid,
};

use {
    relay_protocol::{ErrorShape, ToolDescriptor, UsageInfo},
    relay_sessions::ConversationService,
    relay_storage::Repository,
};

pub use {
    backend::{BackendRequest, BackendResponse, ModelBackend},
    progress::{NullSink, ProgressSink},
    registry::ToolRegistry,
    schema::CommonArgs,
};

/// Scope of single-flight deduplication for a tool's calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupScope {
    /// Identical calls collapse across all sessions.
    Global,
    /// Identical calls collapse only within one session.
    PerSession,
}

/// Everything a tool execution can reach.
pub struct ToolContext {
    pub arguments: serde_json::Map<String, Value>,
    /// Validated continuation id, when the call carried one.
    pub continuation_id: Option<Uuid>,
    pub session_id: Uuid,
    pub client_name: String,
    pub conversations: Arc<ConversationService>,
    pub repo: Arc<Repository>,
    pub backend: Arc<dyn ModelBackend>,
    pub progress: Arc<dyn ProgressSink>,
    pub cancel: CancellationToken,
    /// Absolute deadline for this call, already coordinated across layers.
    pub deadline: std::time::Instant,
}

/// Terminal output of a successful tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub value: Value,
    pub usage: Option<UsageInfo>,
    pub continuation_id: Option<Uuid>,
}

impl ToolOutput {
    #[must_use]
    pub fn value(value: Value) -> Self {
        Self {
            value,
            usage: None,
            continuation_id: None,
        }
    }
}

/// A named operation invocable via `call_tool`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn describe(&self) -> ToolDescriptor;

    /// Capabilities the serving model must have.
    fn needs(&self) -> relay_routing::ToolNeeds {
        relay_routing::ToolNeeds::default()
    }

    /// Model this tool works best with, consulted by the router after an
    /// explicit request and before preference lists.
    fn preferred_model(&self) -> Option<&str> {
        None
    }

    fn dedup_scope(&self) -> DedupScope {
        DedupScope::Global
    }

    /// Per-call timeout override; `None` means the configured tool default.
    /// Workflow tools may extend their terminal step here.
    fn timeout_hint(&self, _arguments: &serde_json::Map<String, Value>) -> Option<Duration> {
        None
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolOutput, ErrorShape>;
}
