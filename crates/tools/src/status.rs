//! The `status` diagnostics tool.

use {async_trait::async_trait, serde_json::json, std::sync::Arc};

use relay_protocol::{ErrorShape, ToolDescriptor, ToolVisibility};

use crate::{Tool, ToolContext, ToolOutput, schema::tool_schema};

/// Live daemon state the tool reports. Implemented by the gateway.
pub trait StatusSource: Send + Sync {
    fn snapshot(&self) -> serde_json::Value;
}

pub struct StatusTool {
    source: Arc<dyn StatusSource>,
    config_summary: serde_json::Value,
}

impl StatusTool {
    #[must_use]
    pub fn new(source: Arc<dyn StatusSource>, config_summary: serde_json::Value) -> Self {
        Self {
            source,
            config_summary,
        }
    }
}

#[async_trait]
impl Tool for StatusTool {
    fn describe(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "status".into(),
            description: "Daemon diagnostics: health snapshot, configuration summary, \
                          configured providers."
                .into(),
            schema: tool_schema(json!({}), &[]),
            visibility: ToolVisibility::Public,
        }
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolOutput, ErrorShape> {
        Ok(ToolOutput {
            value: json!({
                "health": self.source.snapshot(),
                "config": self.config_summary.clone(),
                "providers": ctx.backend.provider_names(),
            }),
            usage: None,
            continuation_id: ctx.continuation_id,
        })
    }
}

#[must_use]
pub fn factory(
    source: Arc<dyn StatusSource>,
    config_summary: serde_json::Value,
) -> impl Fn() -> Arc<dyn Tool> + Send + Sync + 'static {
    move || {
        Arc::new(StatusTool::new(Arc::clone(&source), config_summary.clone())) as Arc<dyn Tool>
    }
}
