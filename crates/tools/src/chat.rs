//! The `chat` tool: one prompt, one routed completion, history threaded
//! through the continuation id.

use std::collections::HashMap;

use {async_trait::async_trait, serde_json::json};

use {
    relay_protocol::{ErrorShape, ToolDescriptor, ToolVisibility, UsageInfo},
    relay_providers::{ChatMessage, Role},
    relay_sessions::{History, Turn},
};

use crate::{
    BackendRequest, CommonArgs, Tool, ToolContext, ToolOutput,
    schema::{required_str, tool_schema},
};

/// Token budget for reconstructed history.
pub(crate) const HISTORY_TOKEN_BUDGET: usize = 48_000;

pub(crate) fn history_messages(history: &History) -> Vec<ChatMessage> {
    history
        .turns
        .iter()
        .map(|turn| {
            let role = match turn.role.as_str() {
                "assistant" => Role::Assistant,
                "system" => Role::System,
                _ => Role::User,
            };
            ChatMessage::new(role, turn.content.clone())
        })
        .collect()
}

/// Resolve uploaded-file references (UUIDs from `upload_file`) into
/// provider-specific external ids.
pub(crate) async fn resolve_file_refs(
    ctx: &ToolContext,
    files: &[String],
) -> HashMap<String, Vec<String>> {
    let mut by_provider: HashMap<String, Vec<String>> = HashMap::new();
    let providers = ctx.backend.provider_names();
    for raw in files {
        let Some(file_id) = relay_common::ids::parse_continuation(raw) else {
            ctx.progress
                .warn(&format!("ignoring unrecognized file reference: {raw}"));
            continue;
        };
        for provider in &providers {
            if let Ok(Some(external)) = ctx.repo.provider_file_id(file_id, provider).await {
                by_provider.entry(provider.clone()).or_default().push(external);
            }
        }
    }
    by_provider
}

pub struct ChatTool;

#[async_trait]
impl Tool for ChatTool {
    fn describe(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "chat".into(),
            description: "General conversation with a routed model. Carries prior turns \
                          when a continuation_id is supplied."
                .into(),
            schema: tool_schema(
                json!({ "prompt": { "type": "string", "description": "The user message" } }),
                &["prompt"],
            ),
            visibility: ToolVisibility::Public,
        }
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolOutput, ErrorShape> {
        let prompt = required_str(&ctx.arguments, "prompt")?.to_string();
        let common = CommonArgs::from_arguments(&ctx.arguments)?;

        let conversation_id = match ctx.continuation_id {
            Some(id) => id,
            None => ctx.conversations.begin().await,
        };

        let history = ctx
            .conversations
            .load(conversation_id, HISTORY_TOKEN_BUDGET)
            .await;
        if history.truncated {
            ctx.progress.debug("history truncated to fit token budget");
        }

        let mut messages = history_messages(&history);
        messages.push(ChatMessage::new(Role::User, prompt.clone()));

        let provider_file_ids = resolve_file_refs(&ctx, &common.files).await;
        let request = BackendRequest {
            requested_model: common.model.clone(),
            tool_hint: None,
            last_used: ctx.conversations.last_used_model(conversation_id),
            needs: relay_routing::ToolNeeds {
                files: !provider_file_ids.is_empty(),
                websearch: common.use_websearch,
                images: !common.images.is_empty(),
                ..Default::default()
            },
            messages,
            temperature: common.temperature,
            websearch: common.use_websearch,
            images: common.images.clone(),
            stream_progress: common.stream,
            provider_file_ids,
        };

        let started = std::time::Instant::now();
        let response = ctx
            .backend
            .complete(&ctx.cancel, ctx.deadline, ctx.progress.as_ref(), request)
            .await?;

        let user_turn = Turn::user(prompt);
        let user_turn_id = user_turn.id;
        ctx.conversations.append(conversation_id, user_turn).await;

        let mut reply = Turn::assistant(response.content.clone());
        reply.model = Some(response.model.clone());
        reply.provider = Some(response.provider.clone());
        reply.tokens_in = response.usage.tokens_in;
        reply.tokens_out = response.usage.tokens_out;
        ctx.conversations.append(conversation_id, reply).await;

        for raw in &common.files {
            if let Some(file_id) = relay_common::ids::parse_continuation(raw) {
                ctx.conversations
                    .attach_file(conversation_id, user_turn_id, file_id)
                    .await;
            }
        }

        Ok(ToolOutput {
            value: json!({
                "content": response.content,
                "model": response.model.clone(),
                "provider": response.provider.clone(),
            }),
            usage: Some(UsageInfo {
                tokens_in: response.usage.tokens_in,
                tokens_out: response.usage.tokens_out,
                duration_ms: started.elapsed().as_millis() as u64,
                provider: response.provider,
                model: response.model,
            }),
            continuation_id: Some(conversation_id),
        })
    }
}

#[must_use]
pub fn factory() -> std::sync::Arc<dyn Tool> {
    std::sync::Arc::new(ChatTool)
}
