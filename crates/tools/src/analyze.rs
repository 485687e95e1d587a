//! The `analyze` workflow tool.
//!
//! A multi-step investigation: intermediate steps record findings into the
//! conversation and pause without calling a provider; the terminal step
//! assembles everything recorded and asks the routed model for the final
//! analysis. The continuation id is the thread through all steps.

use std::time::Duration;

use {async_trait::async_trait, serde_json::json};

use {
    relay_protocol::{ErrorKind, ErrorShape, ToolDescriptor, ToolVisibility, UsageInfo},
    relay_providers::{ChatMessage, Role},
    relay_sessions::Turn,
};

use crate::{
    BackendRequest, CommonArgs, Tool, ToolContext, ToolOutput,
    chat::{HISTORY_TOKEN_BUDGET, history_messages, resolve_file_refs},
    schema::{optional_u64, required_str, tool_schema},
};

/// Terminal steps synthesize with the provider and get a longer budget.
const TERMINAL_STEP_TIMEOUT: Duration = Duration::from_secs(240);

const SYSTEM_PROMPT: &str = "You are a senior engineer reviewing an investigation. \
    The conversation contains numbered investigation steps with findings. \
    Produce a structured analysis: what was established, remaining risks, \
    and concrete next actions.";

pub struct AnalyzeTool;

fn step_fields(
    arguments: &serde_json::Map<String, serde_json::Value>,
) -> Result<(u64, u64), ErrorShape> {
    let step_number = optional_u64(arguments, "step_number").unwrap_or(1);
    let total_steps = optional_u64(arguments, "total_steps").unwrap_or(1);
    if step_number == 0 || total_steps == 0 || step_number > total_steps {
        return Err(ErrorShape::new(
            ErrorKind::InvalidRequest,
            format!("invalid step bounds: {step_number}/{total_steps}"),
        ));
    }
    Ok((step_number, total_steps))
}

#[async_trait]
impl Tool for AnalyzeTool {
    fn describe(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "analyze".into(),
            description: "Step-wise analysis workflow. Record investigation steps, then \
                          receive an expert synthesis on the final step."
                .into(),
            schema: tool_schema(
                json!({
                    "step": { "type": "string", "description": "What this step investigated" },
                    "step_number": { "type": "integer", "minimum": 1 },
                    "total_steps": { "type": "integer", "minimum": 1 },
                    "findings": { "type": "string", "description": "What this step found" },
                }),
                &["step", "step_number", "total_steps"],
            ),
            visibility: ToolVisibility::Public,
        }
    }

    fn dedup_scope(&self) -> crate::DedupScope {
        // Steps of different sessions must never collapse into one flight.
        crate::DedupScope::PerSession
    }

    fn timeout_hint(
        &self,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<Duration> {
        let (step_number, total_steps) = step_fields(arguments).ok()?;
        (step_number == total_steps).then_some(TERMINAL_STEP_TIMEOUT)
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolOutput, ErrorShape> {
        let step = required_str(&ctx.arguments, "step")?.to_string();
        let (step_number, total_steps) = step_fields(&ctx.arguments)?;
        let findings = ctx
            .arguments
            .get("findings")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let common = CommonArgs::from_arguments(&ctx.arguments)?;

        let conversation_id = match ctx.continuation_id {
            Some(id) => id,
            None => ctx.conversations.begin().await,
        };

        // Record the step regardless of position.
        let record = if findings.is_empty() {
            format!("[step {step_number}/{total_steps}] {step}")
        } else {
            format!("[step {step_number}/{total_steps}] {step}\nfindings: {findings}")
        };
        ctx.conversations
            .append(conversation_id, Turn::user(record))
            .await;

        ctx.progress.info(&format!(
            "analyze: recorded step {step_number}/{total_steps}"
        ));

        if step_number < total_steps {
            return Ok(ToolOutput {
                value: json!({
                    "status": "pause_for_investigation",
                    "step_number": step_number,
                    "total_steps": total_steps,
                    "next_step_required": true,
                }),
                usage: None,
                continuation_id: Some(conversation_id),
            });
        }

        // Terminal step: synthesize with the routed model.
        let history = ctx
            .conversations
            .load(conversation_id, HISTORY_TOKEN_BUDGET)
            .await;
        let mut messages = vec![ChatMessage::new(Role::System, SYSTEM_PROMPT)];
        messages.extend(history_messages(&history));
        messages.push(ChatMessage::new(
            Role::User,
            "All steps are recorded above. Produce the final analysis.",
        ));

        ctx.progress.info("analyze: requesting expert synthesis");
        let provider_file_ids = resolve_file_refs(&ctx, &common.files).await;
        let started = std::time::Instant::now();
        let response = ctx
            .backend
            .complete(&ctx.cancel, ctx.deadline, ctx.progress.as_ref(), BackendRequest {
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
                stream_progress: false,
                provider_file_ids,
            })
            .await?;

        let mut reply = Turn::assistant(response.content.clone());
        reply.model = Some(response.model.clone());
        reply.provider = Some(response.provider.clone());
        reply.tokens_in = response.usage.tokens_in;
        reply.tokens_out = response.usage.tokens_out;
        ctx.conversations.append(conversation_id, reply).await;

        Ok(ToolOutput {
            value: json!({
                "status": "complete",
                "step_number": step_number,
                "total_steps": total_steps,
                "analysis": response.content,
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
    std::sync::Arc::new(AnalyzeTool)
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;

    fn args(step: u64, total: u64) -> Map<String, serde_json::Value> {
        let mut args = Map::new();
        args.insert("step".into(), json!("look around"));
        args.insert("step_number".into(), json!(step));
        args.insert("total_steps".into(), json!(total));
        args
    }

    #[test]
    fn intermediate_step_has_no_timeout_extension() {
        assert_eq!(AnalyzeTool.timeout_hint(&args(1, 3)), None);
    }

    #[test]
    fn terminal_step_extends_timeout() {
        assert_eq!(
            AnalyzeTool.timeout_hint(&args(3, 3)),
            Some(TERMINAL_STEP_TIMEOUT)
        );
    }

    #[test]
    fn step_bounds_are_validated() {
        assert!(step_fields(&args(0, 3)).is_err());
        assert!(step_fields(&args(4, 3)).is_err());
        assert!(step_fields(&args(2, 3)).is_ok());
    }
}
