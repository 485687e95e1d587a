//! File tools: `upload_file` dedup-uploads to every capable provider,
//! `query_file` asks a routed model about an uploaded file.

use {
    async_trait::async_trait,
    base64::Engine,
    serde_json::json,
    sha2::{Digest, Sha256},
};

use {
    relay_protocol::{ErrorKind, ErrorShape, ToolDescriptor, ToolVisibility, UsageInfo},
    relay_providers::{ChatMessage, Role},
    relay_sessions::Turn,
    relay_storage::NewFile,
};

use crate::{
    BackendRequest, CommonArgs, Tool, ToolContext, ToolOutput,
    schema::{required_str, tool_schema},
};

// ── upload_file ──────────────────────────────────────────────────────────────

pub struct UploadFileTool;

#[async_trait]
impl Tool for UploadFileTool {
    fn describe(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "upload_file".into(),
            description: "Upload a file for later queries. Content is deduplicated by \
                          sha256; duplicates reuse the existing upload."
                .into(),
            schema: tool_schema(
                json!({
                    "filename": { "type": "string" },
                    "content_base64": { "type": "string" },
                    "content_type": { "type": "string" },
                }),
                &["filename", "content_base64"],
            ),
            visibility: ToolVisibility::Public,
        }
    }

    fn needs(&self) -> relay_routing::ToolNeeds {
        relay_routing::ToolNeeds {
            files: true,
            ..Default::default()
        }
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolOutput, ErrorShape> {
        let filename = required_str(&ctx.arguments, "filename")?.to_string();
        let encoded = required_str(&ctx.arguments, "content_base64")?;
        let content_type = ctx
            .arguments
            .get("content_type")
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| {
                ErrorShape::new(ErrorKind::InvalidRequest, format!("content_base64: {e}"))
            })?;

        let sha256 = format!("{:x}", Sha256::digest(&bytes));
        let size = bytes.len() as i64;

        let row = ctx
            .repo
            .dedup_file(&sha256, NewFile {
                size,
                content_type: content_type.clone(),
                origin_path: Some(filename.clone()),
            })
            .await
            .map_err(|e| {
                ErrorShape::new(ErrorKind::Internal, format!("file registration failed: {e}"))
            })?;
        // Reuse existing provider uploads when the hash was already known.
        let mut providers = json!({});
        let mut deduplicated = false;
        for provider in ctx.backend.provider_names() {
            if let Ok(Some(external)) = ctx.repo.provider_file_id(row.id, &provider).await {
                providers[provider] = json!(external);
                deduplicated = true;
            }
        }

        if !deduplicated {
            ctx.progress.info("uploading to providers");
            let outcomes = ctx
                .backend
                .upload_file(&ctx.cancel, ctx.deadline, bytes, filename, content_type)
                .await?;
            for (provider, external_id) in outcomes {
                if let Err(e) = ctx
                    .repo
                    .link_provider_file(row.id, &provider, &external_id)
                    .await
                {
                    ctx.progress
                        .warn(&format!("provider link not persisted: {e}"));
                }
                providers[provider] = json!(external_id);
            }
        }

        Ok(ToolOutput {
            value: json!({
                "file_id": row.id,
                "sha256": row.sha256,
                "size": row.size,
                "content_type": row.content_type,
                "providers": providers,
                "deduplicated": deduplicated,
            }),
            usage: None,
            continuation_id: ctx.continuation_id,
        })
    }
}

// ── query_file ───────────────────────────────────────────────────────────────

pub struct QueryFileTool;

#[async_trait]
impl Tool for QueryFileTool {
    fn describe(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "query_file".into(),
            description: "Ask a question about a previously uploaded file.".into(),
            schema: tool_schema(
                json!({
                    "file_id": { "type": "string", "format": "uuid" },
                    "prompt": { "type": "string" },
                }),
                &["file_id", "prompt"],
            ),
            visibility: ToolVisibility::Public,
        }
    }

    fn needs(&self) -> relay_routing::ToolNeeds {
        relay_routing::ToolNeeds {
            files: true,
            ..Default::default()
        }
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolOutput, ErrorShape> {
        let raw_id = required_str(&ctx.arguments, "file_id")?;
        let prompt = required_str(&ctx.arguments, "prompt")?.to_string();
        let common = CommonArgs::from_arguments(&ctx.arguments)?;

        let file_id = relay_common::ids::parse_continuation(raw_id).ok_or_else(|| {
            ErrorShape::new(ErrorKind::InvalidRequest, "file_id must be a UUID")
        })?;

        let file = ctx
            .repo
            .get_file(file_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| {
                ErrorShape::new(ErrorKind::InvalidRequest, format!("unknown file: {file_id}"))
            })?;

        let mut provider_file_ids = std::collections::HashMap::new();
        for provider in ctx.backend.provider_names() {
            if let Ok(Some(external)) = ctx.repo.provider_file_id(file_id, &provider).await {
                provider_file_ids.insert(provider, vec![external]);
            }
        }
        if provider_file_ids.is_empty() {
            return Err(ErrorShape::new(
                ErrorKind::InvalidRequest,
                "file has no provider uploads; run upload_file first",
            ));
        }

        let conversation_id = match ctx.continuation_id {
            Some(id) => id,
            None => ctx.conversations.begin().await,
        };

        let started = std::time::Instant::now();
        let response = ctx
            .backend
            .complete(&ctx.cancel, ctx.deadline, ctx.progress.as_ref(), BackendRequest {
                requested_model: common.model.clone(),
                tool_hint: None,
                last_used: None,
                needs: relay_routing::ToolNeeds {
                    files: true,
                    ..Default::default()
                },
                messages: vec![ChatMessage::new(Role::User, prompt.clone())],
                temperature: common.temperature,
                websearch: false,
                images: Vec::new(),
                stream_progress: false,
                provider_file_ids,
            })
            .await?;

        let user_turn = Turn::user(format!("[file {}] {prompt}", file.sha256));
        let user_turn_id = user_turn.id;
        ctx.conversations.append(conversation_id, user_turn).await;
        ctx.conversations
            .attach_file(conversation_id, user_turn_id, file_id)
            .await;

        let mut reply = Turn::assistant(response.content.clone());
        reply.model = Some(response.model.clone());
        reply.provider = Some(response.provider.clone());
        ctx.conversations.append(conversation_id, reply).await;

        Ok(ToolOutput {
            value: json!({
                "content": response.content,
                "file_id": file_id,
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
pub fn upload_factory() -> std::sync::Arc<dyn Tool> {
    std::sync::Arc::new(UploadFileTool)
}

#[must_use]
pub fn query_factory() -> std::sync::Arc<dyn Tool> {
    std::sync::Arc::new(QueryFileTool)
}
