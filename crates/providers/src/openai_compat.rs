//! Shared client for OpenAI-compatible chat-completion dialects.
//!
//! Both in-scope providers speak this shape: `POST {base}/chat/completions`
//! with bearer auth, SSE for streaming, and `POST {base}/files` (multipart)
//! for uploads. Typed request structs keep required fields present at
//! compile time instead of hand-built JSON.

use {
    async_stream::stream,
    futures::StreamExt,
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
    tracing::{debug, trace},
};

use crate::{
    ChatMessage, EventStream, FileMeta, GenerateRequest, GenerateResponse, StreamEvent, TokenUsage,
    error::{ProviderError, Result, retry_after_ms_from_headers},
    key_pool::KeyPool,
};

// ── Wire shapes ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    /// Provider-specific tool blocks (e.g. builtin web search).
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<serde_json::Value>,
}

fn role_str(role: crate::Role) -> &'static str {
    match role {
        crate::Role::System => "system",
        crate::Role::User => "user",
        crate::Role::Assistant => "assistant",
    }
}

/// Encode messages for the wire. Images become multimodal content parts on
/// the final user message; plain text stays a bare string.
fn wire_messages(messages: &[ChatMessage], images: &[String]) -> serde_json::Value {
    let image_target = if images.is_empty() {
        None
    } else {
        messages
            .iter()
            .rposition(|m| m.role == crate::Role::User)
    };

    let mut wire: Vec<serde_json::Value> = messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let content = if image_target == Some(index) {
                multimodal_content(&message.content, images)
            } else {
                serde_json::Value::String(message.content.clone())
            };
            serde_json::json!({ "role": role_str(message.role), "content": content })
        })
        .collect();

    // Images with no user message to attach to still reach the provider.
    if !images.is_empty() && image_target.is_none() {
        wire.push(serde_json::json!({
            "role": "user",
            "content": multimodal_content("", images),
        }));
    }

    serde_json::Value::Array(wire)
}

fn multimodal_content(text: &str, images: &[String]) -> serde_json::Value {
    let mut parts = Vec::with_capacity(images.len() + 1);
    if !text.is_empty() {
        parts.push(serde_json::json!({ "type": "text", "text": text }));
    }
    for url in images {
        parts.push(serde_json::json!({
            "type": "image_url",
            "image_url": { "url": url },
        }));
    }
    serde_json::Value::Array(parts)
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(w: WireUsage) -> Self {
        Self {
            tokens_in: w.prompt_tokens,
            tokens_out: w.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    id: String,
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct OpenAiCompatClient {
    provider: &'static str,
    base_url: String,
    keys: KeyPool,
}

impl OpenAiCompatClient {
    #[must_use]
    pub fn new(provider: &'static str, base_url: impl Into<String>, keys: KeyPool) -> Self {
        Self {
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            keys,
        }
    }

    fn bearer(&self) -> Result<(usize, String)> {
        use secrecy::ExposeSecret;
        let (idx, key) = self
            .keys
            .next()
            .ok_or_else(|| ProviderError::Fatal(format!("{}: no API key configured", self.provider)))?;
        Ok((idx, key.expose_secret().clone()))
    }

    /// Non-streaming completion.
    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        req: &GenerateRequest,
        tools: Option<serde_json::Value>,
    ) -> Result<GenerateResponse> {
        let (key_idx, bearer) = self.bearer()?;
        let body = ChatCompletionRequest {
            model: &req.model,
            messages: wire_messages(&req.messages, &req.images),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream: false,
            tools,
        };

        let send = crate::shared_http_client()
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&bearer)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r.map_err(ProviderError::from)?,
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_ms_from_headers(response.headers());
            let body = response.text().await.unwrap_or_default();
            let err = ProviderError::from_status(status, retry_after, &body);
            if matches!(err, ProviderError::Auth) {
                self.keys.demote(key_idx);
            }
            return Err(err);
        }

        let parsed: ChatCompletionResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            r = response.json() => r.map_err(ProviderError::from)?,
        };

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        debug!(provider = self.provider, model = %req.model, "completion ok");

        Ok(GenerateResponse {
            content,
            usage: parsed.usage.map(TokenUsage::from).unwrap_or_default(),
            model: parsed.model.unwrap_or_else(|| req.model.clone()),
        })
    }

    /// Streaming completion over SSE. Yields deltas, then exactly one
    /// terminal `Done` or `Error`.
    pub fn chat_stream(
        &self,
        cancel: CancellationToken,
        req: GenerateRequest,
        tools: Option<serde_json::Value>,
    ) -> EventStream {
        let url = format!("{}/chat/completions", self.base_url);
        let provider = self.provider;
        let bearer = self.bearer();

        Box::pin(stream! {
            let (_key_idx, bearer) = match bearer {
                Ok(b) => b,
                Err(e) => {
                    yield StreamEvent::Error(e.to_string());
                    return;
                },
            };

            let body = serde_json::json!({
                "model": req.model,
                "messages": wire_messages(&req.messages, &req.images),
                "temperature": req.temperature,
                "max_tokens": req.max_tokens,
                "stream": true,
                "tools": tools,
            });

            let send = crate::shared_http_client()
                .post(&url)
                .bearer_auth(&bearer)
                .json(&body)
                .send();

            let sent = tokio::select! {
                _ = cancel.cancelled() => None,
                r = send => Some(r),
            };
            let response = match sent {
                None => {
                    yield StreamEvent::Error("cancelled".into());
                    return;
                },
                Some(Err(e)) => {
                    yield StreamEvent::Error(e.to_string());
                    return;
                },
                Some(Ok(r)) => r,
            };

            if !response.status().is_success() {
                let status = response.status();
                let retry_after = retry_after_ms_from_headers(response.headers());
                let text = response.text().await.unwrap_or_default();
                yield StreamEvent::Error(
                    ProviderError::from_status(status, retry_after, &text).to_string(),
                );
                return;
            }

            let mut usage = TokenUsage::default();
            let mut buffer = String::new();
            let mut bytes = response.bytes_stream();

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    c = bytes.next() => Some(c),
                };
                let Some(chunk) = next else {
                    yield StreamEvent::Error("cancelled".into());
                    return;
                };
                let Some(chunk) = chunk else { break };
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield StreamEvent::Error(e.to_string());
                        return;
                    },
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        yield StreamEvent::Done(usage);
                        return;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(parsed) => {
                            if let Some(u) = parsed.usage {
                                usage = u.into();
                            }
                            for choice in parsed.choices {
                                if let Some(delta) = choice.delta.content
                                    && !delta.is_empty()
                                {
                                    yield StreamEvent::Delta(delta);
                                }
                            }
                        },
                        Err(e) => trace!(provider, error = %e, "skipping malformed SSE chunk"),
                    }
                }
            }

            yield StreamEvent::Done(usage);
        })
    }

    /// Fetch extracted text for an uploaded file (`GET {base}/files/{id}/content`).
    pub async fn file_content(&self, cancel: &CancellationToken, file_id: &str) -> Result<String> {
        let (_key_idx, bearer) = self.bearer()?;
        let send = crate::shared_http_client()
            .get(format!("{}/files/{}/content", self.base_url, file_id))
            .bearer_auth(&bearer)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r.map_err(ProviderError::from)?,
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_ms_from_headers(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, retry_after, &body));
        }
        response.text().await.map_err(ProviderError::from)
    }

    /// Resolve uploaded files into system-message context, the flow both
    /// dialects document for `file-extract` uploads.
    pub async fn inject_file_context(
        &self,
        cancel: &CancellationToken,
        req: &mut GenerateRequest,
    ) -> Result<()> {
        if req.file_ids.is_empty() {
            return Ok(());
        }
        let mut context = Vec::with_capacity(req.file_ids.len());
        for file_id in &req.file_ids {
            context.push(ChatMessage::new(
                crate::Role::System,
                self.file_content(cancel, file_id).await?,
            ));
        }
        context.append(&mut req.messages);
        req.messages = context;
        Ok(())
    }

    /// Multipart file upload to `{base}/files` (`purpose=file-extract`,
    /// the dialect both providers accept).
    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        bytes: Vec<u8>,
        meta: FileMeta,
    ) -> Result<String> {
        let (key_idx, bearer) = self.bearer()?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(meta.filename)
            .mime_str(&meta.content_type)
            .map_err(|e| ProviderError::Fatal(format!("bad content type: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "file-extract")
            .part("file", part);

        let send = crate::shared_http_client()
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&bearer)
            .multipart(form)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            r = send => r.map_err(ProviderError::from)?,
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_ms_from_headers(response.headers());
            let body = response.text().await.unwrap_or_default();
            let err = ProviderError::from_status(status, retry_after, &body);
            if matches!(err, ProviderError::Auth) {
                self.keys.demote(key_idx);
            }
            return Err(err);
        }

        let parsed: FileUploadResponse = response.json().await.map_err(ProviderError::from)?;
        Ok(parsed.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;

    fn request(model: &str) -> GenerateRequest {
        GenerateRequest {
            model: model.into(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            temperature: None,
            max_tokens: None,
            websearch: false,
            images: Vec::new(),
            file_ids: Vec::new(),
        }
    }

    fn client(base_url: &str) -> OpenAiCompatClient {
        OpenAiCompatClient::new(
            "test",
            base_url,
            KeyPool::new(vec![secrecy::Secret::new("sk-test".to_string())]),
        )
    }

    #[test]
    fn wire_messages_without_images_stay_plain_strings() {
        let messages = vec![
            ChatMessage::new(Role::System, "be brief"),
            ChatMessage::new(Role::User, "hi"),
        ];
        let wire = wire_messages(&messages, &[]);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[0]["content"], "be brief");
        assert_eq!(wire[1]["content"], "hi");
    }

    #[test]
    fn wire_messages_attach_images_to_the_last_user_message() {
        let messages = vec![
            ChatMessage::new(Role::User, "earlier question"),
            ChatMessage::new(Role::Assistant, "earlier answer"),
            ChatMessage::new(Role::User, "what is in this picture?"),
        ];
        let images = vec!["https://example.test/cat.png".to_string()];
        let wire = wire_messages(&messages, &images);

        // Earlier messages are untouched.
        assert_eq!(wire[0]["content"], "earlier question");
        assert_eq!(wire[1]["content"], "earlier answer");

        let parts = wire[2]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[0]["text"], "what is in this picture?");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "https://example.test/cat.png");
    }

    #[test]
    fn wire_messages_with_images_but_no_user_message_append_one() {
        let messages = vec![ChatMessage::new(Role::System, "be brief")];
        let images = vec!["data:image/png;base64,AAAA".to_string()];
        let wire = wire_messages(&messages, &images);
        let appended = wire.as_array().unwrap().last().unwrap();
        assert_eq!(appended["role"], "user");
        assert_eq!(appended["content"][0]["type"], "image_url");
    }

    #[tokio::test]
    async fn chat_sends_image_parts_on_the_wire() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "hi" },
                        { "type": "image_url", "image_url": { "url": "https://example.test/a.png" } },
                    ],
                }],
            })))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"a cat"}}]}"#)
            .create_async()
            .await;

        let mut req = request("kimi-latest");
        req.images = vec!["https://example.test/a.png".to_string()];
        let cancel = CancellationToken::new();
        let resp = client(&server.url()).chat(&cancel, &req, None).await.unwrap();
        mock.assert_async().await;
        assert_eq!(resp.content, "a cat");
    }

    #[tokio::test]
    async fn chat_parses_content_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"hello there"}}],
                    "usage":{"prompt_tokens":12,"completion_tokens":5},"model":"kimi-k2"}"#,
            )
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        let resp = client(&server.url())
            .chat(&cancel, &request("kimi-k2"), None)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(resp.content, "hello there");
        assert_eq!(resp.usage.tokens_in, 12);
        assert_eq!(resp.usage.tokens_out, 5);
        assert_eq!(resp.model, "kimi-k2");
    }

    #[tokio::test]
    async fn chat_maps_429_to_rate_limited_with_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_header("retry-after", "3")
            .with_body("slow down")
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        let err = client(&server.url())
            .chat(&cancel, &request("m"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::RateLimited {
                retry_after_ms: Some(3_000)
            }
        ));
    }

    #[tokio::test]
    async fn chat_maps_401_to_auth() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body("bad key")
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        let err = client(&server.url())
            .chat(&cancel, &request("m"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth));
    }

    #[tokio::test]
    async fn cancelled_call_returns_cancelled() {
        let server = mockito::Server::new_async().await;
        // No mock: the request would hang or 501; cancellation wins first.
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client(&server.url())
            .chat(&cancel, &request("m"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[tokio::test]
    async fn stream_yields_deltas_then_done() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}],",
                "\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}\n\n",
                "data: [DONE]\n\n",
            ))
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        let mut stream = client(&server.url()).chat_stream(cancel, request("m"), None);
        let mut text = String::new();
        let mut done_usage = None;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Delta(d) => text.push_str(&d),
                StreamEvent::Done(u) => done_usage = Some(u),
                StreamEvent::Error(e) => panic!("stream error: {e}"),
            }
        }
        assert_eq!(text, "hello");
        assert_eq!(done_usage.unwrap().tokens_out, 2);
    }

    #[tokio::test]
    async fn upload_returns_external_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/files")
            .with_status(200)
            .with_body(r#"{"id":"file-abc123","bytes":5}"#)
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        let id = client(&server.url())
            .upload(&cancel, b"hello".to_vec(), FileMeta {
                filename: "a.txt".into(),
                content_type: "text/plain".into(),
            })
            .await
            .unwrap();
        assert_eq!(id, "file-abc123");
    }
}
