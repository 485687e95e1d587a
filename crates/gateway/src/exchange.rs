//! The daemon-side [`ModelBackend`]: routing, per-provider permits, and
//! fallback across router candidates.

use std::{sync::Arc, time::Instant};

use {async_trait::async_trait, futures::StreamExt, tokio_util::sync::CancellationToken};

use {
    relay_config::FeatureFlags,
    relay_metrics::{counter, provider as provider_metrics},
    relay_protocol::{ErrorKind, ErrorShape},
    relay_providers::{
        GenerateRequest, ProviderError, ProviderRegistry, StreamEvent, TokenUsage,
    },
    relay_routing::{Candidate, RouteRequest, route},
    relay_tools::{BackendRequest, BackendResponse, ModelBackend, ProgressSink},
};

use crate::concurrency::{ConcurrencyController, permit_deadline};

pub struct Exchange {
    providers: Arc<ProviderRegistry>,
    preference_lists: Vec<(String, Vec<String>)>,
    controller: Arc<ConcurrencyController>,
    features: FeatureFlags,
}

impl Exchange {
    #[must_use]
    pub fn new(
        providers: Arc<ProviderRegistry>,
        preference_lists: Vec<(String, Vec<String>)>,
        controller: Arc<ConcurrencyController>,
        features: FeatureFlags,
    ) -> Self {
        Self {
            providers,
            preference_lists,
            controller,
            features,
        }
    }

    fn map_route_error(e: relay_routing::Error) -> ErrorShape {
        match e {
            relay_routing::Error::UnknownModel(model) => ErrorShape::new(
                ErrorKind::InvalidRequest,
                format!("unknown model: {model}"),
            ),
            relay_routing::Error::NotConfigured => {
                ErrorShape::new(ErrorKind::ProviderFatal, "no providers configured")
            },
            relay_routing::Error::NoUsableModel => ErrorShape::new(
                ErrorKind::ProviderFatal,
                "no configured model satisfies the tool's requirements",
            ),
        }
    }

    fn map_provider_error(e: &ProviderError) -> ErrorShape {
        match e {
            ProviderError::RateLimited { retry_after_ms } => {
                let mut shape =
                    ErrorShape::new(ErrorKind::ProviderRateLimited, e.to_string());
                if let Some(ms) = retry_after_ms {
                    shape = shape.with_details(serde_json::json!({ "retry_after_ms": ms }));
                }
                shape
            },
            ProviderError::Auth => ErrorShape::new(ErrorKind::ProviderAuth, e.to_string()),
            ProviderError::Cancelled => ErrorShape::new(ErrorKind::Cancelled, "call cancelled"),
            ProviderError::Retryable(_) | ProviderError::Fatal(_) => {
                ErrorShape::new(ErrorKind::ProviderFatal, e.to_string())
            },
        }
    }

    /// Execute one candidate, streaming deltas as progress when the client
    /// asked for it and the feature is on.
    async fn attempt(
        &self,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
        candidate: &Candidate,
        req: &BackendRequest,
    ) -> Result<BackendResponse, ProviderError> {
        let provider = self
            .providers
            .get(&candidate.provider)
            .ok_or_else(|| ProviderError::Fatal(format!("provider {} vanished", candidate.provider)))?;

        let supports = provider.capabilities().supports;
        let generate_req = GenerateRequest {
            model: candidate.model.clone(),
            messages: req.messages.clone(),
            temperature: req.temperature,
            max_tokens: None,
            websearch: req.websearch && self.features.websearch && supports.websearch,
            images: req.images.clone(),
            file_ids: req
                .provider_file_ids
                .get(&candidate.provider)
                .cloned()
                .unwrap_or_default(),
        };

        let use_stream = self.features.streaming && supports.streaming && req.stream_progress;
        let response = if use_stream {
            let mut stream = provider.stream(cancel.child_token(), generate_req);
            let mut content = String::new();
            let mut usage = TokenUsage::default();
            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Delta(delta) => {
                        progress.emit(
                            relay_protocol::ProgressLevel::Debug,
                            "delta",
                            Some(serde_json::json!({ "text": delta })),
                        );
                        content.push_str(&delta);
                    },
                    StreamEvent::Done(u) => usage = u,
                    StreamEvent::Error(message) => {
                        return Err(classify_stream_error(&message));
                    },
                }
            }
            BackendResponse {
                content,
                usage,
                provider: candidate.provider.clone(),
                model: candidate.model.clone(),
            }
        } else {
            let generated = provider.generate(cancel, generate_req).await?;
            BackendResponse {
                content: generated.content,
                usage: generated.usage,
                provider: candidate.provider.clone(),
                model: generated.model,
            }
        };

        counter!(provider_metrics::CALLS_TOTAL, "provider" => candidate.provider.clone(), "outcome" => "ok")
            .increment(1);
        counter!(provider_metrics::TOKENS_TOTAL, "provider" => candidate.provider.clone(), "direction" => "in")
            .increment(response.usage.tokens_in);
        counter!(provider_metrics::TOKENS_TOTAL, "provider" => candidate.provider.clone(), "direction" => "out")
            .increment(response.usage.tokens_out);
        Ok(response)
    }
}

/// Streamed errors arrive as text; recover the classification the
/// non-streaming path would have produced.
fn classify_stream_error(message: &str) -> ProviderError {
    if message.contains("cancelled") {
        ProviderError::Cancelled
    } else if message.contains("rate limited") {
        ProviderError::RateLimited {
            retry_after_ms: None,
        }
    } else if message.contains("authentication") {
        ProviderError::Auth
    } else {
        ProviderError::Retryable(message.to_string())
    }
}

#[async_trait]
impl ModelBackend for Exchange {
    fn provider_names(&self) -> Vec<String> {
        self.providers.names()
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        progress: &dyn ProgressSink,
        req: BackendRequest,
    ) -> Result<BackendResponse, ErrorShape> {
        let candidates = route(&self.providers, &self.preference_lists, &RouteRequest {
            requested_model: req.requested_model.as_deref(),
            tool_hint: req.tool_hint.as_deref(),
            last_used: req.last_used.as_deref(),
            needs: req.needs,
        })
        .map_err(Self::map_route_error)?;

        // Only providers holding this call's files can serve it.
        let candidates: Vec<Candidate> = if req.provider_file_ids.is_empty() {
            candidates
        } else {
            candidates
                .into_iter()
                .filter(|c| req.provider_file_ids.contains_key(&c.provider))
                .collect()
        };
        if candidates.is_empty() {
            return Err(ErrorShape::new(
                ErrorKind::ProviderFatal,
                "no candidate provider holds the referenced files",
            ));
        }

        let total = candidates.len();
        let mut last_error: Option<ProviderError> = None;

        for (index, candidate) in candidates.iter().enumerate() {
            let _permit = self
                .controller
                .acquire_provider(&candidate.provider, permit_deadline(deadline))
                .await?;

            match self.attempt(cancel, progress, candidate, &req).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && index + 1 < total => {
                    counter!(provider_metrics::FALLBACKS_TOTAL, "provider" => candidate.provider.clone())
                        .increment(1);
                    let next = &candidates[index + 1];
                    progress.info(&format!(
                        "{}/{} unavailable ({e}), falling back to {}/{}",
                        candidate.provider, candidate.model, next.provider, next.model
                    ));
                    last_error = Some(e);
                },
                Err(e) => {
                    counter!(provider_metrics::CALLS_TOTAL, "provider" => candidate.provider.clone(), "outcome" => "error")
                        .increment(1);
                    return Err(Self::map_provider_error(&e));
                },
            }
        }

        let e = last_error
            .unwrap_or_else(|| ProviderError::Fatal("candidate walk exhausted".into()));
        Err(Self::map_provider_error(&e))
    }

    async fn upload_file(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        bytes: Vec<u8>,
        filename: String,
        content_type: String,
    ) -> Result<Vec<(String, String)>, ErrorShape> {
        let mut outcomes = Vec::new();
        let mut last_error: Option<ProviderError> = None;

        for name in self.providers.names() {
            let Some(provider) = self.providers.get(&name) else {
                continue;
            };
            if !provider.capabilities().supports.files {
                continue;
            }
            let _permit = self
                .controller
                .acquire_provider(&name, permit_deadline(deadline))
                .await?;
            match provider
                .upload_file(cancel, bytes.clone(), relay_providers::FileMeta {
                    filename: filename.clone(),
                    content_type: content_type.clone(),
                })
                .await
            {
                Ok(external_id) => outcomes.push((name, external_id)),
                Err(ProviderError::Cancelled) => {
                    return Err(ErrorShape::new(ErrorKind::Cancelled, "call cancelled"));
                },
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "file upload failed");
                    last_error = Some(e);
                },
            }
        }

        if outcomes.is_empty() {
            let e = last_error
                .unwrap_or_else(|| ProviderError::Fatal("no provider supports files".into()));
            return Err(Self::map_provider_error(&e));
        }
        Ok(outcomes)
    }
}
