//! Kimi (Moonshot) provider.

use {async_trait::async_trait, tokio_util::sync::CancellationToken};

use relay_config::ProviderEndpoint;

use crate::{
    EventStream, FileMeta, GenerateRequest, GenerateResponse, Provider, ProviderCapability,
    SupportMatrix,
    error::Result,
    key_pool::KeyPool,
    openai_compat::OpenAiCompatClient,
};

pub const PROVIDER_NAME: &str = "kimi";

/// Known models and context windows. Preference lists may name a subset;
/// anything else routes through `resolve_model` by exact alias.
const MODELS: &[(&str, u32)] = &[
    ("kimi-k2-0711-preview", 131_072),
    ("kimi-k2-turbo-preview", 131_072),
    ("kimi-latest", 131_072),
    ("moonshot-v1-8k", 8_192),
    ("moonshot-v1-32k", 32_768),
    ("moonshot-v1-128k", 131_072),
];

pub struct KimiProvider {
    client: OpenAiCompatClient,
    preferred_models: Vec<String>,
}

impl KimiProvider {
    #[must_use]
    pub fn new(endpoint: &ProviderEndpoint) -> Self {
        Self {
            client: OpenAiCompatClient::new(
                PROVIDER_NAME,
                endpoint.base_url.clone(),
                KeyPool::new(endpoint.api_keys.clone()),
            ),
            preferred_models: endpoint.preferred_models.clone(),
        }
    }

    fn websearch_tools(req: &GenerateRequest) -> Option<serde_json::Value> {
        req.websearch.then(|| {
            // Moonshot's server-side search is a builtin function tool.
            serde_json::json!([{
                "type": "builtin_function",
                "function": { "name": "$web_search" },
            }])
        })
    }

    fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.preferred_models.clone();
        for (model, _) in MODELS {
            if !aliases.iter().any(|a| a == model) {
                aliases.push((*model).to_string());
            }
        }
        aliases
    }
}

#[async_trait]
impl Provider for KimiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> ProviderCapability {
        ProviderCapability {
            name: PROVIDER_NAME.into(),
            model_aliases: self.aliases(),
            context_window: 131_072,
            supports: SupportMatrix {
                images: true,
                files: true,
                websearch: true,
                streaming: true,
                tools: true,
            },
        }
    }

    fn context_window(&self, model: &str) -> u32 {
        MODELS
            .iter()
            .find(|(m, _)| *m == model)
            .map(|(_, w)| *w)
            .unwrap_or(131_072)
    }

    async fn generate(
        &self,
        cancel: &CancellationToken,
        mut req: GenerateRequest,
    ) -> Result<GenerateResponse> {
        self.client.inject_file_context(cancel, &mut req).await?;
        let tools = Self::websearch_tools(&req);
        self.client.chat(cancel, &req, tools).await
    }

    fn stream(&self, cancel: CancellationToken, req: GenerateRequest) -> EventStream {
        let tools = Self::websearch_tools(&req);
        self.client.chat_stream(cancel, req, tools)
    }

    async fn upload_file(
        &self,
        cancel: &CancellationToken,
        bytes: Vec<u8>,
        meta: FileMeta,
    ) -> Result<String> {
        self.client.upload(cancel, bytes, meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ProviderEndpoint {
        ProviderEndpoint {
            api_keys: vec![secrecy::Secret::new("sk-kimi".to_string())],
            base_url: "https://api.moonshot.ai/v1".into(),
            preferred_models: vec!["kimi-k2-0711-preview".into()],
        }
    }

    #[test]
    fn preference_list_leads_the_alias_order() {
        let provider = KimiProvider::new(&endpoint());
        let caps = provider.capabilities();
        assert_eq!(caps.model_aliases[0], "kimi-k2-0711-preview");
        // Catalog entries follow, without duplicating the preferred model.
        assert_eq!(
            caps.model_aliases
                .iter()
                .filter(|m| *m == "kimi-k2-0711-preview")
                .count(),
            1
        );
    }

    #[test]
    fn context_window_varies_by_model() {
        let provider = KimiProvider::new(&endpoint());
        assert_eq!(provider.context_window("moonshot-v1-8k"), 8_192);
        assert_eq!(provider.context_window("kimi-k2-turbo-preview"), 131_072);
        assert_eq!(provider.context_window("unknown"), 131_072);
    }

    #[test]
    fn websearch_adds_builtin_tool() {
        let req = GenerateRequest {
            model: "kimi-latest".into(),
            messages: Vec::new(),
            temperature: None,
            max_tokens: None,
            websearch: true,
            images: Vec::new(),
            file_ids: Vec::new(),
        };
        let tools = KimiProvider::websearch_tools(&req).unwrap();
        assert_eq!(tools[0]["function"]["name"], "$web_search");
    }
}
