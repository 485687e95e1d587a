//! GLM (ZhipuAI) provider.

use {async_trait::async_trait, tokio_util::sync::CancellationToken};

use relay_config::ProviderEndpoint;

use crate::{
    EventStream, FileMeta, GenerateRequest, GenerateResponse, Provider, ProviderCapability,
    SupportMatrix,
    error::Result,
    key_pool::KeyPool,
    openai_compat::OpenAiCompatClient,
};

pub const PROVIDER_NAME: &str = "glm";

const MODELS: &[(&str, u32)] = &[
    ("glm-4.5", 131_072),
    ("glm-4.5-air", 131_072),
    ("glm-4.5-flash", 131_072),
    ("glm-4-plus", 131_072),
    ("glm-4-air", 131_072),
    ("glm-4-flash", 131_072),
    ("glm-4v-plus", 8_192),
];

pub struct GlmProvider {
    client: OpenAiCompatClient,
    preferred_models: Vec<String>,
}

impl GlmProvider {
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
            serde_json::json!([{
                "type": "web_search",
                "web_search": { "enable": true },
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
impl Provider for GlmProvider {
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

    #[test]
    fn websearch_tool_block_is_glm_dialect() {
        let req = GenerateRequest {
            model: "glm-4.5".into(),
            messages: Vec::new(),
            temperature: None,
            max_tokens: None,
            websearch: true,
            images: Vec::new(),
            file_ids: Vec::new(),
        };
        let tools = GlmProvider::websearch_tools(&req).unwrap();
        assert_eq!(tools[0]["type"], "web_search");
        assert_eq!(tools[0]["web_search"]["enable"], true);
    }

    #[test]
    fn no_websearch_means_no_tools() {
        let req = GenerateRequest {
            model: "glm-4.5".into(),
            messages: Vec::new(),
            temperature: None,
            max_tokens: None,
            websearch: false,
            images: Vec::new(),
            file_ids: Vec::new(),
        };
        assert!(GlmProvider::websearch_tools(&req).is_none());
    }
}
