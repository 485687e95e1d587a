use {
    relay_providers::{ProviderRegistry, SupportMatrix},
    serde::{Deserialize, Serialize},
};

use crate::error::{Error, Result};

/// Capabilities a tool requires from the serving model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ToolNeeds {
    pub files: bool,
    pub websearch: bool,
    pub images: bool,
    pub streaming: bool,
}

impl ToolNeeds {
    fn satisfied_by(self, supports: SupportMatrix) -> bool {
        (!self.files || supports.files)
            && (!self.websearch || supports.websearch)
            && (!self.images || supports.images)
            && (!self.streaming || supports.streaming)
    }
}

/// Inputs to one routing decision.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest<'a> {
    /// Model named in the call arguments; `None` or `"auto"` triggers the
    /// preference cascade.
    pub requested_model: Option<&'a str>,
    /// Model the tool declares it works best with.
    pub tool_hint: Option<&'a str>,
    /// Model that served the previous turn of this conversation.
    pub last_used: Option<&'a str>,
    pub needs: ToolNeeds,
}

/// One routable `(provider, model)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub provider: String,
    pub model: String,
}

/// Compute the ordered candidate list for a call.
pub fn route(
    registry: &ProviderRegistry,
    preference_lists: &[(String, Vec<String>)],
    req: &RouteRequest<'_>,
) -> Result<Vec<Candidate>> {
    if registry.is_empty() {
        return Err(Error::NotConfigured);
    }

    // A concrete model short-circuits the cascade.
    if let Some(model) = req.requested_model
        && !model.is_empty()
        && model != "auto"
    {
        let (provider, canonical) = registry
            .resolve_model(model)
            .ok_or_else(|| Error::UnknownModel(model.to_string()))?;
        return Ok(vec![Candidate {
            provider: provider.name().to_string(),
            model: canonical,
        }]);
    }

    // (origin rank, preference index, context window) orders the cascade;
    // provider configuration order breaks remaining ties via stable sort.
    let mut ranked: Vec<(u8, usize, u32, Candidate)> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut push = |rank: u8, index: usize, alias: &str, ranked: &mut Vec<_>| {
        let Some((provider, model)) = registry.resolve_model(alias) else {
            return;
        };
        if !seen.insert((provider.name().to_string(), model.clone())) {
            return;
        }
        let caps = provider.capabilities();
        if !req.needs.satisfied_by(caps.supports) {
            return;
        }
        let window = provider.context_window(&model);
        ranked.push((rank, index, window, Candidate {
            provider: provider.name().to_string(),
            model,
        }));
    };

    if let Some(hint) = req.tool_hint {
        push(0, 0, hint, &mut ranked);
    }
    if let Some(last) = req.last_used {
        push(1, 0, last, &mut ranked);
    }
    for (provider_name, models) in preference_lists {
        // Skip preference lists for providers that did not come up.
        if registry.get(provider_name).is_none() {
            continue;
        }
        for (index, model) in models.iter().enumerate() {
            push(2, index, model, &mut ranked);
        }
    }

    ranked.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

    let candidates: Vec<Candidate> = ranked.into_iter().map(|(_, _, _, c)| c).collect();
    if candidates.is_empty() {
        return Err(Error::NoUsableModel);
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use {
        async_trait::async_trait,
        relay_providers::{
            EventStream, GenerateRequest, GenerateResponse, Provider, ProviderCapability,
            ProviderRegistry, SupportMatrix, TokenUsage,
        },
        tokio_util::sync::CancellationToken,
    };

    use super::*;

    struct FakeProvider {
        name: &'static str,
        models: Vec<(&'static str, u32)>,
        supports: SupportMatrix,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> ProviderCapability {
            ProviderCapability {
                name: self.name.into(),
                model_aliases: self.models.iter().map(|(m, _)| (*m).to_string()).collect(),
                context_window: 131_072,
                supports: self.supports,
            }
        }

        fn context_window(&self, model: &str) -> u32 {
            self.models
                .iter()
                .find(|(m, _)| *m == model)
                .map(|(_, w)| *w)
                .unwrap_or(131_072)
        }

        async fn generate(
            &self,
            _cancel: &CancellationToken,
            req: GenerateRequest,
        ) -> relay_providers::Result<GenerateResponse> {
            Ok(GenerateResponse {
                content: String::new(),
                usage: TokenUsage::default(),
                model: req.model,
            })
        }

        fn stream(&self, _cancel: CancellationToken, _req: GenerateRequest) -> EventStream {
            Box::pin(tokio_stream::empty())
        }
    }

    fn full_support() -> SupportMatrix {
        SupportMatrix {
            images: true,
            files: true,
            websearch: true,
            streaming: true,
            tools: true,
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(vec![
            Arc::new(FakeProvider {
                name: "kimi",
                models: vec![("kimi-a", 131_072), ("kimi-b", 32_768)],
                supports: full_support(),
            }),
            Arc::new(FakeProvider {
                name: "glm",
                models: vec![("glm-a", 131_072)],
                supports: SupportMatrix {
                    files: false,
                    ..full_support()
                },
            }),
        ])
    }

    fn prefs() -> Vec<(String, Vec<String>)> {
        vec![
            ("kimi".to_string(), vec!["kimi-a".to_string(), "kimi-b".to_string()]),
            ("glm".to_string(), vec!["glm-a".to_string()]),
        ]
    }

    #[test]
    fn concrete_model_short_circuits() {
        let candidates = route(&registry(), &prefs(), &RouteRequest {
            requested_model: Some("glm-a"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(candidates, vec![Candidate {
            provider: "glm".into(),
            model: "glm-a".into(),
        }]);
    }

    #[test]
    fn unknown_concrete_model_errors() {
        let err = route(&registry(), &prefs(), &RouteRequest {
            requested_model: Some("gpt-99"),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::UnknownModel(_)));
    }

    #[test]
    fn auto_walks_preference_lists_in_order() {
        let candidates = route(&registry(), &prefs(), &RouteRequest {
            requested_model: Some("auto"),
            ..Default::default()
        })
        .unwrap();
        let names: Vec<_> = candidates
            .iter()
            .map(|c| format!("{}/{}", c.provider, c.model))
            .collect();
        // Same preference index: kimi-a and glm-a tie on window, config
        // order breaks the tie; kimi-b follows at index 1.
        assert_eq!(names, vec!["kimi/kimi-a", "glm/glm-a", "kimi/kimi-b"]);
    }

    #[test]
    fn capability_filter_removes_unfit_providers() {
        let candidates = route(&registry(), &prefs(), &RouteRequest {
            needs: ToolNeeds {
                files: true,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        assert!(candidates.iter().all(|c| c.provider == "kimi"));
    }

    #[test]
    fn tool_hint_leads_the_cascade() {
        let candidates = route(&registry(), &prefs(), &RouteRequest {
            tool_hint: Some("kimi-b"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(candidates[0].model, "kimi-b");
    }

    #[test]
    fn last_used_ranks_between_hint_and_prefs() {
        let candidates = route(&registry(), &prefs(), &RouteRequest {
            last_used: Some("glm-a"),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(candidates[0].model, "glm-a");
    }

    #[test]
    fn routing_is_deterministic() {
        let req = RouteRequest::default();
        let a = route(&registry(), &prefs(), &req).unwrap();
        let b = route(&registry(), &prefs(), &req).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_registry_is_not_configured() {
        let empty = ProviderRegistry::new(Vec::new());
        assert!(matches!(
            route(&empty, &prefs(), &RouteRequest::default()),
            Err(Error::NotConfigured)
        ));
    }
}
