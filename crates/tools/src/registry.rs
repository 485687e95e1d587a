//! Name → factory map of tools.

use std::{collections::HashMap, sync::Arc};

use relay_protocol::{ToolDescriptor, ToolVisibility};

use crate::Tool;

type Factory = Box<dyn Fn() -> Arc<dyn Tool> + Send + Sync>;

/// Registry of tool factories. Each call gets its own tool instance.
pub struct ToolRegistry {
    factories: HashMap<String, Factory>,
    /// Entries of the form `tool` or `client/tool`.
    allowlist: Vec<String>,
    denylist: Vec<String>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new(allowlist: Vec<String>, denylist: Vec<String>) -> Self {
        Self {
            factories: HashMap::new(),
            allowlist,
            denylist,
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Tool> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Instantiate a tool for one call, regardless of visibility. Visibility
    /// is a listing concern; dispatch checks it separately.
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.factories.get(name).map(|f| f())
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    fn list_matches(entry: &str, client: &str, tool: &str) -> bool {
        match entry.split_once('/') {
            Some((entry_client, entry_tool)) => entry_client == client && entry_tool == tool,
            None => entry == tool,
        }
    }

    /// Whether a tool is callable and listable for a client.
    #[must_use]
    pub fn permitted(&self, client: &str, tool: &str) -> bool {
        if self
            .denylist
            .iter()
            .any(|e| Self::list_matches(e, client, tool))
        {
            return false;
        }
        if self.allowlist.is_empty() {
            return true;
        }
        self.allowlist
            .iter()
            .any(|e| Self::list_matches(e, client, tool))
    }

    /// The catalog a client sees under `list_tools`: public, permitted,
    /// sorted by name.
    #[must_use]
    pub fn visible_for(&self, client: &str) -> Vec<ToolDescriptor> {
        let mut items: Vec<ToolDescriptor> = self
            .factories
            .iter()
            .filter(|(name, _)| self.permitted(client, name))
            .map(|(_, factory)| factory().describe())
            .filter(|d| d.visibility == ToolVisibility::Public)
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        items
    }
}

#[cfg(test)]
mod tests {
    use {
        async_trait::async_trait,
        relay_protocol::ErrorShape,
        serde_json::json,
    };

    use {
        super::*,
        crate::{ToolContext, ToolOutput},
    };

    struct StubTool {
        name: &'static str,
        visibility: ToolVisibility,
    }

    #[async_trait]
    impl Tool for StubTool {
        fn describe(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: self.name.into(),
                description: "stub".into(),
                schema: json!({}),
                visibility: self.visibility,
            }
        }

        async fn execute(&self, _ctx: ToolContext) -> Result<ToolOutput, ErrorShape> {
            Ok(ToolOutput::value(json!({})))
        }
    }

    fn registry(allow: &[&str], deny: &[&str]) -> ToolRegistry {
        let mut reg = ToolRegistry::new(
            allow.iter().map(|s| s.to_string()).collect(),
            deny.iter().map(|s| s.to_string()).collect(),
        );
        reg.register("chat", || {
            Arc::new(StubTool {
                name: "chat",
                visibility: ToolVisibility::Public,
            })
        });
        reg.register("internal_probe", || {
            Arc::new(StubTool {
                name: "internal_probe",
                visibility: ToolVisibility::Hidden,
            })
        });
        reg.register("analyze", || {
            Arc::new(StubTool {
                name: "analyze",
                visibility: ToolVisibility::Public,
            })
        });
        reg
    }

    #[test]
    fn hidden_tools_are_callable_but_not_listed() {
        let reg = registry(&[], &[]);
        assert!(reg.create("internal_probe").is_some());
        let visible = reg.visible_for("ide");
        assert!(visible.iter().all(|d| d.name != "internal_probe"));
    }

    #[test]
    fn denylist_hides_and_blocks() {
        let reg = registry(&[], &["analyze"]);
        assert!(!reg.permitted("ide", "analyze"));
        assert!(reg.visible_for("ide").iter().all(|d| d.name != "analyze"));
    }

    #[test]
    fn allowlist_restricts_to_named_tools() {
        let reg = registry(&["chat"], &[]);
        assert!(reg.permitted("ide", "chat"));
        assert!(!reg.permitted("ide", "analyze"));
    }

    #[test]
    fn client_scoped_entries_apply_to_one_client() {
        let reg = registry(&[], &["ci/chat"]);
        assert!(!reg.permitted("ci", "chat"));
        assert!(reg.permitted("ide", "chat"));
    }

    #[test]
    fn catalog_is_sorted() {
        let reg = registry(&[], &[]);
        let names: Vec<_> = reg.visible_for("x").iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["analyze", "chat"]);
    }
}
