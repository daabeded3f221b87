//! Verified-state auto-route: router-side follow-on handoffs declared in config

use crate::handoff::{normalize_content, truthy};
use serde_json::Value;
use switchboard_core::{AgentId, PolicyConfig};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoRoute {
    pub from: AgentId,
    pub tool: String,
    pub outcome_field: String,
    pub to: AgentId,
}

impl AutoRoute {
    /// Name the duplicate-call guard counts this route under.
    pub fn guard_key(&self) -> String {
        format!("auto_route:{}", self.to)
    }
}

#[derive(Clone, Debug, Default)]
pub struct AutoRoutePolicy {
    routes: Vec<AutoRoute>,
}

impl AutoRoutePolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            routes: config
                .auto_routes
                .iter()
                .map(|r| AutoRoute {
                    from: AgentId::new(r.from.clone()),
                    tool: r.tool.clone(),
                    outcome_field: r.outcome_field.clone(),
                    to: AgentId::new(r.to.clone()),
                })
                .collect(),
        }
    }

    /// First rule for `(from, tool)` whose outcome field is true in `content`.
    pub fn matches(&self, from: &AgentId, tool: &str, content: &Value) -> Option<&AutoRoute> {
        let mut candidates = self
            .routes
            .iter()
            .filter(|r| &r.from == from && r.tool == tool)
            .peekable();
        candidates.peek()?;
        let content = normalize_content(content);
        candidates.find(|r| truthy(content.get(&r.outcome_field)) == Some(true))
    }

    pub fn routes(&self) -> &[AutoRoute] {
        &self.routes
    }
}
