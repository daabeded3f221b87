//! Handoff tool recognition and payload extraction

use serde_json::Value;
use std::collections::BTreeMap;
use switchboard_core::{AgentId, HandoffConfig, MemoryUpdate, SessionMemory};

/// What a tool name means to the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolKind {
    /// Transfer ownership of the session to this agent.
    Handoff(AgentId),
    Ordinary,
}

/// The closed set of declared handoff tools.
#[derive(Clone, Debug, Default)]
pub struct HandoffTable {
    tools: BTreeMap<String, AgentId>,
}

impl HandoffTable {
    pub fn from_config(config: &HandoffConfig) -> Self {
        Self {
            tools: config
                .tools
                .iter()
                .map(|t| (t.name.clone(), AgentId::new(t.target.clone())))
                .collect(),
        }
    }

    pub fn classify(&self, tool: &str) -> ToolKind {
        match self.tools.get(tool) {
            Some(target) => ToolKind::Handoff(target.clone()),
            None => ToolKind::Ordinary,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffOrigin {
    /// The bound agent called a handoff tool.
    Tool,
    /// A verified-state policy rule fired on a tool result.
    AutoRoute,
    /// The bound agent went away and the session falls back to the entry agent.
    Fallback,
}

/// One transfer of ownership. Built once, consumed once.
#[derive(Clone, Debug)]
pub struct HandoffRequest {
    pub from: AgentId,
    pub target: AgentId,
    pub tool: String,
    pub tool_call_id: Option<String>,
    pub reason: Option<String>,
    pub origin: HandoffOrigin,
    pub snapshot: SessionMemory,
}

/// Tool results sometimes carry their payload as a JSON string.
pub(crate) fn normalize_content(content: &Value) -> Value {
    match content {
        Value::String(s) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| content.clone()),
        other => other.clone(),
    }
}

pub(crate) fn truthy(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Pull the reason and structured identity fields out of a tool result payload.
pub fn extract_memory_update(content: &Value) -> MemoryUpdate {
    let content = normalize_content(content);
    let mut update = MemoryUpdate::default();
    let Value::Object(map) = &content else {
        return update;
    };

    update.user_intent = text(map.get("reason"));
    update.verified = truthy(map.get("verified"));
    update.user_name = text(map.get("user_name").or_else(|| map.get("userName")));

    if let Some(account) = text(map.get("account_number").or_else(|| map.get("accountNumber"))) {
        update.account_identifiers.insert("account_number".to_string(), account);
    }
    if let Some(sort_code) = text(map.get("sort_code").or_else(|| map.get("sortCode"))) {
        update.account_identifiers.insert("sort_code".to_string(), sort_code);
    }
    if let Some(Value::Object(ids)) = map.get("identifiers") {
        for (key, value) in ids {
            if let Some(v) = text(Some(value)) {
                update.account_identifiers.insert(key.clone(), v);
            }
        }
    }
    update
}
