//! Core types for Switchboard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Session identifier - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    /// Fresh random session id for clients that did not bring one.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<SessionKey> for String {
    fn from(k: SessionKey) -> Self {
        k.0.to_string()
    }
}

/// Agent identifier, e.g. `triage`, `idv`, `banking`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct AgentId(Arc<str>);

impl AgentId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0.to_string()
    }
}

/// Liveness of a registered agent process.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl AgentStatus {
    /// Whether lookups may hand this agent out to the router.
    pub fn is_routable(&self) -> bool {
        !matches!(self, AgentStatus::Unhealthy)
    }
}

/// A live agent process as known to the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    /// `host:port` of the agent's session endpoint.
    pub address: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(
        id: impl Into<AgentId>,
        address: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            address: address.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Starting,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }
}

/// Facts accumulated over a session that must survive agent-to-agent transfer.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionMemory {
    pub session_id: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default)]
    pub account_identifiers: BTreeMap<String, String>,
    /// The original request of this journey. Write-once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_agent_id: Option<AgentId>,
    /// Incremented on every merge.
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionMemory {
    pub fn empty(session: &SessionKey) -> Self {
        Self {
            session_id: session.as_str().to_string(),
            ..Default::default()
        }
    }

    pub fn has_intent(&self) -> bool {
        self.user_intent.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Field-wise merge. `user_intent` only lands if no intent is held yet
    /// (after an explicit `clear_intent`); every other field is last-write-wins.
    pub fn apply(&mut self, update: MemoryUpdate, now: DateTime<Utc>) {
        if update.clear_intent {
            self.user_intent = None;
        }
        if let Some(intent) = update.user_intent.filter(|s| !s.trim().is_empty()) {
            if !self.has_intent() {
                self.user_intent = Some(intent);
            }
        }
        if let Some(verified) = update.verified {
            self.verified = verified;
        }
        if let Some(name) = update.user_name {
            self.user_name = Some(name);
        }
        for (k, v) in update.account_identifiers {
            self.account_identifiers.insert(k, v);
        }
        if let Some(agent) = update.last_active_agent_id {
            self.last_active_agent_id = Some(agent);
        }
        self.version += 1;
        self.updated_at = Some(now);
    }
}

/// Partial update for [`SessionMemory`]. Absent fields are left untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryUpdate {
    pub verified: Option<bool>,
    pub user_name: Option<String>,
    pub account_identifiers: BTreeMap<String, String>,
    pub user_intent: Option<String>,
    pub clear_intent: bool,
    pub last_active_agent_id: Option<AgentId>,
}

impl MemoryUpdate {
    pub fn intent(intent: impl Into<String>) -> Self {
        Self {
            user_intent: Some(intent.into()),
            ..Default::default()
        }
    }

    pub fn active_agent(agent: impl Into<AgentId>) -> Self {
        Self {
            last_active_agent_id: Some(agent.into()),
            ..Default::default()
        }
    }

    pub fn with_verified(mut self, verified: bool) -> Self {
        self.verified = Some(verified);
        self
    }

    pub fn with_identifier(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.account_identifiers.insert(key.into(), value.into());
        self
    }

    pub fn with_active_agent(mut self, agent: impl Into<AgentId>) -> Self {
        self.last_active_agent_id = Some(agent.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One line of recent conversation kept for decision prompts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptLine {
    pub role: String,
    pub text: String,
}

impl TranscriptLine {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            role: "agent".to_string(),
            text: text.into(),
        }
    }
}
