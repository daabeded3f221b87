//! Wire protocol: typed JSON envelopes on the client and agent channels,
//! JSON-RPC for the admin surface.
//!
//! Client/agent text frames:
//!   { "type": "session_init", "session_id": "s-1", "token": "secret" }
//!   { "type": "tool_result", "id": "tc-1", "name": "transfer_to_idv", "content": { "reason": "balance check" } }
//!   { "type": "handoff_event", "from": "triage", "to": "idv", "reason": "balance check" }
//!
//! Binary frames (audio) are carried through untouched.
//!
//! Admin RPC (POST /rpc):
//!   { "id": "req-1", "method": "agents.register", "params": { "id": "idv", "address": "10.0.0.4:9001" } }
//!   { "id": "req-1", "result": { ... } }
//!   { "id": "req-1", "error": { "code": -32004, "message": "agent not found: idv" } }

use crate::types::{AgentId, SessionMemory};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Machine-readable error class carried in [`Envelope::Error`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Blocked,
    RoutingError,
    InvalidTransition,
    Unavailable,
    BadRequest,
    Unauthorized,
}

/// Generic notice shown to clients instead of internal errors.
pub const CLIENT_RETRY_MESSAGE: &str = "unable to continue, please retry";

/// A typed JSON message on a client or agent channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    SessionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<SessionMemory>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_node: Option<String>,
    },
    SessionReady {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
    },
    TextInput {
        text: String,
    },
    Transcript {
        role: String,
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    HandoffEvent {
        from: AgentId,
        to: AgentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Step {
        node: String,
    },
    Decision {
        node: String,
        edge: String,
        target: String,
        confidence: f32,
        reasoning: String,
        #[serde(default)]
        fallback: bool,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
    },
}

impl Envelope {
    /// Client handshake.
    pub fn client_init(session_id: Option<&str>, token: Option<&str>) -> Self {
        Self::SessionInit {
            session_id: session_id.map(String::from),
            token: token.map(String::from),
            agent_id: None,
            memory: None,
            workflow_node: None,
        }
    }

    /// Handshake sent to an agent when it takes ownership of a session.
    pub fn agent_init(
        agent_id: &AgentId,
        memory: SessionMemory,
        workflow_node: Option<String>,
    ) -> Self {
        Self::SessionInit {
            session_id: Some(memory.session_id.clone()),
            token: None,
            agent_id: Some(agent_id.clone()),
            memory: Some(memory),
            workflow_node,
        }
    }

    pub fn ready(session_id: impl Into<String>, agent_id: Option<AgentId>) -> Self {
        Self::SessionReady {
            session_id: session_id.into(),
            agent_id,
        }
    }

    pub fn text_input(text: impl Into<String>) -> Self {
        Self::TextInput { text: text.into() }
    }

    pub fn tool_result(id: impl Into<String>, name: impl Into<String>, content: Value) -> Self {
        Self::ToolResult {
            id: id.into(),
            name: name.into(),
            content,
            is_error: false,
        }
    }

    pub fn handoff_event(from: &AgentId, to: &AgentId, reason: Option<String>) -> Self {
        Self::HandoffEvent {
            from: from.clone(),
            to: to.clone(),
            reason,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            tool_call_id: None,
        }
    }

    /// Error answering a specific tool call of the owning agent.
    pub fn tool_error(code: ErrorCode, tool_call_id: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }

    /// The only error shape a client ever sees.
    pub fn unavailable() -> Self {
        Self::error(ErrorCode::Unavailable, CLIENT_RETRY_MESSAGE)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SessionInit { .. } => "session_init",
            Self::SessionReady { .. } => "session_ready",
            Self::TextInput { .. } => "text_input",
            Self::Transcript { .. } => "transcript",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::HandoffEvent { .. } => "handoff_event",
            Self::Step { .. } => "step",
            Self::Decision { .. } => "decision",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_text(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One unit on a duplex channel. Text that is not an [`Envelope`] is kept
/// verbatim so it can be forwarded untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Envelope(Envelope),
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn parse_text(text: String) -> Self {
        match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => Frame::Envelope(envelope),
            Err(_) => Frame::Text(text),
        }
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Frame::Envelope(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Envelope> for Frame {
    fn from(e: Envelope) -> Self {
        Frame::Envelope(e)
    }
}

// ---------------------------------------------------------------------------
// Admin RPC
// ---------------------------------------------------------------------------

/// RPC request on the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

pub const RPC_INVALID_PARAMS: i32 = -32602;
pub const RPC_METHOD_NOT_FOUND: i32 = -32601;
pub const RPC_INTERNAL_ERROR: i32 = -32603;
pub const RPC_AUTH_ERROR: i32 = -32000;
pub const RPC_NOT_FOUND: i32 = -32004;

impl RpcResponse {
    /// Successful response with a result value.
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    pub fn err(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn method_not_found(id: impl Into<String>, method: &str) -> Self {
        Self::err(id, RPC_METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn auth_error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::err(id, RPC_AUTH_ERROR, message)
    }
}

/// RPC error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}
