//! Admin RPC router: dispatches method calls to the registry, memory store and router
//!
//! Agents call `agents.register` on startup and `agents.heartbeat` periodically.
//! Operators use the `memory.*` and `sessions.*` methods for inspection.

use crate::server::GatewayState;
use serde_json::Value;
use switchboard_core::{
    AgentId, Error, MemoryUpdate, RpcResponse, SessionKey, RPC_AUTH_ERROR, RPC_INTERNAL_ERROR,
    RPC_INVALID_PARAMS, RPC_METHOD_NOT_FOUND, RPC_NOT_FOUND,
};
use tracing::info;

/// Result type for RPC handlers.
pub type RpcResult = Result<Value, (i32, String)>;

/// Route an RPC method call to the appropriate handler.
pub async fn route_rpc(method: &str, params: Value, state: &GatewayState) -> RpcResult {
    match method {
        "agents.register" => handle_agents_register(params, state),
        "agents.heartbeat" => handle_agents_heartbeat(params, state),
        "agents.deregister" => handle_agents_deregister(params, state),
        "agents.get" => handle_agents_get(params, state),
        "agents.list" => handle_agents_list(params, state),
        "memory.get" => handle_memory_get(params, state).await,
        "memory.merge" => handle_memory_merge(params, state).await,
        "memory.delete" => handle_memory_delete(params, state),
        "sessions.list" => handle_sessions_list(state),
        "health" => Ok(health_payload(state)),
        "echo" => Ok(params),
        _ => Err((RPC_METHOD_NOT_FOUND, format!("Method not found: {}", method))),
    }
}

/// Convert an RPC result to an RpcResponse.
pub fn to_response(id: &str, result: RpcResult) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err((code, message)) => RpcResponse::err(id, code, message),
    }
}

fn required<'a>(params: &'a Value, name: &str) -> Result<&'a str, (i32, String)> {
    params[name]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| (RPC_INVALID_PARAMS, format!("Missing required param: {}", name)))
}

fn domain_error(e: Error) -> (i32, String) {
    let code = match &e {
        Error::AgentNotFound(_) | Error::SessionNotFound(_) => RPC_NOT_FOUND,
        Error::InvalidAddress { .. } | Error::InvalidMessage(_) => RPC_INVALID_PARAMS,
        Error::AuthFailed { .. } => RPC_AUTH_ERROR,
        _ => RPC_INTERNAL_ERROR,
    };
    (code, e.to_string())
}

fn to_value<T: serde::Serialize>(value: &T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| (RPC_INTERNAL_ERROR, e.to_string()))
}

/// Shared by the `health` method and `GET /health`.
pub fn health_payload(state: &GatewayState) -> Value {
    let registry = state.router.registry();
    serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "agents": {
            "total": registry.len(),
            "routable": registry.list_routable().len(),
        },
        "sessions": state.router.session_count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    })
}

// ---------------------------------------------------------------------------
// agents.*: registration protocol
// ---------------------------------------------------------------------------

fn handle_agents_register(params: Value, state: &GatewayState) -> RpcResult {
    let id = required(&params, "id")?;
    let address = required(&params, "address")?;
    let capabilities: Vec<String> = match params.get("capabilities") {
        None | Some(Value::Null) => Vec::new(),
        Some(caps) => serde_json::from_value(caps.clone())
            .map_err(|_| (RPC_INVALID_PARAMS, "capabilities must be a list of strings".to_string()))?,
    };
    let record = state
        .router
        .registry()
        .register(id, address, capabilities)
        .map_err(domain_error)?;
    to_value(&record)
}

fn handle_agents_heartbeat(params: Value, state: &GatewayState) -> RpcResult {
    let id = AgentId::new(required(&params, "id")?);
    state.router.registry().heartbeat(&id).map_err(domain_error)?;
    Ok(serde_json::json!({ "ok": true }))
}

fn handle_agents_deregister(params: Value, state: &GatewayState) -> RpcResult {
    let id = AgentId::new(required(&params, "id")?);
    let removed = state.router.registry().deregister(&id);
    Ok(serde_json::json!({ "removed": removed }))
}

fn handle_agents_get(params: Value, state: &GatewayState) -> RpcResult {
    let id = AgentId::new(required(&params, "id")?);
    let record = state.router.registry().get(&id).map_err(domain_error)?;
    to_value(&record)
}

fn handle_agents_list(params: Value, state: &GatewayState) -> RpcResult {
    let registry = state.router.registry();
    let include_unhealthy = params["include_unhealthy"].as_bool().unwrap_or(false);
    let agents = match (params["capability"].as_str(), include_unhealthy) {
        (Some(tag), false) => registry.list_by_capability(tag),
        (Some(tag), true) => registry
            .list_all()
            .into_iter()
            .filter(|r| r.has_capability(tag))
            .collect(),
        (None, false) => registry.list_routable(),
        (None, true) => registry.list_all(),
    };
    Ok(serde_json::json!({ "agents": to_value(&agents)? }))
}

// ---------------------------------------------------------------------------
// memory.*: session memory inspection
// ---------------------------------------------------------------------------

async fn handle_memory_get(params: Value, state: &GatewayState) -> RpcResult {
    let session = SessionKey::new(required(&params, "session")?);
    let memory = state.router.memory().get(&session).await;
    to_value(&memory)
}

async fn handle_memory_merge(params: Value, state: &GatewayState) -> RpcResult {
    let session = SessionKey::new(required(&params, "session")?);
    let update: MemoryUpdate = serde_json::from_value(params["update"].clone())
        .map_err(|e| (RPC_INVALID_PARAMS, format!("Invalid update: {}", e)))?;
    let merged = state.router.memory().merge(&session, update).await;
    info!(session = %session, version = merged.version, "Memory merged via RPC");
    to_value(&merged)
}

fn handle_memory_delete(params: Value, state: &GatewayState) -> RpcResult {
    let session = SessionKey::new(required(&params, "session")?);
    let deleted = state.router.memory().delete(&session);
    Ok(serde_json::json!({ "deleted": deleted }))
}

// ---------------------------------------------------------------------------
// sessions.list: live sessions with phase and bound agent
// ---------------------------------------------------------------------------

fn handle_sessions_list(state: &GatewayState) -> RpcResult {
    let sessions = state.router.list_sessions();
    Ok(serde_json::json!({ "sessions": to_value(&sessions)? }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ResolvedAuth;
    use crate::connector::WsAgentConnector;
    use serde_json::json;
    use std::sync::Arc;
    use switchboard_core::SwitchboardConfig;
    use switchboard_router::{AgentRegistry, SessionMemoryStore, SessionRouter};

    fn state() -> GatewayState {
        let config = SwitchboardConfig::default();
        let router = SessionRouter::new(
            &config,
            Arc::new(AgentRegistry::from_config(&config.registry)),
            Arc::new(SessionMemoryStore::new()),
            Arc::new(WsAgentConnector::new()),
        );
        GatewayState::new(ResolvedAuth::open(), Arc::new(router))
    }

    #[tokio::test]
    async fn register_heartbeat_get() {
        let s = state();
        let record = route_rpc(
            "agents.register",
            json!({"id": "idv", "address": "10.0.0.4:9001", "capabilities": ["identity"]}),
            &s,
        )
        .await
        .unwrap();
        assert_eq!(record["status"], "starting");
        assert_eq!(record["capabilities"], json!(["identity"]));

        let ok = route_rpc("agents.heartbeat", json!({"id": "idv"}), &s).await.unwrap();
        assert_eq!(ok, json!({"ok": true}));

        let got = route_rpc("agents.get", json!({"id": "idv"}), &s).await.unwrap();
        assert_eq!(got["status"], "healthy");
        assert_eq!(got["address"], "10.0.0.4:9001");
    }

    #[tokio::test]
    async fn heartbeat_unknown_agent_is_not_found() {
        let (code, message) = route_rpc("agents.heartbeat", json!({"id": "ghost"}), &state())
            .await
            .unwrap_err();
        assert_eq!(code, RPC_NOT_FOUND);
        assert!(message.contains("ghost"));
    }

    #[tokio::test]
    async fn register_rejects_bad_input() {
        let s = state();
        let (code, _) = route_rpc("agents.register", json!({"id": "idv"}), &s).await.unwrap_err();
        assert_eq!(code, RPC_INVALID_PARAMS);
        let (code, _) = route_rpc(
            "agents.register",
            json!({"id": "idv", "address": "no-port"}),
            &s,
        )
        .await
        .unwrap_err();
        assert_eq!(code, RPC_INVALID_PARAMS);
        let (code, _) = route_rpc(
            "agents.register",
            json!({"id": "idv", "address": "h:1", "capabilities": "identity"}),
            &s,
        )
        .await
        .unwrap_err();
        assert_eq!(code, RPC_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn list_by_capability_and_deregister() {
        let s = state();
        for (id, cap) in [("idv", "identity"), ("banking", "accounts"), ("kyc", "identity")] {
            route_rpc(
                "agents.register",
                json!({"id": id, "address": "127.0.0.1:9000", "capabilities": [cap]}),
                &s,
            )
            .await
            .unwrap();
        }
        let listed = route_rpc("agents.list", json!({"capability": "identity"}), &s)
            .await
            .unwrap();
        let ids: Vec<&str> = listed["agents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["idv", "kyc"]);

        let removed = route_rpc("agents.deregister", json!({"id": "kyc"}), &s).await.unwrap();
        assert_eq!(removed["removed"], true);
        let all = route_rpc("agents.list", Value::Null, &s).await.unwrap();
        assert_eq!(all["agents"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn memory_merge_respects_write_once_intent() {
        let s = state();
        route_rpc(
            "memory.merge",
            json!({"session": "s-1", "update": {"user_intent": "check balance"}}),
            &s,
        )
        .await
        .unwrap();
        let merged = route_rpc(
            "memory.merge",
            json!({"session": "s-1", "update": {"user_intent": "user verified", "verified": true}}),
            &s,
        )
        .await
        .unwrap();
        assert_eq!(merged["user_intent"], "check balance");
        assert_eq!(merged["verified"], true);
        assert_eq!(merged["version"], 2);

        let got = route_rpc("memory.get", json!({"session": "s-1"}), &s).await.unwrap();
        assert_eq!(got, merged);

        let deleted = route_rpc("memory.delete", json!({"session": "s-1"}), &s).await.unwrap();
        assert_eq!(deleted["deleted"], true);
        let empty = route_rpc("memory.get", json!({"session": "s-1"}), &s).await.unwrap();
        assert_eq!(empty["version"], 0);
    }

    #[tokio::test]
    async fn unknown_method_and_echo() {
        let s = state();
        let (code, _) = route_rpc("agents.explode", Value::Null, &s).await.unwrap_err();
        assert_eq!(code, RPC_METHOD_NOT_FOUND);
        let echoed = route_rpc("echo", json!({"x": 1}), &s).await.unwrap();
        assert_eq!(echoed, json!({"x": 1}));
        let health = route_rpc("health", Value::Null, &s).await.unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["sessions"], 0);
    }

    #[test]
    fn responses() {
        let ok = to_response("r1", Ok(json!({"a": 1})));
        assert!(ok.error.is_none());
        let err = to_response("r2", Err((RPC_NOT_FOUND, "nope".into())));
        assert_eq!(err.error.unwrap().code, RPC_NOT_FOUND);
    }

    #[test]
    fn domain_errors_map_to_rpc_codes() {
        assert_eq!(domain_error(Error::AgentNotFound("idv".into())).0, RPC_NOT_FOUND);
        assert_eq!(domain_error(Error::invalid_address("x", "missing port")).0, RPC_INVALID_PARAMS);
        assert_eq!(
            domain_error(Error::AuthFailed { reason: "bad token".into() }).0,
            RPC_AUTH_ERROR
        );
        assert_eq!(domain_error(Error::routing("banking", "refused")).0, RPC_INTERNAL_ERROR);
        assert_eq!(domain_error(Error::Config("bad toml".into())).0, RPC_INTERNAL_ERROR);
    }
}
