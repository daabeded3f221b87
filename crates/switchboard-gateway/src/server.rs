//! Gateway server: session router assembly, HTTP routes, registry sweeper

use crate::auth::ResolvedAuth;
use crate::connector::WsAgentConnector;
use crate::rpc::{self, health_payload};
use crate::ws::handle_connection;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use switchboard_core::{RpcRequest, RpcResponse, SwitchboardConfig};
use switchboard_llm::AnthropicProvider;
use switchboard_router::{AgentRegistry, SessionMemoryStore, SessionRouter};
use switchboard_workflow::{DecisionEvaluator, LlmReasoner, WorkflowLibrary};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state for HTTP and WebSocket handlers.
pub struct GatewayState {
    pub auth: ResolvedAuth,
    pub router: Arc<SessionRouter>,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(auth: ResolvedAuth, router: Arc<SessionRouter>) -> Self {
        Self {
            auth,
            router,
            started_at: Instant::now(),
        }
    }
}

/// Assemble the session router from configuration: registry, memory store,
/// WebSocket agent connector, workflow library and (if an API key is present)
/// the decision evaluator.
pub fn build_router(config: &SwitchboardConfig) -> anyhow::Result<Arc<SessionRouter>> {
    let registry = Arc::new(AgentRegistry::from_config(&config.registry));
    let memory = Arc::new(SessionMemoryStore::new());

    let workflows = match &config.workflows.dir {
        Some(dir) => WorkflowLibrary::load_dir(dir)?,
        None => WorkflowLibrary::new(),
    };
    if !workflows.is_empty() {
        info!("Loaded workflows for: {}", workflows.agent_ids().join(", "));
    }

    let mut router = SessionRouter::new(config, registry, memory, Arc::new(WsAgentConnector::new()))
        .with_workflows(Arc::new(workflows));

    let reasoning = &config.reasoning;
    match std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty()) {
        Some(api_key) if reasoning.enabled => {
            let mut provider = AnthropicProvider::new(api_key);
            if let Some(url) = &reasoning.api_url {
                info!("Using custom reasoning API URL: {}", url);
                provider = provider.with_base_url(url.clone());
            }
            let reasoner = LlmReasoner::new(Arc::new(provider), reasoning.model.clone(), reasoning.max_tokens);
            router = router.with_evaluator(Arc::new(DecisionEvaluator::new(
                Arc::new(reasoner),
                config.router.context_window,
            )));
            info!("Decision evaluator enabled (model {})", reasoning.model);
        }
        Some(_) => info!("Decision evaluator disabled by config"),
        None if reasoning.enabled => {
            warn!("ANTHROPIC_API_KEY not set, decision nodes will not be evaluated")
        }
        None => {}
    }

    Ok(Arc::new(router))
}

/// HTTP surface: client `/ws`, admin `/rpc`, `/health`.
pub fn build_app(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

pub async fn start_gateway(config: SwitchboardConfig, env_token: Option<String>) -> anyhow::Result<()> {
    let auth = ResolvedAuth::from_config(&config.gateway.auth, env_token);
    let router = build_router(&config)?;

    let shutdown = CancellationToken::new();
    let sweeper = router
        .registry()
        .spawn_sweeper(config.registry.sweep_interval(), shutdown.child_token());

    let state = Arc::new(GatewayState::new(auth, router));
    let app = build_app(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.gateway.bind.to_addr(), config.gateway.port).parse()?;

    info!("Switchboard Gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  Clients:   ws://{}/ws", bind_addr);
    info!("  Admin RPC: http://{}/rpc", bind_addr);
    info!("  Auth mode: {:?}", config.gateway.auth.mode);
    info!("  Entry agent: {}", config.router.entry_agent);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
                _ = signal.cancelled() => {}
            }
        })
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    info!("Gateway stopped");
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn rpc_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(req): Json<RpcRequest>,
) -> Json<RpcResponse> {
    let bearer = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if let Err(e) = state.auth.verify_bearer(bearer) {
        warn!(method = %req.method, "Admin RPC rejected: {}", e);
        return Json(RpcResponse::auth_error(&req.id, e.to_string()));
    }
    let result = rpc::route_rpc(&req.method, req.params, &state).await;
    Json(rpc::to_response(&req.id, result))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(health_payload(&state))
}
