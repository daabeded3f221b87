//! Switchboard Gateway - client WebSocket surface, admin RPC and agent connections

pub mod auth;
pub mod connector;
pub mod rpc;
pub mod server;
pub mod ws;

pub use auth::ResolvedAuth;
pub use connector::WsAgentConnector;
pub use server::{build_app, build_router, start_gateway, GatewayState};
