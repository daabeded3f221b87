//! Client WebSocket connections
//!
//! The first text frame must be `session_init`. After a successful attach the
//! connection is a plain pump between the socket and the session's router task.

use crate::server::GatewayState;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{Envelope, ErrorCode, Frame, SessionKey};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_CAPACITY: usize = 256;

fn to_ws(frame: Frame) -> Option<WsMessage> {
    match frame {
        Frame::Envelope(envelope) => envelope.to_text().ok().map(WsMessage::Text),
        Frame::Text(text) => Some(WsMessage::Text(text)),
        Frame::Binary(data) => Some(WsMessage::Binary(data.to_vec())),
    }
}

/// Read until the client's `session_init`. Returns `(session_id, token)`.
async fn wait_for_init(ws_rx: &mut SplitStream<WebSocket>) -> Option<(Option<String>, Option<String>)> {
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match Frame::parse_text(text) {
                Frame::Envelope(Envelope::SessionInit {
                    session_id, token, ..
                }) => return Some((session_id.filter(|s| !s.trim().is_empty()), token)),
                _ => debug!("Ignoring frame before session_init"),
            },
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Handle one client connection for its whole lifetime.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Ok(Some((session_id, token))) = tokio::time::timeout(INIT_TIMEOUT, wait_for_init(&mut ws_rx)).await
    else {
        debug!("Client left before session_init");
        return;
    };

    if let Err(e) = state.auth.verify_token(token.as_deref()) {
        warn!("Client auth failed: {}", e);
        if let Some(msg) = to_ws(Envelope::error(ErrorCode::Unauthorized, e.to_string()).into()) {
            let _ = ws_tx.send(msg).await;
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
        return;
    }

    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(CLIENT_CAPACITY);
    let handle = match state
        .router
        .attach_client(session_id.map(SessionKey::new), client_tx)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Session attach failed: {}", e);
            if let Some(msg) = to_ws(Envelope::unavailable().into()) {
                let _ = ws_tx.send(msg).await;
            }
            let _ = ws_tx.send(WsMessage::Close(None)).await;
            return;
        }
    };
    info!(session = %handle.key(), "Client attached");

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let frame = match msg {
                    Some(Ok(WsMessage::Text(text))) => Frame::parse_text(text),
                    Some(Ok(WsMessage::Binary(data))) => Frame::Binary(data.into()),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(session = %handle.key(), "WebSocket error: {}", e);
                        break;
                    }
                };
                if handle.send(frame).await.is_err() {
                    break;
                }
            }
            frame = client_rx.recv() => match frame {
                Some(frame) => {
                    let Some(msg) = to_ws(frame) else { continue };
                    if ws_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Session closed by the router.
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    return;
                }
            }
        }
    }

    info!(session = %handle.key(), "Client disconnected");
    handle.detach().await;
}
