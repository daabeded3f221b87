//! Agent connections over WebSocket (`ws://{address}/session`)

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use switchboard_core::{AgentRecord, Envelope, Error, Frame, Result};
use switchboard_router::{AgentConnector, AgentLink};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMsg};
use tracing::{debug, info};

const DEFAULT_CAPACITY: usize = 256;

pub struct WsAgentConnector {
    capacity: usize,
}

impl Default for WsAgentConnector {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl WsAgentConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

pub(crate) fn to_tungstenite(frame: Frame) -> Option<WsMsg> {
    match frame {
        Frame::Envelope(envelope) => envelope.to_text().ok().map(WsMsg::Text),
        Frame::Text(text) => Some(WsMsg::Text(text)),
        Frame::Binary(data) => Some(WsMsg::Binary(data.to_vec())),
    }
}

#[async_trait::async_trait]
impl AgentConnector for WsAgentConnector {
    async fn connect(&self, agent: &AgentRecord, init: Envelope, timeout: Duration) -> Result<AgentLink> {
        let url = format!("ws://{}/session", agent.address);
        let id = agent.id.as_str();
        let refused = |reason: String| Error::routing(id, reason);

        let handshake = async {
            let (socket, _) = connect_async(&url)
                .await
                .map_err(|e| refused(format!("connect to {} failed: {}", url, e)))?;
            let (mut sink, mut stream) = socket.split();
            sink.send(WsMsg::Text(init.to_text()?))
                .await
                .map_err(|e| refused(e.to_string()))?;

            // Anything the agent says before confirming is kept for the router.
            let mut early = Vec::new();
            loop {
                match stream.next().await {
                    Some(Ok(WsMsg::Text(text))) => match Frame::parse_text(text) {
                        Frame::Envelope(Envelope::SessionReady { .. }) => break,
                        Frame::Envelope(Envelope::Error { message, .. }) => return Err(refused(message)),
                        other => early.push(other),
                    },
                    Some(Ok(WsMsg::Binary(data))) => early.push(Frame::Binary(data.into())),
                    Some(Ok(WsMsg::Close(_))) | None => {
                        return Err(refused("closed before session_ready".to_string()))
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(refused(e.to_string())),
                }
            }
            Ok::<_, Error>((sink, stream, early))
        };

        let (mut sink, mut stream, early) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| refused("timed out waiting for session_ready".to_string()))??;
        info!(agent = %agent.id, "Agent session confirmed at {}", agent.address);

        let (to_agent, mut outbound) = mpsc::channel::<Frame>(self.capacity);
        let (inbound, from_agent) = mpsc::channel::<Frame>(self.capacity.max(early.len()));
        for frame in early {
            let _ = inbound.try_send(frame);
        }

        let agent_id = agent.id.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let Some(msg) = to_tungstenite(frame) else {
                    continue;
                };
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
            debug!(agent = %agent_id, "Agent writer finished");
        });

        let agent_id = agent.id.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let frame = match msg {
                    Ok(WsMsg::Text(text)) => Frame::parse_text(text),
                    Ok(WsMsg::Binary(data)) => Frame::Binary(data.into()),
                    Ok(WsMsg::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(agent = %agent_id, "Agent socket error: {}", e);
                        break;
                    }
                };
                if inbound.send(frame).await.is_err() {
                    break;
                }
            }
            debug!(agent = %agent_id, "Agent reader finished");
        });

        Ok(AgentLink {
            tx: to_agent,
            rx: from_agent,
        })
    }
}
