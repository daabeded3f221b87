//! Agent connection seam

use std::time::Duration;
use switchboard_core::{AgentRecord, Envelope, Frame, Result};
use tokio::sync::mpsc;

/// A live, confirmed session with one agent process. Dropping `tx` closes the
/// agent side; `rx` yields `None` once the agent goes away.
pub struct AgentLink {
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<Frame>,
}

/// Opens agent sessions. The gateway implements this over WebSockets; tests
/// use in-memory channels.
#[async_trait::async_trait]
pub trait AgentConnector: Send + Sync {
    /// Connect to `agent`, send `init` (a `session_init` envelope carrying the
    /// session memory), and return once the agent confirms with `session_ready`.
    async fn connect(&self, agent: &AgentRecord, init: Envelope, timeout: Duration) -> Result<AgentLink>;
}
