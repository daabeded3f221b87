//! Session router: owns the client side and the bound agent side of every
//! session and moves ownership between agents.
//!
//! Each session runs as one task with one serialized event loop. Client
//! frames, agent frames, finished handoff connections and finished decision
//! evaluations all arrive through the same `select!`, so a session never runs
//! two handoffs at once and a tool result always reaches the client before
//! the agent pointer moves.

use crate::connector::{AgentConnector, AgentLink};
use crate::guard::{CallGuard, InFlightGuard, Verdict};
use crate::handoff::{extract_memory_update, HandoffOrigin, HandoffRequest, HandoffTable, ToolKind};
use crate::memory::SessionMemoryStore;
use crate::policy::AutoRoutePolicy;
use crate::registry::AgentRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{
    AgentId, AgentRecord, Envelope, Error, ErrorCode, Frame, MemoryUpdate, Result, RouterConfig,
    SessionKey, SwitchboardConfig, TranscriptLine,
};
use switchboard_workflow::{Decision, DecisionEvaluator, GraphState, Workflow, WorkflowLibrary};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Session snapshots
// ---------------------------------------------------------------------------

/// Unbound → Bound → HandingOff → Bound → … → Draining → Closed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Unbound,
    Bound,
    HandingOff,
    Draining,
    Closed,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub session: SessionKey,
    pub phase: SessionPhase,
    pub agent: Option<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handing_off_to: Option<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphState>,
    /// Completed ownership transfers.
    pub handoffs: u32,
}

impl SessionSnapshot {
    fn unbound(session: &SessionKey) -> Self {
        Self {
            session: session.clone(),
            phase: SessionPhase::Unbound,
            agent: None,
            handing_off_to: None,
            graph: None,
            handoffs: 0,
        }
    }
}

enum Control {
    /// Client went away: keep the agent for the grace period.
    Detach,
    /// Tear down now, or as soon as an in-flight handoff finishes.
    Close,
}

// ---------------------------------------------------------------------------
// Session handle: the gateway's end of a session
// ---------------------------------------------------------------------------

pub struct SessionHandle {
    key: SessionKey,
    inbound: mpsc::Sender<Frame>,
    control: mpsc::Sender<Control>,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Deliver a client frame to the session loop.
    pub async fn send(&self, frame: impl Into<Frame>) -> Result<()> {
        self.inbound
            .send(frame.into())
            .await
            .map_err(|_| Error::ConnectionClosed(self.key.to_string()))
    }

    /// Start the detach grace period.
    pub async fn detach(&self) {
        let _ = self.control.send(Control::Detach).await;
    }

    /// Close without waiting out the grace period.
    pub async fn close(&self) {
        let _ = self.control.send(Control::Close).await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Wait until `predicate` holds for the session state. Returns the matching
    /// snapshot, or the last one seen if the session task is gone.
    pub async fn wait_until(&self, predicate: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let mut state = self.state.clone();
        loop {
            {
                let current = state.borrow_and_update();
                if predicate(&current) {
                    return current.clone();
                }
            }
            if state.changed().await.is_err() {
                return state.borrow().clone();
            }
        }
    }

    pub async fn closed(&self) -> SessionSnapshot {
        self.wait_until(|s| s.phase == SessionPhase::Closed).await
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

struct LiveSession {
    state: watch::Receiver<SessionSnapshot>,
    control: mpsc::Sender<Control>,
}

pub struct SessionRouter {
    registry: Arc<AgentRegistry>,
    memory: Arc<SessionMemoryStore>,
    guard: Arc<CallGuard>,
    connector: Arc<dyn AgentConnector>,
    workflows: Arc<WorkflowLibrary>,
    evaluator: Option<Arc<DecisionEvaluator>>,
    handoffs: HandoffTable,
    policy: AutoRoutePolicy,
    config: RouterConfig,
    entry_agent: AgentId,
    sessions: DashMap<SessionKey, LiveSession>,
}

impl SessionRouter {
    pub fn new(
        config: &SwitchboardConfig,
        registry: Arc<AgentRegistry>,
        memory: Arc<SessionMemoryStore>,
        connector: Arc<dyn AgentConnector>,
    ) -> Self {
        Self {
            registry,
            memory,
            guard: Arc::new(CallGuard::from_config(&config.guard)),
            connector,
            workflows: Arc::new(WorkflowLibrary::new()),
            evaluator: None,
            handoffs: HandoffTable::from_config(&config.handoff),
            policy: AutoRoutePolicy::from_config(&config.policy),
            config: config.router.clone(),
            entry_agent: AgentId::new(config.router.entry_agent.clone()),
            sessions: DashMap::new(),
        }
    }

    pub fn with_workflows(mut self, workflows: Arc<WorkflowLibrary>) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<DecisionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> &Arc<SessionMemoryStore> {
        &self.memory
    }

    pub fn guard(&self) -> &Arc<CallGuard> {
        &self.guard
    }

    pub fn entry_agent(&self) -> &AgentId {
        &self.entry_agent
    }

    /// Bind a new client session to the entry agent and start its task.
    ///
    /// Fails without leaving any state behind if the session id is already
    /// live or the entry agent cannot be reached.
    pub async fn attach_client(
        self: &Arc<Self>,
        session: Option<SessionKey>,
        client_tx: mpsc::Sender<Frame>,
    ) -> Result<SessionHandle> {
        let key = session.unwrap_or_else(SessionKey::generate);
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::unbound(&key));
        let (control_tx, control_rx) = mpsc::channel(8);

        match self.sessions.entry(key.clone()) {
            Entry::Occupied(_) => return Err(Error::SessionExists(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(LiveSession {
                    state: state_rx.clone(),
                    control: control_tx.clone(),
                });
            }
        }

        let (agent, link, graph) = match self.bind_entry(&key).await {
            Ok(bound) => bound,
            Err(e) => {
                warn!(session = %key, error = %e, "Session attach failed");
                self.sessions.remove(&key);
                self.memory.delete(&key);
                return Err(e);
            }
        };

        let _ = client_tx
            .send(Envelope::ready(key.as_str(), Some(agent.clone())).into())
            .await;

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(16);
        let task = SessionTask {
            router: Arc::clone(self),
            key: key.clone(),
            client_tx,
            client_rx: inbound_rx,
            control_rx,
            events_tx,
            events_rx,
            state_tx,
            agent,
            agent_tx: link.tx,
            agent_rx: link.rx,
            agent_alive: true,
            graph,
            transcript: VecDeque::new(),
            pending: None,
            decision_seq: 0,
            client_gone: false,
            deadline: None,
            close_requested: false,
            closed: false,
            handoffs: 0,
        };
        task.publish();
        tokio::spawn(task.run());

        Ok(SessionHandle {
            key,
            inbound: inbound_tx,
            control: control_tx,
            state: state_rx,
        })
    }

    pub fn snapshot(&self, key: &SessionKey) -> Option<SessionSnapshot> {
        self.sessions.get(key).map(|s| s.state.borrow().clone())
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|s| s.state.borrow().clone())
            .collect();
        all.sort_by(|a, b| a.session.cmp(&b.session));
        all
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Ask a live session to close. Returns false if it is not live.
    pub fn close_session(&self, key: &SessionKey) -> bool {
        match self.sessions.get(key) {
            Some(live) => live.control.try_send(Control::Close).is_ok(),
            None => false,
        }
    }

    async fn bind_entry(
        &self,
        key: &SessionKey,
    ) -> Result<(AgentId, AgentLink, Option<(Arc<Workflow>, GraphState)>)> {
        let agent = self.entry_agent.clone();
        let record = self
            .registry
            .get(&agent)
            .map_err(|_| Error::routing(agent.as_str(), "entry agent not registered"))?;
        let memory = self
            .memory
            .merge(key, MemoryUpdate::active_agent(agent.clone()))
            .await;
        let graph = self.start_graph(&agent);
        let init = Envelope::agent_init(
            &agent,
            memory,
            graph.as_ref().map(|(_, s)| s.current_node_id.clone()),
        );
        let link = connect_agent(
            self.connector.as_ref(),
            &record,
            init,
            self.config.connect_timeout(),
        )
        .await?;
        Ok((agent, link, graph))
    }

    fn start_graph(&self, agent: &AgentId) -> Option<(Arc<Workflow>, GraphState)> {
        self.workflows.get(agent.as_str()).map(|wf| {
            let state = wf.start();
            (wf, state)
        })
    }
}

async fn connect_agent(
    connector: &dyn AgentConnector,
    record: &AgentRecord,
    init: Envelope,
    timeout: Duration,
) -> Result<AgentLink> {
    match tokio::time::timeout(timeout, connector.connect(record, init, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(Error::routing(record.id.as_str(), "connection timed out")),
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

enum TaskEvent {
    Connected {
        request: HandoffRequest,
        result: Result<AgentLink>,
        flight: InFlightGuard,
    },
    Decided {
        seq: u64,
        node: String,
        result: switchboard_workflow::Result<Decision>,
    },
}

struct SessionTask {
    router: Arc<SessionRouter>,
    key: SessionKey,
    client_tx: mpsc::Sender<Frame>,
    client_rx: mpsc::Receiver<Frame>,
    control_rx: mpsc::Receiver<Control>,
    events_tx: mpsc::Sender<TaskEvent>,
    events_rx: mpsc::Receiver<TaskEvent>,
    state_tx: watch::Sender<SessionSnapshot>,
    agent: AgentId,
    agent_tx: mpsc::Sender<Frame>,
    agent_rx: mpsc::Receiver<Frame>,
    agent_alive: bool,
    graph: Option<(Arc<Workflow>, GraphState)>,
    transcript: VecDeque<TranscriptLine>,
    /// Target of the handoff currently being connected.
    pending: Option<AgentId>,
    /// Bumped on every graph move; stale decisions are discarded.
    decision_seq: u64,
    client_gone: bool,
    deadline: Option<Instant>,
    close_requested: bool,
    closed: bool,
    handoffs: u32,
}

impl SessionTask {
    async fn run(mut self) {
        info!(session = %self.key, agent = %self.agent, "Session bound");
        if let Some((workflow, state)) = &self.graph {
            if workflow.is_decision_node(state) {
                let workflow = Arc::clone(workflow);
                self.spawn_decision(workflow);
            }
        }

        loop {
            let deadline = self.deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                frame = self.client_rx.recv(), if !self.client_gone => match frame {
                    Some(frame) => self.on_client_frame(frame).await,
                    None => self.begin_drain("client disconnected"),
                },
                frame = self.agent_rx.recv(), if self.agent_alive => match frame {
                    Some(frame) => self.on_agent_frame(frame).await,
                    None => self.on_agent_lost().await,
                },
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
                Some(control) = self.control_rx.recv() => match control {
                    Control::Detach => self.begin_drain("client detached"),
                    Control::Close => {
                        debug!(session = %self.key, "Close requested");
                        self.client_gone = true;
                        self.close_requested = true;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if self.deadline.is_some() && self.pending.is_none() => {
                    debug!(session = %self.key, "Detach grace period elapsed");
                    break;
                }
            }
            if self.close_requested && self.pending.is_none() {
                break;
            }
        }

        self.teardown();
    }

    // -- client side ---------------------------------------------------------

    async fn on_client_frame(&mut self, frame: Frame) {
        match &frame {
            Frame::Envelope(Envelope::SessionInit { .. }) => {
                debug!(session = %self.key, "Ignoring repeated session_init");
                return;
            }
            Frame::Envelope(Envelope::TextInput { text }) => {
                self.remember(TranscriptLine::user(text.clone()));
            }
            _ => {}
        }
        self.send_agent(frame).await;
    }

    fn begin_drain(&mut self, why: &str) {
        if self.deadline.is_some() {
            return;
        }
        let grace = self.router.config.detach_grace();
        info!(session = %self.key, "{}, keeping agent for {:?}", why, grace);
        self.client_gone = true;
        self.deadline = Some(Instant::now() + grace);
        self.publish();
    }

    // -- agent side ----------------------------------------------------------

    async fn on_agent_frame(&mut self, frame: Frame) {
        let envelope = match frame {
            Frame::Envelope(envelope) => envelope,
            other => {
                self.send_client(other).await;
                return;
            }
        };

        match envelope {
            Envelope::ToolResult {
                id,
                name,
                content,
                is_error,
            } => {
                // The client sees the tool result before any ownership change.
                self.send_client(Envelope::ToolResult {
                    id: id.clone(),
                    name: name.clone(),
                    content: content.clone(),
                    is_error,
                })
                .await;
                if !is_error {
                    self.on_tool_result(id, name, content).await;
                }
            }
            Envelope::Step { node } => self.on_step(node).await,
            Envelope::Transcript { role, text } => {
                self.remember(TranscriptLine {
                    role: role.clone(),
                    text: text.clone(),
                });
                self.send_client(Envelope::Transcript { role, text }).await;
            }
            Envelope::SessionInit { .. }
            | Envelope::SessionReady { .. }
            | Envelope::HandoffEvent { .. }
            | Envelope::Decision { .. } => {
                debug!(session = %self.key, kind = envelope.type_name(), "Dropping agent control frame");
            }
            Envelope::Error { code, message, .. } => {
                warn!(session = %self.key, agent = %self.agent, ?code, "Agent reported error: {}", message);
                self.send_client(Envelope::unavailable()).await;
            }
            other => self.send_client(other).await,
        }
    }

    async fn on_tool_result(&mut self, id: String, name: String, content: Value) {
        match self.router.handoffs.classify(&name) {
            ToolKind::Handoff(target) => {
                self.request_handoff(target, name.clone(), id, &content, HandoffOrigin::Tool, &name)
                    .await;
            }
            ToolKind::Ordinary => {
                let route = self.router.policy.matches(&self.agent, &name, &content).cloned();
                if let Some(route) = route {
                    info!(session = %self.key, "Auto-route {} -> {} after {}", route.from, route.to, name);
                    self.request_handoff(
                        route.to.clone(),
                        name,
                        id,
                        &content,
                        HandoffOrigin::AutoRoute,
                        &route.guard_key(),
                    )
                    .await;
                }
            }
        }
    }

    async fn request_handoff(
        &mut self,
        target: AgentId,
        tool: String,
        tool_call_id: String,
        content: &Value,
        origin: HandoffOrigin,
        guard_key: &str,
    ) {
        if target == self.agent {
            let err = Error::routing(target.as_str(), "session is already bound to this agent");
            self.send_agent(Envelope::tool_error(err.code(), &tool_call_id, err.to_string()))
                .await;
            return;
        }

        if self.pending.is_some() || self.router.guard.is_handoff_in_flight(&self.key) {
            debug!(session = %self.key, tool = %tool, "Handoff already in flight, dropping request");
            self.send_agent(Envelope::tool_error(
                ErrorCode::Blocked,
                &tool_call_id,
                "handoff already in progress",
            ))
            .await;
            return;
        }

        if let Verdict::Blocked(reason) = self.router.guard.allow(&self.key, guard_key) {
            let err = Error::blocked(&tool, reason);
            warn!(session = %self.key, "{}", err);
            self.send_agent(Envelope::tool_error(err.code(), &tool_call_id, err.to_string()))
                .await;
            return;
        }

        let Some(flight) = self.router.guard.try_mark_handoff_in_flight(&self.key) else {
            return;
        };

        let update = extract_memory_update(content);
        let reason = update.user_intent.clone();
        let snapshot = self.router.memory.merge(&self.key, update).await;

        let record = match self.router.registry.get(&target) {
            Ok(record) => record,
            Err(_) => {
                let err = Error::routing(target.as_str(), "agent not registered");
                warn!(session = %self.key, "{}", err);
                self.send_agent(Envelope::tool_error(err.code(), &tool_call_id, err.to_string()))
                    .await;
                return;
            }
        };

        let request = HandoffRequest {
            from: self.agent.clone(),
            target,
            tool,
            tool_call_id: Some(tool_call_id),
            reason,
            origin,
            snapshot,
        };
        self.spawn_connect(record, request, flight);
    }

    /// Re-route to the entry agent after losing the bound one.
    async fn start_fallback(&mut self) -> bool {
        let entry = self.router.entry_agent.clone();
        if !self.router.config.fallback_to_entry || entry == self.agent {
            return false;
        }
        let Some(flight) = self.router.guard.try_mark_handoff_in_flight(&self.key) else {
            return false;
        };
        let record = match self.router.registry.get(&entry) {
            Ok(record) => record,
            Err(e) => {
                warn!(session = %self.key, error = %e, "Fallback to entry agent impossible");
                return false;
            }
        };
        let snapshot = self.router.memory.get(&self.key).await;
        let request = HandoffRequest {
            from: self.agent.clone(),
            target: entry,
            tool: "fallback".to_string(),
            tool_call_id: None,
            reason: None,
            origin: HandoffOrigin::Fallback,
            snapshot,
        };
        self.spawn_connect(record, request, flight);
        true
    }

    fn spawn_connect(&mut self, record: AgentRecord, request: HandoffRequest, flight: InFlightGuard) {
        info!(
            session = %self.key,
            from = %request.from,
            to = %request.target,
            origin = ?request.origin,
            "Handoff started"
        );
        self.pending = Some(request.target.clone());
        self.publish();

        let node = self
            .router
            .workflows
            .get(request.target.as_str())
            .map(|wf| wf.entry().id.clone());
        let init = Envelope::agent_init(&request.target, request.snapshot.clone(), node);
        let connector = Arc::clone(&self.router.connector);
        let timeout = self.router.config.connect_timeout();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = connect_agent(connector.as_ref(), &record, init, timeout).await;
            let _ = events
                .send(TaskEvent::Connected {
                    request,
                    result,
                    flight,
                })
                .await;
        });
    }

    async fn on_agent_lost(&mut self) {
        self.agent_alive = false;
        if self.pending.is_some() {
            debug!(session = %self.key, agent = %self.agent, "Agent closed during handoff");
            return;
        }
        if self.client_gone {
            self.close_requested = true;
            return;
        }
        warn!(session = %self.key, agent = %self.agent, "Agent connection lost");
        if !self.start_fallback().await {
            self.send_client(Envelope::unavailable()).await;
            self.close_requested = true;
        }
    }

    // -- background results --------------------------------------------------

    async fn on_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Connected {
                request,
                result,
                flight,
            } => {
                self.pending = None;
                match result {
                    Ok(link) => {
                        self.complete_handoff(request, link).await;
                        drop(flight);
                    }
                    Err(e) => {
                        drop(flight);
                        self.fail_handoff(request, e).await;
                    }
                }
                self.publish();
            }
            TaskEvent::Decided { seq, node, result } => self.on_decision(seq, node, result).await,
        }
    }

    async fn complete_handoff(&mut self, request: HandoffRequest, link: AgentLink) {
        let previous = std::mem::replace(&mut self.agent, request.target.clone());
        // Replacing the sender closes the previous agent's session.
        self.agent_tx = link.tx;
        self.agent_rx = link.rx;
        self.agent_alive = true;
        self.graph = self.router.start_graph(&self.agent);
        self.decision_seq += 1;
        self.handoffs += 1;
        self.router
            .memory
            .merge(&self.key, MemoryUpdate::active_agent(self.agent.clone()))
            .await;

        let reason = match request.origin {
            HandoffOrigin::Fallback => Some("previous agent unavailable".to_string()),
            _ => request.reason,
        };
        self.send_client(Envelope::handoff_event(&previous, &self.agent, reason))
            .await;
        info!(session = %self.key, from = %previous, to = %self.agent, "Handoff complete");

        if let Some((workflow, state)) = &self.graph {
            if workflow.is_decision_node(state) {
                let workflow = Arc::clone(workflow);
                self.spawn_decision(workflow);
            }
        }
    }

    async fn fail_handoff(&mut self, request: HandoffRequest, error: Error) {
        let error = match error {
            e @ Error::Routing { .. } => e,
            other => Error::routing(request.target.as_str(), other.to_string()),
        };
        warn!(session = %self.key, "Handoff failed: {}", error);

        if request.origin == HandoffOrigin::Fallback {
            self.send_client(Envelope::unavailable()).await;
            self.close_requested = true;
            return;
        }

        if self.agent_alive {
            let notice = match &request.tool_call_id {
                Some(id) => Envelope::tool_error(error.code(), id, error.to_string()),
                None => Envelope::error(error.code(), error.to_string()),
            };
            self.send_agent(notice).await;
        } else if self.client_gone {
            self.close_requested = true;
        } else if !self.start_fallback().await {
            self.send_client(Envelope::unavailable()).await;
            self.close_requested = true;
        }
    }

    // -- workflow graph ------------------------------------------------------

    async fn on_step(&mut self, node: String) {
        let Some((workflow, state)) = self.graph.as_ref() else {
            debug!(session = %self.key, agent = %self.agent, "Step reported without a workflow");
            return;
        };
        let workflow = Arc::clone(workflow);
        match workflow.transition(state, &node) {
            Ok(next) => {
                let decide = workflow.is_decision_node(&next);
                self.graph = Some((Arc::clone(&workflow), next));
                self.decision_seq += 1;
                self.publish();
                if decide {
                    self.spawn_decision(workflow);
                }
            }
            Err(e) => {
                warn!(session = %self.key, agent = %self.agent, "{}", e);
                let err: Error = e.into();
                self.send_agent(Envelope::error(err.code(), err.to_string())).await;
            }
        }
    }

    fn spawn_decision(&mut self, workflow: Arc<Workflow>) {
        let Some(evaluator) = self.router.evaluator.clone() else {
            return;
        };
        let Some((_, state)) = &self.graph else {
            return;
        };
        let node = state.current_node_id.clone();
        let seq = self.decision_seq;
        let context: Vec<TranscriptLine> = self.transcript.iter().cloned().collect();
        let events = self.events_tx.clone();
        debug!(session = %self.key, node = %node, "Evaluating decision");
        tokio::spawn(async move {
            let result = evaluator.evaluate_at(&workflow, &node, &context).await;
            let _ = events.send(TaskEvent::Decided { seq, node, result }).await;
        });
    }

    async fn on_decision(
        &mut self,
        seq: u64,
        node: String,
        result: switchboard_workflow::Result<Decision>,
    ) {
        let (workflow, state) = match &self.graph {
            Some((wf, state)) if seq == self.decision_seq && state.current_node_id == node => {
                (Arc::clone(wf), state.clone())
            }
            _ => {
                debug!(session = %self.key, node = %node, "Discarding stale decision");
                return;
            }
        };

        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                warn!(session = %self.key, node = %node, "Decision failed: {}", e);
                let err: Error = e.into();
                self.send_agent(Envelope::error(err.code(), err.to_string())).await;
                return;
            }
        };

        match workflow.transition(&state, &decision.target) {
            Ok(next) => {
                let decide = workflow.is_decision_node(&next);
                self.graph = Some((Arc::clone(&workflow), next));
                self.decision_seq += 1;
                self.publish();
                self.send_agent(Envelope::Decision {
                    node: decision.node,
                    edge: decision.edge,
                    target: decision.target,
                    confidence: decision.confidence,
                    reasoning: decision.reasoning,
                    fallback: decision.fallback,
                })
                .await;
                if decide {
                    self.spawn_decision(workflow);
                }
            }
            Err(e) => {
                let err: Error = e.into();
                self.send_agent(Envelope::error(err.code(), err.to_string())).await;
            }
        }
    }

    // -- plumbing ------------------------------------------------------------

    fn remember(&mut self, line: TranscriptLine) {
        self.transcript.push_back(line);
        while self.transcript.len() > self.router.config.context_window.max(1) {
            self.transcript.pop_front();
        }
    }

    async fn send_client(&self, frame: impl Into<Frame>) {
        if self.client_tx.send(frame.into()).await.is_err() {
            debug!(session = %self.key, "Client channel closed");
        }
    }

    async fn send_agent(&self, frame: impl Into<Frame>) {
        if !self.agent_alive || self.agent_tx.send(frame.into()).await.is_err() {
            debug!(session = %self.key, agent = %self.agent, "Agent channel closed, frame dropped");
        }
    }

    fn phase(&self) -> SessionPhase {
        if self.closed {
            SessionPhase::Closed
        } else if self.pending.is_some() {
            SessionPhase::HandingOff
        } else if self.client_gone {
            SessionPhase::Draining
        } else {
            SessionPhase::Bound
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(SessionSnapshot {
            session: self.key.clone(),
            phase: self.phase(),
            agent: Some(self.agent.clone()),
            handing_off_to: self.pending.clone(),
            graph: self.graph.as_ref().map(|(_, s)| s.clone()),
            handoffs: self.handoffs,
        });
    }

    fn teardown(mut self) {
        self.router.sessions.remove(&self.key);
        self.router.memory.delete(&self.key);
        self.router.guard.forget(&self.key);
        self.closed = true;
        self.publish();
        info!(
            session = %self.key,
            agent = %self.agent,
            handoffs = self.handoffs,
            "Session closed"
        );
    }
}
