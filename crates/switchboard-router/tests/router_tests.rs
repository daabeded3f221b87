//! Tests for switchboard-router: session lifecycle, handoffs, guard, graph integration

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard_core::*;
use switchboard_router::*;
use switchboard_workflow::{
    DecisionEvaluator, Edge, Node, NodeKind, ReasoningService, Workflow, WorkflowDefinition,
    WorkflowLibrary,
};
use tokio::sync::{mpsc, Notify};

// ===========================================================================
// In-memory agents
// ===========================================================================

struct AgentSide {
    agent: AgentId,
    init: Envelope,
    to_agent: mpsc::Receiver<Frame>,
    from_agent: mpsc::Sender<Frame>,
}

impl AgentSide {
    async fn say(&self, envelope: Envelope) {
        self.from_agent.send(envelope.into()).await.unwrap();
    }

    async fn next(&mut self) -> Envelope {
        next_envelope(&mut self.to_agent).await
    }
}

#[derive(Default)]
struct MockConnector {
    sides: Mutex<Option<mpsc::UnboundedSender<AgentSide>>>,
    refuse: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MockConnector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<AgentSide>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self::default();
        *connector.sides.lock().unwrap() = Some(tx);
        (Arc::new(connector), rx)
    }

    fn refuse(&self, agent: &str) {
        self.refuse.lock().unwrap().insert(agent.to_string());
    }

    /// Hold connections to `agent` until the returned notify fires.
    fn gate(&self, agent: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(agent.to_string(), notify.clone());
        notify
    }
}

#[async_trait::async_trait]
impl AgentConnector for MockConnector {
    async fn connect(&self, agent: &AgentRecord, init: Envelope, _timeout: Duration) -> Result<AgentLink> {
        if self.refuse.lock().unwrap().contains(agent.id.as_str()) {
            return Err(Error::routing(agent.id.as_str(), "connection refused"));
        }
        let gate = self.gates.lock().unwrap().get(agent.id.as_str()).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let (to_tx, to_rx) = mpsc::channel(64);
        let (from_tx, from_rx) = mpsc::channel(64);
        let side = AgentSide {
            agent: agent.id.clone(),
            init,
            to_agent: to_rx,
            from_agent: from_tx,
        };
        if let Some(sides) = self.sides.lock().unwrap().as_ref() {
            let _ = sides.send(side);
        }
        Ok(AgentLink { tx: to_tx, rx: from_rx })
    }
}

// ===========================================================================
// Harness
// ===========================================================================

const WAIT: Duration = Duration::from_secs(2);

async fn next_envelope(rx: &mut mpsc::Receiver<Frame>) -> Envelope {
    loop {
        let frame = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        if let Frame::Envelope(e) = frame {
            return e;
        }
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("channel closed")
}

async fn next_side(rx: &mut mpsc::UnboundedReceiver<AgentSide>) -> AgentSide {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for agent connection")
        .expect("connector dropped")
}

fn registry_with(agents: &[&str]) -> Arc<AgentRegistry> {
    let registry = Arc::new(AgentRegistry::new(Duration::from_secs(45)));
    for (i, id) in agents.iter().enumerate() {
        registry
            .register(*id, &format!("127.0.0.1:{}", 9100 + i), [*id])
            .unwrap();
    }
    registry
}

fn triage_workflow() -> Workflow {
    Workflow::load(
        WorkflowDefinition::new("triage")
            .node(Node::new("greet", NodeKind::Action))
            .node(Node::new("classify", NodeKind::Decision))
            .node(Node::new("to_idv", NodeKind::Terminal))
            .node(Node::new("clarify", NodeKind::Action))
            .edge(Edge::new("greet", "classify"))
            .edge(Edge::new("classify", "to_idv").when("account servicing"))
            .edge(Edge::new("classify", "clarify").when("unclear").as_default())
            .edge(Edge::new("clarify", "classify")),
    )
    .unwrap()
}

struct Fixed(&'static str);

#[async_trait::async_trait]
impl ReasoningService for Fixed {
    async fn reason(&self, _prompt: &str) -> switchboard_workflow::Result<String> {
        Ok(self.0.to_string())
    }
}

struct Harness {
    router: Arc<SessionRouter>,
    connector: Arc<MockConnector>,
    sides: mpsc::UnboundedReceiver<AgentSide>,
}

fn harness(config: SwitchboardConfig, agents: &[&str]) -> Harness {
    let (connector, sides) = MockConnector::new();
    let mut library = WorkflowLibrary::new();
    library.insert(triage_workflow()).unwrap();
    let router = SessionRouter::new(
        &config,
        registry_with(agents),
        Arc::new(SessionMemoryStore::new()),
        connector.clone(),
    )
    .with_workflows(Arc::new(library))
    .with_evaluator(Arc::new(DecisionEvaluator::new(
        Arc::new(Fixed("account servicing")),
        config.router.context_window,
    )));
    Harness {
        router: Arc::new(router),
        connector,
        sides,
    }
}

fn default_harness() -> Harness {
    harness(SwitchboardConfig::default(), &["triage", "idv", "banking"])
}

struct Client {
    handle: SessionHandle,
    rx: mpsc::Receiver<Frame>,
}

async fn attach_bound(h: &mut Harness, session: &str) -> (Client, AgentSide) {
    let (tx, mut rx) = mpsc::channel(64);
    let handle = h
        .router
        .attach_client(Some(SessionKey::new(session)), tx)
        .await
        .unwrap();
    let ready = next_envelope(&mut rx).await;
    assert!(matches!(ready, Envelope::SessionReady { .. }));
    let side = next_side(&mut h.sides).await;
    (Client { handle, rx }, side)
}

fn transfer(id: &str, target: &str, reason: &str) -> Envelope {
    Envelope::tool_result(id, format!("transfer_to_{}", target), json!({ "reason": reason }))
}

// ===========================================================================
// Attach
// ===========================================================================

#[tokio::test]
async fn attach_binds_entry_agent_with_memory_and_entry_node() {
    let mut h = default_harness();
    let (client, side) = attach_bound(&mut h, "s-attach").await;

    assert_eq!(side.agent, AgentId::new("triage"));
    match &side.init {
        Envelope::SessionInit {
            session_id,
            agent_id,
            memory,
            workflow_node,
            ..
        } => {
            assert_eq!(session_id.as_deref(), Some("s-attach"));
            assert_eq!(agent_id.as_ref(), Some(&AgentId::new("triage")));
            let memory = memory.as_ref().unwrap();
            assert_eq!(memory.last_active_agent_id, Some(AgentId::new("triage")));
            assert_eq!(workflow_node.as_deref(), Some("greet"));
        }
        other => panic!("expected session_init, got {:?}", other),
    }

    let snap = client.handle.snapshot();
    assert_eq!(snap.phase, SessionPhase::Bound);
    assert_eq!(snap.agent, Some(AgentId::new("triage")));
    assert_eq!(snap.graph.unwrap().current_node_id, "greet");
    assert_eq!(h.router.session_count(), 1);
}

#[tokio::test]
async fn attach_without_entry_agent_fails_cleanly() {
    let h = harness(SwitchboardConfig::default(), &["idv"]);
    let (tx, _rx) = mpsc::channel(8);
    let err = h
        .router
        .attach_client(Some(SessionKey::new("s-none")), tx)
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::RoutingError);
    assert_eq!(h.router.session_count(), 0);
    assert!(!h.router.memory().contains(&SessionKey::new("s-none")));
}

#[tokio::test]
async fn attach_rejects_live_session_id() {
    let mut h = default_harness();
    let (_client, _side) = attach_bound(&mut h, "dup").await;
    let (tx, _rx) = mpsc::channel(8);
    let err = h
        .router
        .attach_client(Some(SessionKey::new("dup")), tx)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::SessionExists(_)));
}

#[tokio::test]
async fn attach_generates_session_id() {
    let mut h = default_harness();
    let (tx, _rx) = mpsc::channel(8);
    let handle = h.router.attach_client(None, tx).await.unwrap();
    let _side = next_side(&mut h.sides).await;
    assert_eq!(handle.key().as_str().len(), 36);
}

// ===========================================================================
// Forwarding
// ===========================================================================

#[tokio::test]
async fn frames_pass_through_both_ways() {
    let mut h = default_harness();
    let (mut client, mut side) = attach_bound(&mut h, "s-fwd").await;

    client.handle.send(Envelope::text_input("hello")).await.unwrap();
    assert_eq!(side.next().await, Envelope::text_input("hello"));

    client
        .handle
        .send(Frame::Binary(bytes_of(&[1, 2, 3])))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut side.to_agent).await, Frame::Binary(bytes_of(&[1, 2, 3])));

    side.from_agent
        .send(Frame::Text("not json".into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut client.rx).await, Frame::Text("not json".into()));

    side.say(Envelope::Transcript {
        role: "agent".into(),
        text: "hi there".into(),
    })
    .await;
    assert!(matches!(next_envelope(&mut client.rx).await, Envelope::Transcript { .. }));
}

#[tokio::test]
async fn agent_error_reaches_client_as_generic_notice() {
    let mut h = default_harness();
    let (mut client, side) = attach_bound(&mut h, "s-agent-err").await;

    side.say(Envelope::error(
        ErrorCode::RoutingError,
        "postgres at 10.0.0.5:5432 refused connection",
    ))
    .await;
    assert_eq!(next_envelope(&mut client.rx).await, Envelope::unavailable());

    // The session stays bound.
    assert_eq!(client.handle.snapshot().agent, Some(AgentId::new("triage")));
}

fn bytes_of(b: &[u8]) -> bytes::Bytes {
    bytes::Bytes::copy_from_slice(b)
}

// ===========================================================================
// Handoff
// ===========================================================================

#[tokio::test]
async fn handoff_moves_session_and_carries_memory() {
    let mut h = default_harness();
    let (mut client, mut triage) = attach_bound(&mut h, "s-hand").await;

    triage.say(transfer("t1", "idv", "balance check")).await;

    match next_envelope(&mut client.rx).await {
        Envelope::ToolResult { name, .. } => assert_eq!(name, "transfer_to_idv"),
        other => panic!("expected tool_result first, got {:?}", other),
    }
    let idv = next_side(&mut h.sides).await;
    assert_eq!(idv.agent, AgentId::new("idv"));
    match &idv.init {
        Envelope::SessionInit { memory, .. } => {
            let memory = memory.as_ref().unwrap();
            assert_eq!(memory.user_intent.as_deref(), Some("balance check"));
            assert_eq!(memory.last_active_agent_id, Some(AgentId::new("triage")));
        }
        other => panic!("expected session_init, got {:?}", other),
    }
    match next_envelope(&mut client.rx).await {
        Envelope::HandoffEvent { from, to, reason } => {
            assert_eq!(from, AgentId::new("triage"));
            assert_eq!(to, AgentId::new("idv"));
            assert_eq!(reason.as_deref(), Some("balance check"));
        }
        other => panic!("expected handoff_event, got {:?}", other),
    }

    let snap = client
        .handle
        .wait_until(|s| s.agent == Some(AgentId::new("idv")) && s.phase == SessionPhase::Bound)
        .await;
    assert_eq!(snap.handoffs, 1);
    // idv has no workflow loaded
    assert!(snap.graph.is_none());
    assert!(!h.router.guard().is_handoff_in_flight(client.handle.key()));

    // The old agent's channel is closed
    assert!(tokio::time::timeout(WAIT, triage.to_agent.recv()).await.unwrap().is_none());

    // Client traffic now reaches idv
    let mut idv = idv;
    client.handle.send(Envelope::text_input("1234")).await.unwrap();
    assert_eq!(idv.next().await, Envelope::text_input("1234"));

    let memory = h.router.memory().get(client.handle.key()).await;
    assert_eq!(memory.last_active_agent_id, Some(AgentId::new("idv")));
}

#[tokio::test]
async fn second_handoff_while_in_flight_is_blocked() {
    let mut h = default_harness();
    let gate = h.connector.gate("idv");
    let (mut client, mut triage) = attach_bound(&mut h, "s-race").await;

    triage.say(transfer("t1", "idv", "balance check")).await;
    triage.say(transfer("t2", "idv", "balance check")).await;

    // Both tool results reach the client
    for _ in 0..2 {
        assert!(matches!(next_envelope(&mut client.rx).await, Envelope::ToolResult { .. }));
    }
    match triage.next().await {
        Envelope::Error {
            code, tool_call_id, ..
        } => {
            assert_eq!(code, ErrorCode::Blocked);
            assert_eq!(tool_call_id.as_deref(), Some("t2"));
        }
        other => panic!("expected blocked error, got {:?}", other),
    }
    assert_eq!(client.handle.snapshot().phase, SessionPhase::HandingOff);

    gate.notify_one();
    let _idv = next_side(&mut h.sides).await;
    assert!(matches!(next_envelope(&mut client.rx).await, Envelope::HandoffEvent { .. }));
    let snap = client.handle.wait_until(|s| s.phase == SessionPhase::Bound).await;
    assert_eq!(snap.handoffs, 1);
    assert!(tokio::time::timeout(Duration::from_millis(100), client.rx.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn circuit_breaker_reports_to_agent() {
    let mut config = SwitchboardConfig::default();
    config.guard.threshold = 0;
    let mut h = harness(config, &["triage", "idv"]);
    let (mut client, mut triage) = attach_bound(&mut h, "s-cb").await;

    triage.say(transfer("t1", "idv", "x")).await;
    assert!(matches!(next_envelope(&mut client.rx).await, Envelope::ToolResult { .. }));
    match triage.next().await {
        Envelope::Error { code, message, .. } => {
            assert_eq!(code, ErrorCode::Blocked);
            assert!(message.contains("circuit-breaker"));
        }
        other => panic!("expected blocked error, got {:?}", other),
    }
    assert_eq!(client.handle.snapshot().agent, Some(AgentId::new("triage")));
}

#[tokio::test]
async fn unknown_target_is_routing_error_to_agent() {
    let mut h = harness(SwitchboardConfig::default(), &["triage"]);
    let (mut client, mut triage) = attach_bound(&mut h, "s-missing").await;

    triage.say(transfer("t1", "idv", "balance check")).await;
    assert!(matches!(next_envelope(&mut client.rx).await, Envelope::ToolResult { .. }));
    match triage.next().await {
        Envelope::Error {
            code, tool_call_id, ..
        } => {
            assert_eq!(code, ErrorCode::RoutingError);
            assert_eq!(tool_call_id.as_deref(), Some("t1"));
        }
        other => panic!("expected routing error, got {:?}", other),
    }
    let snap = client.handle.snapshot();
    assert_eq!(snap.phase, SessionPhase::Bound);
    assert_eq!(snap.agent, Some(AgentId::new("triage")));
    assert!(!h.router.guard().is_handoff_in_flight(client.handle.key()));
    // Intent was still recorded
    let memory = h.router.memory().get(client.handle.key()).await;
    assert_eq!(memory.user_intent.as_deref(), Some("balance check"));
}

#[tokio::test]
async fn refused_connection_keeps_current_owner() {
    let mut h = default_harness();
    h.connector.refuse("idv");
    let (mut client, mut triage) = attach_bound(&mut h, "s-refused").await;

    triage.say(transfer("t1", "idv", "balance check")).await;
    assert!(matches!(next_envelope(&mut client.rx).await, Envelope::ToolResult { .. }));
    match triage.next().await {
        Envelope::Error { code, message, .. } => {
            assert_eq!(code, ErrorCode::RoutingError);
            assert!(message.contains("connection refused"));
        }
        other => panic!("expected routing error, got {:?}", other),
    }
    let snap = client.handle.wait_until(|s| s.phase == SessionPhase::Bound).await;
    assert_eq!(snap.agent, Some(AgentId::new("triage")));
    assert_eq!(snap.handoffs, 0);
}

#[tokio::test]
async fn handoff_to_self_is_rejected() {
    let mut h = default_harness();
    let (mut client, mut triage) = attach_bound(&mut h, "s-self").await;
    triage.say(transfer("t1", "triage", "loop")).await;
    assert!(matches!(next_envelope(&mut client.rx).await, Envelope::ToolResult { .. }));
    assert!(matches!(
        triage.next().await,
        Envelope::Error { code: ErrorCode::RoutingError, .. }
    ));
}

#[tokio::test]
async fn errored_tool_result_is_not_a_handoff() {
    let mut h = default_harness();
    let (mut client, triage) = attach_bound(&mut h, "s-err").await;
    triage
        .say(Envelope::ToolResult {
            id: "t1".into(),
            name: "transfer_to_idv".into(),
            content: json!({"reason": "x"}),
            is_error: true,
        })
        .await;
    assert!(matches!(next_envelope(&mut client.rx).await, Envelope::ToolResult { .. }));
    assert!(tokio::time::timeout(Duration::from_millis(100), h.sides.recv())
        .await
        .is_err());
}

// ===========================================================================
// Workflow graph
// ===========================================================================

#[tokio::test]
async fn steps_drive_graph_and_decisions() {
    let mut h = default_harness();
    let (client, mut triage) = attach_bound(&mut h, "s-graph").await;

    triage.say(Envelope::Step { node: "classify".into() }).await;
    match triage.next().await {
        Envelope::Decision {
            node,
            edge,
            target,
            fallback,
            ..
        } => {
            assert_eq!(node, "classify");
            assert_eq!(edge, "account servicing");
            assert_eq!(target, "to_idv");
            assert!(!fallback);
        }
        other => panic!("expected decision, got {:?}", other),
    }
    let snap = client
        .handle
        .wait_until(|s| s.graph.as_ref().is_some_and(|g| g.current_node_id == "to_idv"))
        .await;
    assert_eq!(
        snap.graph.unwrap().history,
        vec!["greet", "classify", "to_idv"]
    );
}

#[tokio::test]
async fn invalid_step_is_reported_to_agent() {
    let mut h = default_harness();
    let (client, mut triage) = attach_bound(&mut h, "s-badstep").await;

    triage.say(Envelope::Step { node: "to_idv".into() }).await;
    match triage.next().await {
        Envelope::Error { code, message, .. } => {
            assert_eq!(code, ErrorCode::InvalidTransition);
            assert!(message.contains("greet"));
        }
        other => panic!("expected invalid_transition, got {:?}", other),
    }
    assert_eq!(client.handle.snapshot().graph.unwrap().current_node_id, "greet");
}

// ===========================================================================
// Agent loss and detach
// ===========================================================================

#[tokio::test]
async fn lost_agent_falls_back_to_entry() {
    let mut h = default_harness();
    let (mut client, triage) = attach_bound(&mut h, "s-fallback").await;
    triage.say(transfer("t1", "idv", "balance check")).await;
    let idv = next_side(&mut h.sides).await;
    assert!(matches!(next_envelope(&mut client.rx).await, Envelope::ToolResult { .. }));
    assert!(matches!(next_envelope(&mut client.rx).await, Envelope::HandoffEvent { .. }));

    drop(idv);
    let back = next_side(&mut h.sides).await;
    assert_eq!(back.agent, AgentId::new("triage"));
    match next_envelope(&mut client.rx).await {
        Envelope::HandoffEvent { from, to, .. } => {
            assert_eq!(from, AgentId::new("idv"));
            assert_eq!(to, AgentId::new("triage"));
        }
        other => panic!("expected fallback handoff_event, got {:?}", other),
    }
    // Original intent survives the fallback
    match &back.init {
        Envelope::SessionInit { memory, .. } => {
            assert_eq!(
                memory.as_ref().unwrap().user_intent.as_deref(),
                Some("balance check")
            );
        }
        other => panic!("expected session_init, got {:?}", other),
    }
}

#[tokio::test]
async fn lost_entry_agent_closes_session() {
    let mut h = default_harness();
    let (mut client, triage) = attach_bound(&mut h, "s-lost").await;
    drop(triage);
    match next_envelope(&mut client.rx).await {
        Envelope::Error { code, message, .. } => {
            assert_eq!(code, ErrorCode::Unavailable);
            assert_eq!(message, CLIENT_RETRY_MESSAGE);
        }
        other => panic!("expected unavailable, got {:?}", other),
    }
    let snap = client.handle.closed().await;
    assert_eq!(snap.phase, SessionPhase::Closed);
    assert_eq!(h.router.session_count(), 0);
}

#[tokio::test]
async fn detach_keeps_agent_for_grace_period() {
    let mut config = SwitchboardConfig::default();
    config.router.detach_grace_ms = 150;
    let mut h = harness(config, &["triage"]);
    let (client, mut triage) = attach_bound(&mut h, "s-grace").await;
    h.router
        .memory()
        .merge(client.handle.key(), MemoryUpdate::intent("balance"))
        .await;

    client.handle.detach().await;
    let snap = client.handle.wait_until(|s| s.phase == SessionPhase::Draining).await;
    assert_eq!(snap.agent, Some(AgentId::new("triage")));

    // Shielded from new client input while draining
    let _ = client.handle.send(Envelope::text_input("late")).await;
    let closed = client.handle.closed().await;
    assert_eq!(closed.phase, SessionPhase::Closed);

    // Agent connection is torn down, and nothing from the client got through
    loop {
        match tokio::time::timeout(WAIT, triage.to_agent.recv()).await.unwrap() {
            Some(Frame::Envelope(Envelope::TextInput { text })) => panic!("unexpected input {}", text),
            Some(_) => continue,
            None => break,
        }
    }
    assert!(!h.router.memory().contains(client.handle.key()));
}

#[tokio::test]
async fn close_skips_grace_period() {
    let mut config = SwitchboardConfig::default();
    config.router.detach_grace_ms = 60_000;
    let mut h = harness(config, &["triage"]);
    let (client, _triage) = attach_bound(&mut h, "s-close").await;

    client.handle.detach().await;
    client.handle.close().await;
    let snap = tokio::time::timeout(WAIT, client.handle.closed()).await.unwrap();
    assert_eq!(snap.phase, SessionPhase::Closed);
}

#[tokio::test]
async fn close_waits_for_in_flight_handoff() {
    let mut h = default_harness();
    let gate = h.connector.gate("idv");
    let (mut client, triage) = attach_bound(&mut h, "s-defer").await;

    triage.say(transfer("t1", "idv", "balance check")).await;
    assert!(matches!(next_envelope(&mut client.rx).await, Envelope::ToolResult { .. }));
    client.handle.wait_until(|s| s.phase == SessionPhase::HandingOff).await;

    client.handle.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.handle.snapshot().phase, SessionPhase::HandingOff);

    gate.notify_one();
    let snap = client.handle.closed().await;
    assert_eq!(snap.handoffs, 1);
    assert!(!h.router.guard().is_handoff_in_flight(client.handle.key()));
}

#[tokio::test]
async fn list_sessions_reports_live_sessions() {
    let mut h = default_harness();
    let (_a, _sa) = attach_bound(&mut h, "a").await;
    let (_b, _sb) = attach_bound(&mut h, "b").await;
    let sessions = h.router.list_sessions();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].session, SessionKey::new("a"));
    assert!(h.router.close_session(&SessionKey::new("a")));
    assert!(!h.router.close_session(&SessionKey::new("zzz")));
}
