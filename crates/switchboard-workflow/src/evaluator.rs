//! Decision evaluator: ask an external reasoning service which edge to take.
//!
//! The evaluator never invents a transition. The reply is matched against the
//! literal edge labels of the node; when nothing matches, the node's declared
//! default edge is used, and without one the evaluation fails.

use crate::definition::{Edge, Node};
use crate::error::{Result, WorkflowError};
use crate::graph::Workflow;
use regex::Regex;
use std::sync::LazyLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use switchboard_core::TranscriptLine;
use switchboard_llm::{LlmProvider, LlmRequest};
use tracing::{debug, warn};

/// Longest transcript line kept in a prompt, in characters.
const MAX_LINE_CHARS: usize = 400;

const SYSTEM_PROMPT: &str = "You choose the next step of a scripted customer conversation. \
Answer with one of the listed options only.";

/// Opaque `(prompt) -> text` reasoning call.
#[async_trait::async_trait]
pub trait ReasoningService: Send + Sync {
    async fn reason(&self, prompt: &str) -> Result<String>;
}

/// Reasoning backed by an [`LlmProvider`].
pub struct LlmReasoner {
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_tokens: u32,
}

impl LlmReasoner {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens,
        }
    }
}

#[async_trait::async_trait]
impl ReasoningService for LlmReasoner {
    async fn reason(&self, prompt: &str) -> Result<String> {
        let request = LlmRequest::prompt(&self.model, prompt)
            .with_system(SYSTEM_PROMPT)
            .with_max_tokens(self.max_tokens);
        self.provider
            .complete_text(request)
            .await
            .map_err(|e| WorkflowError::Reasoning(format!("{}: {}", self.provider.name(), e)))
    }
}

/// The outcome of one evaluation. Feed `target` into [`Workflow::transition`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub node: String,
    /// Label of the chosen edge.
    pub edge: String,
    pub target: String,
    pub confidence: f32,
    pub reasoning: String,
    /// True when the default edge was taken because nothing matched.
    pub fallback: bool,
}

#[derive(Deserialize)]
struct StructuredReply {
    edge: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    reasoning: String,
}

pub struct DecisionEvaluator {
    service: Arc<dyn ReasoningService>,
    context_window: usize,
}

impl DecisionEvaluator {
    pub fn new(service: Arc<dyn ReasoningService>, context_window: usize) -> Self {
        Self {
            service,
            context_window,
        }
    }

    /// Evaluate the decision at `node_id` of `workflow`.
    pub async fn evaluate_at(
        &self,
        workflow: &Workflow,
        node_id: &str,
        context: &[TranscriptLine],
    ) -> Result<Decision> {
        let node = workflow
            .node(node_id)
            .ok_or_else(|| WorkflowError::UnknownNode(node_id.to_string()))?;
        self.evaluate(node, workflow.outgoing_edges(node_id), context).await
    }

    pub async fn evaluate(
        &self,
        node: &Node,
        edges: &[Edge],
        context: &[TranscriptLine],
    ) -> Result<Decision> {
        if edges.is_empty() {
            return Err(WorkflowError::NoDefaultEdge(node.id.clone()));
        }
        let prompt = self.build_prompt(node, edges, context);
        let reply = self.service.reason(&prompt).await?;
        debug!(node = %node.id, reply = %reply.trim(), "Reasoning reply");

        let (answer, stated_confidence, reasoning) = match parse_structured(&reply) {
            Some(s) => (s.edge, s.confidence, s.reasoning),
            None => (reply.trim().to_string(), None, String::new()),
        };

        if let Some((edge, exact)) = match_edge(&answer, edges) {
            let confidence = stated_confidence
                .unwrap_or(if exact { 1.0 } else { 0.5 })
                .clamp(0.0, 1.0);
            return Ok(Decision {
                node: node.id.clone(),
                edge: edge.label().to_string(),
                target: edge.to.clone(),
                confidence,
                reasoning,
                fallback: false,
            });
        }

        match edges.iter().find(|e| e.default) {
            Some(edge) => {
                warn!(node = %node.id, answer = %answer, "No edge matched, taking default");
                Ok(Decision {
                    node: node.id.clone(),
                    edge: edge.label().to_string(),
                    target: edge.to.clone(),
                    confidence: 0.0,
                    reasoning,
                    fallback: true,
                })
            }
            None => Err(WorkflowError::NoDefaultEdge(node.id.clone())),
        }
    }

    /// Bounded prompt: instruction, labelled options, and the recent transcript.
    pub fn build_prompt(&self, node: &Node, edges: &[Edge], context: &[TranscriptLine]) -> String {
        let mut prompt = format!("Current step: {}\n", node.display_name());
        if !node.instruction.is_empty() {
            prompt.push_str(&format!("Instruction: {}\n", node.instruction));
        }
        prompt.push_str("\nOptions:\n");
        for edge in edges {
            prompt.push_str(&format!("- {} (goes to {})\n", edge.label(), edge.to));
        }

        let start = context.len().saturating_sub(self.context_window);
        let recent = &context[start..];
        if !recent.is_empty() {
            prompt.push_str("\nRecent conversation:\n");
            for line in recent {
                let text: String = line.text.chars().take(MAX_LINE_CHARS).collect();
                prompt.push_str(&format!("{}: {}\n", line.role, text));
            }
        }

        prompt.push_str(
            "\nReply with JSON: {\"edge\": \"<option>\", \"confidence\": <0..1>, \"reasoning\": \"<short>\"}",
        );
        prompt
    }
}

/// Pull a `{edge, confidence, reasoning}` object out of a reply, tolerating surrounding prose.
fn parse_structured(reply: &str) -> Option<StructuredReply> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

/// Exact (case-insensitive) label match first, then a unique whole-word match.
/// The bool is true for an exact match.
fn match_edge<'a>(answer: &str, edges: &'a [Edge]) -> Option<(&'a Edge, bool)> {
    let normalized = answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '`')
        .to_lowercase();
    if normalized.is_empty() {
        return None;
    }

    if let Some(edge) = edges.iter().find(|e| e.label().to_lowercase() == normalized) {
        return Some((edge, true));
    }

    let answer_words = words(&normalized);
    let hits: Vec<&Edge> = edges
        .iter()
        .filter(|e| contains_phrase(&answer_words, &words(e.label())))
        .collect();

    // "not verified" also contains "verified"; keep only the most specific labels
    let specific: Vec<&Edge> = hits
        .iter()
        .copied()
        .filter(|e| {
            let label = e.label().to_lowercase();
            !hits.iter().any(|other| {
                let other_label = other.label().to_lowercase();
                other_label != label && other_label.contains(&label)
            })
        })
        .collect();

    let mut targets: Vec<&str> = specific.iter().map(|e| e.label()).collect();
    targets.dedup();
    match targets.as_slice() {
        [_] => specific.first().map(|e| (*e, false)),
        _ => None,
    }
}

static WORD: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[\p{L}\p{N}_]+").ok());

fn words(text: &str) -> Vec<String> {
    match WORD.as_ref() {
        Some(re) => re.find_iter(text).map(|m| m.as_str().to_lowercase()).collect(),
        None => Vec::new(),
    }
}

/// True when `phrase` occurs as a run of whole words in `haystack`.
/// A label with no word characters never matches here.
fn contains_phrase(haystack: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty() && haystack.windows(phrase.len()).any(|w| w == phrase)
}
