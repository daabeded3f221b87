//! Per-agent workflow graphs and LLM-backed decision branching

pub mod definition;
pub mod error;
pub mod evaluator;
pub mod graph;
pub mod library;

pub use definition::{Edge, Node, NodeKind, WorkflowDefinition};
pub use error::{Result, WorkflowError};
pub use evaluator::{Decision, DecisionEvaluator, LlmReasoner, ReasoningService};
pub use graph::{GraphState, Workflow};
pub use library::WorkflowLibrary;
