//! Workflows indexed by agent id

use crate::definition::WorkflowDefinition;
use crate::error::{Result, WorkflowError};
use crate::graph::Workflow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
pub struct WorkflowLibrary {
    by_agent: HashMap<String, Arc<Workflow>>,
}

impl WorkflowLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` file in `dir`. A single invalid file fails the whole load.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut library = Self::new();
        for path in paths {
            let def = WorkflowDefinition::from_path(&path).map_err(|e| {
                WorkflowError::invalid(format!("{}: {}", path.display(), e))
            })?;
            let workflow = Workflow::load(def)
                .map_err(|e| WorkflowError::invalid(format!("{}: {}", path.display(), e)))?;
            info!(
                "Loaded workflow for {} ({} nodes) from {}",
                workflow.agent_id(),
                workflow.nodes().len(),
                path.display()
            );
            library.insert(workflow)?;
        }
        Ok(library)
    }

    pub fn insert(&mut self, workflow: Workflow) -> Result<()> {
        let agent = workflow.agent_id().to_string();
        if self.by_agent.contains_key(&agent) {
            return Err(WorkflowError::invalid(format!(
                "more than one workflow for agent {}",
                agent
            )));
        }
        self.by_agent.insert(agent, Arc::new(workflow));
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<Workflow>> {
        self.by_agent.get(agent_id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.by_agent.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_agent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_agent.is_empty()
    }
}
