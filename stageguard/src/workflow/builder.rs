//! Workflow definitions and the validating builder.

use std::collections::HashMap;

use super::StageDefinition;
use crate::errors::DefinitionError;

/// An immutable, validated stage graph.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    name: String,
    entry: String,
    stages: HashMap<String, StageDefinition>,
    stage_order: Vec<String>,
}

impl WorkflowDefinition {
    /// The workflow name. Checkpoints record it so a run is never resumed
    /// against the wrong workflow.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entry stage.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.get(id)
    }

    /// Returns true if the stage exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.stages.contains_key(id)
    }

    /// Stage ids in insertion order.
    #[must_use]
    pub fn stage_ids(&self) -> &[String] {
        &self.stage_order
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a built workflow.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Builder for creating validated workflows.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    name: String,
    entry: Option<String>,
    stages: Vec<StageDefinition>,
}

impl WorkflowBuilder {
    /// Creates a new workflow builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: None,
            stages: Vec::new(),
        }
    }

    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Designates the entry stage. Defaults to the first stage added.
    #[must_use]
    pub fn entry(mut self, stage: impl Into<String>) -> Self {
        self.entry = Some(stage.into());
        self
    }

    /// Validates and builds the workflow.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty workflow, duplicate stage ids, an
    /// unknown entry stage, or a static route to an undefined stage.
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        if self.stages.is_empty() {
            return Err(DefinitionError::Empty {
                workflow: self.name,
            });
        }

        let mut stages = HashMap::with_capacity(self.stages.len());
        let mut stage_order = Vec::with_capacity(self.stages.len());
        for stage in self.stages {
            let id = stage.id().to_string();
            if stages.contains_key(&id) {
                return Err(DefinitionError::DuplicateStage { stage: id });
            }
            stage_order.push(id.clone());
            stages.insert(id, stage);
        }

        let entry = match self.entry {
            Some(entry) => entry,
            None => stage_order.first().cloned().ok_or_else(|| DefinitionError::MissingEntry {
                workflow: self.name.clone(),
            })?,
        };
        if !stages.contains_key(&entry) {
            return Err(DefinitionError::UnknownEntry { stage: entry });
        }

        for id in &stage_order {
            let Some(stage) = stages.get(id) else { continue };
            if let Some(target) = stage.routing_policy().static_target() {
                if !stages.contains_key(target) {
                    return Err(DefinitionError::UnknownTarget {
                        from: id.clone(),
                        to: target.to_string(),
                    });
                }
            }
        }

        Ok(WorkflowDefinition {
            name: self.name,
            entry,
            stages,
            stage_order,
        })
    }
}
