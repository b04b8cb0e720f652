//! Static per-workflow configuration.
//!
//! A [`WorkflowDefinition`] declares the branches an instance must observe
//! before it completes, the precedence of their fields during the merge, and
//! the topic the merged event is published to. Definitions are loaded once at
//! startup and never mutated at runtime.

use crate::correlation::{BranchTag, WorkflowType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors detected while validating a workflow definition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowDefinitionError {
    /// A workflow must wait for at least one branch.
    #[error("Workflow '{0}' declares no branches")]
    NoBranches(WorkflowType),

    /// Each branch may appear only once in the priority order.
    #[error("Workflow '{workflow_type}' lists branch '{branch_tag}' more than once")]
    DuplicateBranch {
        /// The offending workflow.
        workflow_type: WorkflowType,
        /// The repeated branch tag.
        branch_tag: BranchTag,
    },

    /// The merged event needs somewhere to go.
    #[error("Workflow '{0}' has an empty output topic")]
    EmptyOutputTopic(WorkflowType),

    /// Blank workflow types and branch tags are rejected.
    #[error("Workflow definition contains a blank identifier")]
    BlankIdentifier,
}

/// Configuration of one fan-in workflow shape.
///
/// `branches` doubles as the expected-branch set and the merge priority
/// order: the first branch listed wins field collisions.
///
/// # Example
///
/// ```
/// use fanin_core::workflow::WorkflowDefinition;
/// use fanin_core::correlation::BranchTag;
///
/// let definition = WorkflowDefinition::new(
///     "order-processing",
///     ["inventory.checked", "order.validated"],
///     "order.ready",
/// )
/// .unwrap();
///
/// assert!(definition.declares(&BranchTag::new("order.validated")));
/// assert_eq!(definition.expected_branches().len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    workflow_type: WorkflowType,
    branches: Vec<BranchTag>,
    output_topic: String,
}

impl WorkflowDefinition {
    /// Build and validate a definition.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowDefinitionError`] if the definition has no branches,
    /// repeats a branch, has a blank identifier, or has an empty output topic.
    pub fn new<I, B>(
        workflow_type: impl Into<WorkflowType>,
        branches: I,
        output_topic: impl Into<String>,
    ) -> Result<Self, WorkflowDefinitionError>
    where
        I: IntoIterator<Item = B>,
        B: Into<BranchTag>,
    {
        let definition = Self {
            workflow_type: workflow_type.into(),
            branches: branches.into_iter().map(Into::into).collect(),
            output_topic: output_topic.into(),
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Check the invariants `new` enforces.
    ///
    /// Definitions deserialized from configuration must be validated explicitly.
    ///
    /// # Errors
    ///
    /// See [`WorkflowDefinition::new`].
    pub fn validate(&self) -> Result<(), WorkflowDefinitionError> {
        if self.workflow_type.as_str().trim().is_empty() {
            return Err(WorkflowDefinitionError::BlankIdentifier);
        }
        if self.branches.is_empty() {
            return Err(WorkflowDefinitionError::NoBranches(self.workflow_type.clone()));
        }
        let mut seen = BTreeSet::new();
        for tag in &self.branches {
            if tag.as_str().trim().is_empty() {
                return Err(WorkflowDefinitionError::BlankIdentifier);
            }
            if !seen.insert(tag) {
                return Err(WorkflowDefinitionError::DuplicateBranch {
                    workflow_type: self.workflow_type.clone(),
                    branch_tag: tag.clone(),
                });
            }
        }
        if self.output_topic.trim().is_empty() {
            return Err(WorkflowDefinitionError::EmptyOutputTopic(
                self.workflow_type.clone(),
            ));
        }
        Ok(())
    }

    /// Workflow type name.
    #[must_use]
    pub const fn workflow_type(&self) -> &WorkflowType {
        &self.workflow_type
    }

    /// Branches in merge priority order (highest precedence first).
    #[must_use]
    pub fn priority(&self) -> &[BranchTag] {
        &self.branches
    }

    /// The set of branches an instance must observe before completing.
    #[must_use]
    pub fn expected_branches(&self) -> BTreeSet<BranchTag> {
        self.branches.iter().cloned().collect()
    }

    /// Whether `tag` is one of this workflow's branches.
    #[must_use]
    pub fn declares(&self, tag: &BranchTag) -> bool {
        self.branches.contains(tag)
    }

    /// Topic the merged completion event is published to.
    #[must_use]
    pub fn output_topic(&self) -> &str {
        &self.output_topic
    }
}
