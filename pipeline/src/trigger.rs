//! Trigger evaluation: which events start a pipeline run.

use serde::{Deserialize, Serialize};

/// The event a run is started for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    /// A push of `git_ref` (`refs/heads/<branch>` or a bare branch name)
    Push { git_ref: String },
    /// A manual invocation
    WorkflowDispatch,
    /// Any other event (pull request, schedule, tag, ...)
    Other { name: String },
}

impl TriggerEvent {
    pub fn push(git_ref: impl Into<String>) -> Self {
        TriggerEvent::Push {
            git_ref: git_ref.into(),
        }
    }

    /// Parse an event name as used on the command line
    pub fn from_name(name: &str, git_ref: Option<String>) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "push" => TriggerEvent::Push {
                git_ref: git_ref.unwrap_or_default(),
            },
            "workflow_dispatch" | "workflow-dispatch" | "manual" => TriggerEvent::WorkflowDispatch,
            other => TriggerEvent::Other {
                name: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerEvent::Push { git_ref } => write!(f, "push ({})", git_ref),
            TriggerEvent::WorkflowDispatch => write!(f, "workflow_dispatch"),
            TriggerEvent::Other { name } => write!(f, "{}", name),
        }
    }
}

/// Branch name for a ref. Tags and other namespaces yield `None`.
pub fn branch_from_ref(git_ref: &str) -> Option<&str> {
    let git_ref = git_ref.trim();
    if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        return Some(branch).filter(|b| !b.is_empty());
    }
    if git_ref.is_empty() || git_ref.starts_with("refs/") {
        return None;
    }
    Some(git_ref)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Branches whose pushes start a run
    pub push_branches: Vec<String>,
    /// Whether manual invocation is allowed
    pub workflow_dispatch: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            push_branches: vec!["main".to_string()],
            workflow_dispatch: true,
        }
    }
}

impl TriggerConfig {
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match event {
            TriggerEvent::Push { git_ref } => branch_from_ref(git_ref)
                .is_some_and(|branch| self.push_branches.iter().any(|b| b == branch)),
            TriggerEvent::WorkflowDispatch => self.workflow_dispatch,
            TriggerEvent::Other { .. } => false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.push_branches.is_empty() && !self.workflow_dispatch {
            return Err("At least one trigger must be enabled".to_string());
        }
        if self.push_branches.iter().any(|b| b.trim().is_empty()) {
            return Err("Push branch names cannot be empty".to_string());
        }
        Ok(())
    }
}
