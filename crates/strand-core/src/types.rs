use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StrandError};

/// Terminal marker used by compiled graphs and routers.
pub const END: &str = "END";

/// Terminal marker accepted from transition targets.
pub const END_ALIAS: &str = "__END__";

/// Whether `node_id` names the end of a run.
pub fn is_terminal(node_id: &str) -> bool {
    node_id == END || node_id == END_ALIAS
}

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    /// Validate a caller-supplied id for a top-level run. `/` and `#` are
    /// reserved for subgraph run ids.
    pub fn parse(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(StrandError::config("execution id must not be empty"));
        }
        if s.contains(['/', '#']) {
            return Err(StrandError::config(format!(
                "execution id '{}' must not contain '/' or '#'",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic id for a subgraph run spawned from `node_id` when the
    /// parent had applied `seq` events.
    pub fn child(&self, node_id: &str, seq: u64) -> Self {
        Self(format!("{}/{}#{}", self.0, node_id, seq))
    }

    pub fn is_child(&self) -> bool {
        self.0.contains('/')
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-run configuration handed to every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }
}

/// Lifecycle of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "node", rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running(String),
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running(node) => write!(f, "running({})", node),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Events published on the [`EventBus`](crate::event::EventBus) while runs execute.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        execution_id: ExecutionId,
    },
    RunRecovered {
        execution_id: ExecutionId,
        replayed: usize,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: String,
    },
    NodeProgress {
        execution_id: ExecutionId,
        node_id: String,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: String,
        elapsed_ms: u64,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: String,
        error: String,
    },
    ParallelDispatched {
        execution_id: ExecutionId,
        node_id: String,
        branches: Vec<String>,
    },
    SubgraphStarted {
        execution_id: ExecutionId,
        node_id: String,
        child_id: ExecutionId,
    },
    RunCompleted {
        execution_id: ExecutionId,
    },
    RunFailed {
        execution_id: ExecutionId,
        error: String,
    },
    RunCancelled {
        execution_id: ExecutionId,
    },
}

impl EngineEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::RunStarted { execution_id }
            | Self::RunRecovered { execution_id, .. }
            | Self::NodeStarted { execution_id, .. }
            | Self::NodeProgress { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::ParallelDispatched { execution_id, .. }
            | Self::SubgraphStarted { execution_id, .. }
            | Self::RunCompleted { execution_id }
            | Self::RunFailed { execution_id, .. }
            | Self::RunCancelled { execution_id } => execution_id,
        }
    }

    /// Whether this event ends the run it belongs to.
    pub fn is_run_end(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_markers() {
        assert!(is_terminal("END"));
        assert!(is_terminal("__END__"));
        assert!(!is_terminal("end"));
    }

    #[test]
    fn test_parse_rejects_reserved_characters() {
        assert_eq!(ExecutionId::parse("nightly-42").unwrap().as_str(), "nightly-42");
        assert!(ExecutionId::parse("team/nightly").is_err());
        assert!(ExecutionId::parse("nightly#2").is_err());
        assert!(ExecutionId::parse("  ").is_err());
    }

    #[test]
    fn test_child_id_is_deterministic() {
        let parent = ExecutionId::from_string("run-1");
        let a = parent.child("sub", 3);
        let b = parent.child("sub", 3);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "run-1/sub#3");
        assert!(a.is_child());
        assert!(!parent.is_child());
    }

    #[test]
    fn test_run_status_finished() {
        assert!(!RunStatus::Running("a".into()).is_finished());
        assert!(RunStatus::Completed.is_finished());
        assert_eq!(RunStatus::Running("b".into()).to_string(), "running(b)");
    }
}
