//! Persisted event-log records.
//!
//! A run is stored as an append-only sequence of [`EventRecord`]s. Replaying
//! them in `seq` order through the state machine's apply function rebuilds the
//! run's progress without re-executing completed steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StrandError;
use crate::state::GlobalState;
use crate::types::{ExecutionId, RunConfig};

/// Where a run delivers its terminal signal.
///
/// Persisted with every event so a recovered run can resume delivering to the
/// original caller, or to the parent run that spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ReplyTo {
    /// The external caller that started the run.
    Caller { execution_id: ExecutionId },
    /// A parent run waiting on this subgraph at `node_id`.
    Parent {
        execution_id: ExecutionId,
        node_id: String,
    },
}

impl ReplyTo {
    pub fn caller(execution_id: &ExecutionId) -> Self {
        Self::Caller {
            execution_id: execution_id.clone(),
        }
    }

    pub fn parent(execution_id: &ExecutionId, node_id: impl Into<String>) -> Self {
        Self::Parent {
            execution_id: execution_id.clone(),
            node_id: node_id.into(),
        }
    }
}

/// One state-machine transition worth persisting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEvent {
    /// Synthetic first event carrying the initial state.
    Start {
        entry: String,
        state: GlobalState,
        #[serde(default)]
        config: RunConfig,
        reply_to: ReplyTo,
    },
    /// A node (or one branch of a parallel node) completed.
    NodeExecuted {
        node_id: String,
        output: GlobalState,
        reply_to: ReplyTo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_of: Option<String>,
    },
    /// A node failed. `handled_by` names the error transition taken, if any.
    NodeFailed {
        node_id: String,
        error: StrandError,
        reply_to: ReplyTo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handled_by: Option<String>,
    },
}

impl ExecutionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "START",
            Self::NodeExecuted { .. } => "NODE_EXECUTED",
            Self::NodeFailed { .. } => "NODE_FAILED",
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            Self::Start { entry, .. } => entry,
            Self::NodeExecuted { node_id, .. } | Self::NodeFailed { node_id, .. } => node_id,
        }
    }

    pub fn reply_to(&self) -> &ReplyTo {
        match self {
            Self::Start { reply_to, .. }
            | Self::NodeExecuted { reply_to, .. }
            | Self::NodeFailed { reply_to, .. } => reply_to,
        }
    }
}

/// An event stamped with its position in the run's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub execution_id: ExecutionId,
    /// 1-based, contiguous within one execution.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: ExecutionEvent,
}

impl EventRecord {
    pub fn new(execution_id: ExecutionId, seq: u64, event: ExecutionEvent) -> Self {
        Self {
            execution_id,
            seq,
            timestamp: Utc::now(),
            event,
        }
    }
}
