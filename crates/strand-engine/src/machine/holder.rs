use std::collections::{BTreeMap, VecDeque};

use serde_json::json;

use strand_core::error::{Result, StrandError};
use strand_core::record::{EventRecord, ExecutionEvent, ReplyTo};
use strand_core::state::GlobalState;
use strand_core::types::{ExecutionId, RunConfig};

/// State key recording the failure that triggered an error transition.
pub const LAST_ERROR_KEY: &str = "last_error";

/// Branch outputs recorded for one in-flight parallel node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParallelProgress {
    pub done: BTreeMap<String, GlobalState>,
}

/// The reconstructible progress record of one run.
///
/// Changed only by [`apply`](Self::apply), which live execution and replay
/// both go through, plus the routing decision recorded with
/// [`advance`](Self::advance).
#[derive(Debug, Clone, PartialEq)]
pub struct StateHolder {
    pub execution_id: ExecutionId,
    /// Node being executed or about to be dispatched.
    pub current_node: Option<String>,
    pub last_completed: Option<String>,
    pub state: GlobalState,
    pub config: RunConfig,
    pub reply_to: Option<ReplyTo>,
    pub parallel: BTreeMap<String, ParallelProgress>,
    pub pending_failures: VecDeque<StrandError>,
    /// Seq of the last applied record.
    pub seq: u64,
}

impl StateHolder {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            current_node: None,
            last_completed: None,
            state: GlobalState::new(),
            config: RunConfig::default(),
            reply_to: None,
            parallel: BTreeMap::new(),
            pending_failures: VecDeque::new(),
            seq: 0,
        }
    }

    /// Rebuild a holder from records without routing.
    pub fn rebuild(execution_id: ExecutionId, records: &[EventRecord]) -> Result<Self> {
        let mut holder = Self::new(execution_id);
        for record in records {
            holder.apply(record)?;
        }
        Ok(holder)
    }

    pub fn is_started(&self) -> bool {
        self.seq > 0
    }

    /// Apply one persisted event.
    pub fn apply(&mut self, record: &EventRecord) -> Result<()> {
        if record.execution_id != self.execution_id {
            return Err(StrandError::recovery(format!(
                "event #{} belongs to {}, not {}",
                record.seq, record.execution_id, self.execution_id
            )));
        }
        if record.seq != self.seq + 1 {
            return Err(StrandError::recovery(format!(
                "{}: expected event #{}, found #{}",
                self.execution_id,
                self.seq + 1,
                record.seq
            )));
        }
        if !self.is_started() && !matches!(record.event, ExecutionEvent::Start { .. }) {
            return Err(StrandError::recovery(format!(
                "{}: log does not begin with START",
                self.execution_id
            )));
        }

        match &record.event {
            ExecutionEvent::Start {
                entry,
                state,
                config,
                reply_to,
            } => {
                if self.is_started() {
                    return Err(StrandError::recovery(format!(
                        "{}: duplicate START at #{}",
                        self.execution_id, record.seq
                    )));
                }
                self.current_node = Some(entry.clone());
                self.state = state.clone();
                self.config = config.clone();
                self.reply_to = Some(reply_to.clone());
            }
            ExecutionEvent::NodeExecuted {
                node_id,
                output,
                branch_of: Some(parallel_id),
                ..
            } => {
                self.parallel
                    .entry(parallel_id.clone())
                    .or_default()
                    .done
                    .insert(node_id.clone(), output.clone());
            }
            ExecutionEvent::NodeExecuted {
                node_id,
                output,
                branch_of: None,
                ..
            } => {
                self.state = output.clone();
                self.parallel.remove(node_id);
                self.last_completed = Some(node_id.clone());
                // Set by the routing decision that follows.
                self.current_node = None;
            }
            ExecutionEvent::NodeFailed {
                node_id,
                error,
                handled_by,
                ..
            } => {
                self.parallel.remove(node_id);
                match handled_by {
                    Some(target) => {
                        self.state = self.state.with(
                            LAST_ERROR_KEY,
                            json!({ "node": node_id, "message": error.message() }),
                        );
                        self.current_node = Some(target.clone());
                    }
                    None => {
                        self.pending_failures.push_back(error.clone());
                        self.current_node = None;
                    }
                }
            }
        }

        self.seq = record.seq;
        Ok(())
    }

    /// Record the routing decision taken after the last completed node.
    pub fn advance(&mut self, next: impl Into<String>) {
        self.current_node = Some(next.into());
    }

    pub fn take_failure(&mut self) -> Option<StrandError> {
        self.pending_failures.pop_front()
    }

    pub fn branch_done(&self, parallel_id: &str, branch_id: &str) -> bool {
        self.parallel
            .get(parallel_id)
            .is_some_and(|p| p.done.contains_key(branch_id))
    }
}
