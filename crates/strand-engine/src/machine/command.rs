use strand_core::error::StrandError;
use strand_core::state::GlobalState;
use strand_core::types::RunConfig;

/// Messages consumed one at a time by a state machine's mailbox.
///
/// Signals from step units carry the `epoch` of the dispatch that produced
/// them; a signal from an earlier dispatch is stale and discarded.
#[derive(Debug)]
pub enum Command {
    Start {
        state: GlobalState,
        config: RunConfig,
    },
    /// Continue a run restored from its event log.
    Resume,
    Proceed {
        node_id: String,
    },
    ActionCompleted {
        node_id: String,
        output: GlobalState,
        epoch: u64,
    },
    ActionFailed {
        node_id: String,
        error: StrandError,
        epoch: u64,
    },
    BranchCompleted {
        parallel_id: String,
        branch_id: String,
        output: GlobalState,
        epoch: u64,
    },
    BranchFailed {
        parallel_id: String,
        branch_id: String,
        error: StrandError,
        epoch: u64,
    },
    Progress {
        node_id: String,
        fragment: GlobalState,
        epoch: u64,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Resume => "resume",
            Self::Proceed { .. } => "proceed",
            Self::ActionCompleted { .. } => "action_completed",
            Self::ActionFailed { .. } => "action_failed",
            Self::BranchCompleted { .. } => "branch_completed",
            Self::BranchFailed { .. } => "branch_failed",
            Self::Progress { .. } => "progress",
        }
    }
}
