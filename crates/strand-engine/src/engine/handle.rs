use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use strand_core::error::{Result, StrandError};
use strand_core::flow_data::FlowData;
use strand_core::state::GlobalState;
use strand_core::types::{ExecutionId, RunStatus};

use crate::machine::StateHolder;

/// Caller's side of one run.
///
/// Yields zero or more fragments followed by exactly one terminal signal.
pub struct RunHandle {
    execution_id: ExecutionId,
    replies: mpsc::UnboundedReceiver<FlowData<GlobalState>>,
    status: watch::Receiver<RunStatus>,
    holder: Option<watch::Receiver<StateHolder>>,
    cancel: CancellationToken,
    terminated: bool,
}

impl RunHandle {
    pub(crate) fn new(
        execution_id: ExecutionId,
        replies: mpsc::UnboundedReceiver<FlowData<GlobalState>>,
        status: watch::Receiver<RunStatus>,
        holder: Option<watch::Receiver<StateHolder>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution_id,
            replies,
            status,
            holder,
            cancel,
            terminated: false,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Next signal, or `None` after the terminal signal or once the run was
    /// stopped.
    pub async fn next(&mut self) -> Option<FlowData<GlobalState>> {
        if self.terminated || self.cancel.is_cancelled() {
            return None;
        }
        let signal = tokio::select! {
            biased;
            signal = self.replies.recv() => signal,
            _ = self.cancel.cancelled() => None,
        };
        match signal {
            Some(signal) => {
                self.terminated = signal.is_terminal();
                Some(signal)
            }
            None => {
                self.terminated = true;
                None
            }
        }
    }

    /// Await the terminal signal, skipping fragments.
    pub async fn result(mut self) -> Result<GlobalState> {
        while let Some(signal) = self.next().await {
            match signal {
                FlowData::Fragment(_) => continue,
                FlowData::Done(state) => return Ok(state),
                FlowData::Error(cause) => return Err(cause),
            }
        }
        Err(StrandError::Cancelled)
    }

    /// Await the terminal signal, collecting fragments on the way.
    pub async fn collect(mut self) -> (Vec<GlobalState>, Result<GlobalState>) {
        let mut fragments = Vec::new();
        while let Some(signal) = self.next().await {
            match signal {
                FlowData::Fragment(f) => fragments.push(f),
                FlowData::Done(state) => return (fragments, Ok(state)),
                FlowData::Error(cause) => return (fragments, Err(cause)),
            }
        }
        (fragments, Err(StrandError::Cancelled))
    }

    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Wait until the run reaches a finished status.
    pub async fn finished(&mut self) -> RunStatus {
        loop {
            let current = self.status.borrow_and_update().clone();
            if current.is_finished() {
                return current;
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().clone();
            }
        }
    }

    /// Latest persisted progress, for durable runs.
    pub fn holder(&self) -> Option<StateHolder> {
        self.holder.as_ref().map(|h| h.borrow().clone())
    }

    /// Cancel the run. In-flight steps finish but their results are discarded.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stream of the run's signals.
    pub fn into_stream(self) -> impl Stream<Item = FlowData<GlobalState>> {
        UnboundedReceiverStream::new(self.replies)
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("execution_id", &self.execution_id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (
        RunHandle,
        mpsc::UnboundedSender<FlowData<GlobalState>>,
        watch::Sender<RunStatus>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RunStatus::Idle);
        let handle = RunHandle::new(
            ExecutionId::from_string("h"),
            rx,
            status_rx,
            None,
            CancellationToken::new(),
        );
        (handle, tx, status_tx)
    }

    #[tokio::test]
    async fn test_result_skips_fragments() {
        let (handle, tx, _status) = handle();
        tx.send(FlowData::fragment(GlobalState::new().with("p", 1))).unwrap();
        tx.send(FlowData::done(GlobalState::new().with("final", 1))).unwrap();
        let state = handle.result().await.unwrap();
        assert!(state.contains_key("final"));
    }

    #[tokio::test]
    async fn test_nothing_after_terminal() {
        let (mut handle, tx, _status) = handle();
        tx.send(FlowData::error(StrandError::step("a", "x"))).unwrap();
        tx.send(FlowData::done(GlobalState::new())).unwrap();
        assert!(handle.next().await.unwrap().is_error());
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_ends_delivery() {
        let (handle, tx, _status) = handle();
        handle.stop();
        tx.send(FlowData::done(GlobalState::new())).unwrap();
        assert!(handle.is_stopped());
        assert_eq!(handle.result().await.unwrap_err(), StrandError::Cancelled);
    }

    #[tokio::test]
    async fn test_finished_waits_for_status() {
        let (mut handle, _tx, status) = handle();
        tokio::spawn(async move {
            status.send_replace(RunStatus::Running("a".into()));
            status.send_replace(RunStatus::Completed);
        });
        assert_eq!(handle.finished().await, RunStatus::Completed);
    }
}
