use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use strand_core::error::{Result, StrandError};
use strand_core::flow_data::FlowData;
use strand_core::state::GlobalState;

use crate::step::{Step, StepContext, StepOutput};

/// Lifecycle signals reported by a [`StepExecutionUnit`].
#[derive(Debug, Clone, PartialEq)]
pub enum UnitSignal {
    Started,
    Progress(GlobalState),
    Completed(GlobalState),
    Failed(StrandError),
}

impl UnitSignal {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// Callback receiving a unit's signals.
pub type Reporter = Arc<dyn Fn(UnitSignal) + Send + Sync>;

/// Disposable wrapper around one invocation of a step.
///
/// Reports `Started`, then any number of `Progress`, then exactly one of
/// `Completed` or `Failed`, even when the step body panics.
pub struct StepExecutionUnit {
    node_id: String,
    step: Arc<dyn Step>,
}

impl StepExecutionUnit {
    pub fn new(node_id: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            node_id: node_id.into(),
            step,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run the step on its own task, reporting through `reporter`.
    pub fn launch(self, ctx: StepContext, reporter: Reporter) -> JoinHandle<()> {
        tokio::spawn(self.run(ctx, reporter))
    }

    /// Run the step to completion on the current task.
    pub async fn run(self, ctx: StepContext, reporter: Reporter) {
        let node_id = self.node_id;
        let terminal = Arc::new(AtomicBool::new(false));
        let report = {
            let terminal = terminal.clone();
            let reporter = reporter.clone();
            move |signal: UnitSignal| {
                if signal.is_terminal() && terminal.swap(true, Ordering::SeqCst) {
                    warn!("Dropping second terminal signal from step");
                    return;
                }
                reporter(signal);
            }
        };

        report(UnitSignal::Started);

        // The body runs on an inner task so a panic surfaces as a JoinError
        // instead of tearing down the caller.
        let step = self.step;
        let inner_node = node_id.clone();
        let body = tokio::spawn(async move {
            match step.call(ctx).await {
                Ok(StepOutput::State(state)) => report(UnitSignal::Completed(state)),
                Ok(StepOutput::Stream(mut stream)) => {
                    while let Some(signal) = stream.next().await {
                        match signal {
                            FlowData::Fragment(fragment) => report(UnitSignal::Progress(fragment)),
                            FlowData::Done(state) => {
                                report(UnitSignal::Completed(state));
                                return;
                            }
                            FlowData::Error(cause) => {
                                report(UnitSignal::Failed(cause));
                                return;
                            }
                        }
                    }
                    report(UnitSignal::Failed(StrandError::step(
                        &inner_node,
                        "stream ended without a terminal signal",
                    )));
                }
                Err(cause) => report(UnitSignal::Failed(cause)),
            }
        });

        if let Err(e) = body.await {
            let cause = if e.is_panic() {
                let message = panic_message(e.into_panic());
                error!(node_id = %node_id, panic = %message, "Step panicked");
                StrandError::step(&node_id, message)
            } else {
                StrandError::Cancelled
            };
            if !terminal.swap(true, Ordering::SeqCst) {
                reporter(UnitSignal::Failed(cause));
            }
        }
        debug!(node_id = %node_id, "Step unit finished");
    }

    /// Run the step and resolve to its outcome, forwarding fragments to
    /// `on_progress`.
    pub async fn execute<P>(self, ctx: StepContext, on_progress: P) -> Result<GlobalState>
    where
        P: Fn(GlobalState) + Send + Sync + 'static,
    {
        let node_id = self.node_id.clone();
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let reporter: Reporter = Arc::new(move |signal| {
            let outcome = match signal {
                UnitSignal::Started => return,
                UnitSignal::Progress(fragment) => {
                    on_progress(fragment);
                    return;
                }
                UnitSignal::Completed(state) => Ok(state),
                UnitSignal::Failed(cause) => Err(cause),
            };
            if let Some(tx) = slot.lock().ok().and_then(|mut s| s.take()) {
                let _ = tx.send(outcome);
            }
        });

        self.run(ctx, reporter).await;
        rx.await
            .unwrap_or_else(|_| Err(StrandError::step(node_id, "step reported no outcome")))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "step panicked".to_string()
    }
}
