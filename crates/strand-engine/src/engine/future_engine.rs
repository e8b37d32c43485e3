use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{try_join_all, BoxFuture};
use serde_json::json;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strand_core::config::EngineSettings;
use strand_core::error::{Result, StrandError};
use strand_core::event::EventBus;
use strand_core::flow_data::FlowData;
use strand_core::state::GlobalState;
use strand_core::types::{is_terminal, EngineEvent, ExecutionId, RunConfig, RunStatus};
use strand_stream::BufferRegistry;

use super::handle::RunHandle;
use super::Engine;
use crate::graph::{
    Branch, CompiledGraph, RouteContext, Router, StepKind, SubgraphLibrary, TransitionRouter,
};
use crate::machine::{ReplySink, LAST_ERROR_KEY};
use crate::step::{Step, StepContext};
use crate::unit::StepExecutionUnit;

/// In-memory engine built on futures.
///
/// Follows the same step, transition, and branch semantics as the durable
/// engine but persists nothing, so a run cannot be recovered. Task steps run
/// on a bounded worker pool.
pub struct FutureEngine {
    bus: Arc<EventBus>,
    buffers: Arc<BufferRegistry>,
    settings: EngineSettings,
    pool: Arc<Semaphore>,
}

impl Default for FutureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FutureEngine {
    pub fn new() -> Self {
        let settings = EngineSettings::default();
        Self {
            bus: Arc::new(EventBus::new(settings.event_bus_capacity)),
            buffers: Arc::new(BufferRegistry::new()),
            pool: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
            settings,
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.pool = Arc::new(Semaphore::new(settings.worker_pool_size.max(1)));
        self.settings = settings;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_buffers(mut self, buffers: Arc<BufferRegistry>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn buffers(&self) -> &Arc<BufferRegistry> {
        &self.buffers
    }

    /// Start a run under a caller-chosen id, so observers can subscribe to
    /// it before the first event is published.
    pub async fn start_with_id(
        &self,
        id: ExecutionId,
        graph: Arc<CompiledGraph>,
        input: GlobalState,
        config: RunConfig,
    ) -> Result<RunHandle> {
        self.launch(id, graph, input, config)
    }

    fn launch(
        &self,
        id: ExecutionId,
        graph: Arc<CompiledGraph>,
        input: GlobalState,
        config: RunConfig,
    ) -> Result<RunHandle> {
        if id.is_child() {
            return Err(StrandError::config(format!(
                "execution id '{}' is reserved for subgraph runs",
                id
            )));
        }
        if self.settings.validate_edges {
            graph.validate()?;
        }

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RunStatus::Idle);
        let cancel = CancellationToken::new();

        let run = Arc::new(FutureRun {
            id: id.clone(),
            config,
            library: graph.library().clone(),
            bus: self.bus.clone(),
            buffers: self.buffers.clone(),
            pool: self.pool.clone(),
            max_transitions: self.settings.max_transitions,
            transitions: AtomicUsize::new(0),
            sink: reply_tx,
            status: status_tx,
            cancel: cancel.clone(),
        });

        tokio::spawn(async move {
            info!(execution_id = %run.id, graph = %graph.id(), "Run started");
            run.publish(EngineEvent::RunStarted {
                execution_id: run.id.clone(),
            });

            let outcome = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => None,
                result = drive(run.clone(), graph, input) => Some(result),
            };
            run.finish(outcome);
        });

        Ok(RunHandle::new(id, reply_rx, status_rx, None, cancel))
    }
}

impl Engine for FutureEngine {
    fn start(
        &self,
        graph: Arc<CompiledGraph>,
        input: GlobalState,
        config: RunConfig,
    ) -> BoxFuture<'_, Result<RunHandle>> {
        let handle = self.launch(ExecutionId::new(), graph, input, config);
        Box::pin(async move { handle })
    }
}

/// Everything one run shares across its nested futures.
struct FutureRun {
    id: ExecutionId,
    config: RunConfig,
    library: Arc<SubgraphLibrary>,
    bus: Arc<EventBus>,
    buffers: Arc<BufferRegistry>,
    pool: Arc<Semaphore>,
    max_transitions: usize,
    transitions: AtomicUsize,
    sink: ReplySink,
    status: watch::Sender<RunStatus>,
    cancel: CancellationToken,
}

impl FutureRun {
    fn publish(&self, event: EngineEvent) {
        self.bus.publish(event);
    }

    fn count_transition(&self, node_id: &str) -> Result<()> {
        let before = self.transitions.fetch_add(1, Ordering::SeqCst);
        if self.max_transitions > 0 && before >= self.max_transitions {
            return Err(StrandError::config(format!(
                "run exceeded {} transitions at '{}'",
                self.max_transitions, node_id
            )));
        }
        Ok(())
    }

    fn finish(&self, outcome: Option<Result<GlobalState>>) {
        match outcome {
            None => {
                info!(execution_id = %self.id, "Run cancelled");
                self.status.send_replace(RunStatus::Cancelled);
                self.publish(EngineEvent::RunCancelled {
                    execution_id: self.id.clone(),
                });
            }
            Some(Ok(state)) => {
                info!(execution_id = %self.id, keys = state.len(), "Run completed");
                let _ = self.sink.send(FlowData::Done(state));
                self.status.send_replace(RunStatus::Completed);
                self.publish(EngineEvent::RunCompleted {
                    execution_id: self.id.clone(),
                });
            }
            Some(Err(e)) => {
                info!(execution_id = %self.id, error = %e, "Run failed");
                self.publish(EngineEvent::RunFailed {
                    execution_id: self.id.clone(),
                    error: e.to_string(),
                });
                let _ = self.sink.send(FlowData::Error(e));
                self.status.send_replace(RunStatus::Failed);
            }
        }
    }

    /// Run one task step on the worker pool, streaming its fragments to the
    /// caller.
    async fn run_task(&self, node_id: &str, step: Arc<dyn Step>, state: GlobalState) -> Result<GlobalState> {
        let _permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StrandError::Cancelled)?;

        let ctx = StepContext {
            execution_id: self.id.clone(),
            node_id: node_id.to_string(),
            state,
            config: self.config.clone(),
            buffers: self.buffers.clone(),
        };
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();
        let bus = self.bus.clone();
        let id = self.id.clone();
        let node = node_id.to_string();
        StepExecutionUnit::new(node_id, step)
            .execute(ctx, move |fragment| {
                if cancel.is_cancelled() {
                    return;
                }
                bus.publish(EngineEvent::NodeProgress {
                    execution_id: id.clone(),
                    node_id: node.clone(),
                });
                let _ = sink.send(FlowData::Fragment(fragment));
            })
            .await
    }

    /// Run every satisfied branch concurrently, merging each branch's changes
    /// into the shared context as it completes. The first failure wins and
    /// the remaining branches are abandoned.
    async fn run_parallel(
        &self,
        graph: &CompiledGraph,
        node_id: &str,
        branches: &[Branch],
        base: &GlobalState,
    ) -> Result<GlobalState> {
        let targets = satisfied(graph, node_id, branches, base)?;
        self.publish(EngineEvent::ParallelDispatched {
            execution_id: self.id.clone(),
            node_id: node_id.to_string(),
            branches: targets.iter().map(|(t, _)| t.clone()).collect(),
        });

        let shared = Arc::new(Mutex::new(base.clone()));
        let joins = targets.into_iter().map(|(target, step)| {
            let shared = shared.clone();
            async move {
                let output = self
                    .run_task(&target, step, base.clone())
                    .await
                    .map_err(|e| StrandError::ParallelBranch {
                        node: node_id.to_string(),
                        branch: target.clone(),
                        message: e.message(),
                    })?;
                let mut context = shared.lock().unwrap_or_else(|e| e.into_inner());
                *context = context.merge(&output.diff(base));
                debug!(execution_id = %self.id, node_id = %node_id, branch = %target, "Branch merged");
                Ok::<(), StrandError>(())
            }
        });
        try_join_all(joins).await?;

        let merged = shared.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(merged)
    }

    /// Start every satisfied branch without waiting. Failures are logged.
    fn run_async(
        self: &Arc<Self>,
        graph: &CompiledGraph,
        node_id: &str,
        branches: &[Branch],
        base: &GlobalState,
    ) -> Result<()> {
        for (target, step) in satisfied(graph, node_id, branches, base)? {
            let run = self.clone();
            let parent = node_id.to_string();
            let state = base.clone();
            tokio::spawn(async move {
                match run.run_task(&target, step, state).await {
                    Ok(_) => debug!(execution_id = %run.id, node_id = %parent, branch = %target, "Async branch completed"),
                    Err(e) => warn!(execution_id = %run.id, node_id = %parent, branch = %target, error = %e, "Async branch failed"),
                }
            });
        }
        Ok(())
    }
}

/// Drive `graph` from its entry to a terminal marker.
fn drive(run: Arc<FutureRun>, graph: Arc<CompiledGraph>, input: GlobalState) -> BoxFuture<'static, Result<GlobalState>> {
    Box::pin(async move {
        let mut state = input;
        let mut node_id = graph.entry().to_string();

        loop {
            if run.cancel.is_cancelled() {
                return Err(StrandError::Cancelled);
            }
            if is_terminal(&node_id) {
                return Ok(state);
            }
            run.count_transition(&node_id)?;

            let action = graph.action(&node_id).cloned().ok_or_else(|| {
                StrandError::config(format!(
                    "node '{}' is not registered in graph '{}'",
                    node_id,
                    graph.id()
                ))
            })?;

            run.status.send_replace(RunStatus::Running(node_id.clone()));
            run.publish(EngineEvent::NodeStarted {
                execution_id: run.id.clone(),
                node_id: node_id.clone(),
            });
            let started = Instant::now();

            let outcome = match action {
                StepKind::Task(step) => run.run_task(&node_id, step, state.clone()).await,
                StepKind::Parallel(branches) => run.run_parallel(&graph, &node_id, &branches, &state).await,
                StepKind::Async(branches) => run
                    .run_async(&graph, &node_id, &branches, &state)
                    .map(|_| state.clone()),
                StepKind::Subgraph(graph_id) => match run.library.get(&graph_id).cloned() {
                    Some(sub) => drive(run.clone(), sub, state.clone()).await,
                    None => Err(StrandError::config(format!(
                        "node '{}' references unknown subgraph '{}'",
                        node_id, graph_id
                    ))),
                },
            };

            match outcome {
                Ok(output) => {
                    state = state.merge(&output);
                    run.publish(EngineEvent::NodeCompleted {
                        execution_id: run.id.clone(),
                        node_id: node_id.clone(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                    let next = TransitionRouter.route(RouteContext {
                        graph: &graph,
                        current: &node_id,
                        state: &state,
                        last_output: None,
                    })?;
                    debug!(execution_id = %run.id, from = %node_id, to = %next, "Routed");
                    node_id = next;
                }
                Err(e) if e.is_fatal() || matches!(e, StrandError::Cancelled) => return Err(e),
                Err(e) => {
                    error!(execution_id = %run.id, node_id = %node_id, error = %e, "Node failed");
                    run.publish(EngineEvent::NodeFailed {
                        execution_id: run.id.clone(),
                        node_id: node_id.clone(),
                        error: e.to_string(),
                    });
                    match graph.error_route(&node_id) {
                        Some(target) => {
                            warn!(execution_id = %run.id, node_id = %node_id, target = %target, "Taking error transition");
                            state = state.with(
                                LAST_ERROR_KEY,
                                json!({ "node": node_id, "message": e.message() }),
                            );
                            node_id = target.to_string();
                        }
                        None => return Err(e),
                    }
                }
            }
        }
    })
}

/// Satisfied branches paired with their task steps.
fn satisfied(
    graph: &CompiledGraph,
    node_id: &str,
    branches: &[Branch],
    state: &GlobalState,
) -> Result<Vec<(String, Arc<dyn Step>)>> {
    let mut targets = Vec::new();
    for branch in branches {
        let ok = branch.predicate.evaluate(state).map_err(|e| {
            StrandError::routing(
                node_id,
                format!("predicate for branch '{}' failed: {}", branch.target, e.message()),
            )
        })?;
        if !ok {
            continue;
        }
        match graph.action(&branch.target) {
            Some(StepKind::Task(step)) => targets.push((branch.target.clone(), step.clone())),
            _ => {
                return Err(StrandError::config(format!(
                    "branch '{}' of '{}' must name a task step",
                    branch.target, node_id
                )))
            }
        }
    }
    Ok(targets)
}
