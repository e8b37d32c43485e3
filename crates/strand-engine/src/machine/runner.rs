use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strand_core::config::EngineSettings;
use strand_core::error::{Result, StrandError};
use strand_core::event::EventBus;
use strand_core::flow_data::FlowData;
use strand_core::record::{EventRecord, ExecutionEvent, ReplyTo};
use strand_core::state::GlobalState;
use strand_core::traits::EventLog;
use strand_core::types::{is_terminal, EngineEvent, ExecutionId, RunConfig, RunStatus};
use strand_stream::BufferRegistry;

use super::command::Command;
use super::holder::StateHolder;
use crate::graph::{Branch, CompiledGraph, RouteContext, Router, RouterFactory, StepKind, SubgraphLibrary};
use crate::step::{Step, StepContext};
use crate::unit::{Reporter, StepExecutionUnit, UnitSignal};

/// Collaborators shared by every machine of one engine.
pub(crate) struct MachineShared {
    pub log: Arc<dyn EventLog>,
    pub bus: Arc<EventBus>,
    pub buffers: Arc<BufferRegistry>,
    pub routers: RouterFactory,
    pub settings: EngineSettings,
}

/// Where a machine delivers fragments and its terminal signal.
pub(crate) type ReplySink = mpsc::UnboundedSender<FlowData<GlobalState>>;

/// Receivers observing a machine from outside.
pub(crate) struct MachineWatch {
    pub status: watch::Receiver<RunStatus>,
    pub holder: watch::Receiver<StateHolder>,
}

/// Owns one running instance of a graph, main or nested.
///
/// Commands are handled strictly one at a time from a single mailbox. Every
/// completed step is persisted before it is applied, and replaying the log
/// through the same apply path rebuilds the run after a restart.
pub struct ExecutionStateMachine {
    id: ExecutionId,
    graph: Arc<CompiledGraph>,
    library: Arc<SubgraphLibrary>,
    shared: Arc<MachineShared>,
    router: Box<dyn Router>,
    holder: StateHolder,
    reply_to: ReplyTo,
    reply: ReplySink,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<RunStatus>,
    snapshot: watch::Sender<StateHolder>,
    cancel: CancellationToken,
    epoch: u64,
    transitions: usize,
    parallel_expected: Vec<String>,
    routing_error: Option<StrandError>,
    node_started: Option<Instant>,
    finished: bool,
}

impl ExecutionStateMachine {
    pub(crate) fn new(
        id: ExecutionId,
        graph: Arc<CompiledGraph>,
        library: Arc<SubgraphLibrary>,
        shared: Arc<MachineShared>,
        reply_to: ReplyTo,
        reply: ReplySink,
        cancel: CancellationToken,
    ) -> (Self, MachineWatch) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(RunStatus::Idle);
        let (snapshot, holder_rx) = watch::channel(StateHolder::new(id.clone()));
        let router = (shared.routers)(&graph);
        let machine = Self {
            holder: StateHolder::new(id.clone()),
            id,
            graph,
            library,
            shared,
            router,
            reply_to,
            reply,
            tx,
            rx,
            status,
            snapshot,
            cancel,
            epoch: 0,
            transitions: 0,
            parallel_expected: Vec::new(),
            routing_error: None,
            node_started: None,
            finished: false,
        };
        let watch = MachineWatch {
            status: status_rx,
            holder: holder_rx,
        };
        (machine, watch)
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.id
    }

    pub fn holder(&self) -> &StateHolder {
        &self.holder
    }

    /// Enqueue a command on this machine's mailbox.
    pub(crate) fn dispatch(&self, command: Command) {
        // The machine owns the receiver, so this only fails once it stopped.
        let _ = self.tx.send(command);
    }

    /// Replay persisted records, rebuilding the holder and the router state
    /// without executing any step.
    pub(crate) fn restore(&mut self, records: Vec<EventRecord>) -> Result<usize> {
        if records.is_empty() {
            return Err(StrandError::recovery(format!("no events recorded for {}", self.id)));
        }
        let started = Instant::now();
        let replayed = records.len();

        for record in &records {
            self.holder.apply(record)?;
            self.routing_error = None;
            match &record.event {
                ExecutionEvent::NodeExecuted {
                    node_id,
                    branch_of: None,
                    ..
                } => {
                    self.transitions += 1;
                    match self.route_from(node_id) {
                        Ok(next) => self.holder.advance(next),
                        Err(e) => self.routing_error = Some(e),
                    }
                }
                ExecutionEvent::NodeFailed { .. } => self.transitions += 1,
                _ => {}
            }
        }

        if let Some(reply_to) = &self.holder.reply_to {
            self.reply_to = reply_to.clone();
        }
        self.snapshot.send_replace(self.holder.clone());
        if let Some(node) = &self.holder.current_node {
            self.status.send_replace(RunStatus::Running(node.clone()));
        }
        info!(
            execution_id = %self.id,
            events = replayed,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Run restored from event log"
        );
        self.publish(EngineEvent::RunRecovered {
            execution_id: self.id.clone(),
            replayed,
        });
        Ok(replayed)
    }

    /// Run the mailbox loop on a new task.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let fut: BoxFuture<'static, ()> = Box::pin(self.run());
        tokio::spawn(fut)
    }

    async fn run(mut self) {
        debug!(execution_id = %self.id, graph = %self.graph.id(), "State machine started");
        while !self.finished {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                command = self.rx.recv() => command,
            };
            let Some(command) = next else {
                if self.cancel.is_cancelled() {
                    self.on_cancelled();
                }
                break;
            };

            debug!(execution_id = %self.id, command = command.name(), "Handling command");
            if let Err(e) = self.handle(command).await {
                error!(execution_id = %self.id, error = %e, "Run aborted");
                self.finish_failed(e);
            }
        }
        debug!(execution_id = %self.id, "State machine stopped");
    }

    async fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Start { state, config } => self.on_start(state, config).await,
            Command::Resume => self.on_resume().await,
            Command::Proceed { node_id } => self.on_proceed(node_id).await,
            Command::ActionCompleted {
                node_id,
                output,
                epoch,
            } => {
                if self.is_stale(&node_id, epoch, "completion") {
                    return Ok(());
                }
                self.on_completed(node_id, output).await
            }
            Command::ActionFailed {
                node_id,
                error,
                epoch,
            } => {
                if self.is_stale(&node_id, epoch, "failure") {
                    return Ok(());
                }
                self.on_failed(node_id, error).await
            }
            Command::BranchCompleted {
                parallel_id,
                branch_id,
                output,
                epoch,
            } => {
                if self.is_stale(&parallel_id, epoch, "branch completion") {
                    return Ok(());
                }
                self.on_branch_completed(parallel_id, branch_id, output).await
            }
            Command::BranchFailed {
                parallel_id,
                branch_id,
                error,
                epoch,
            } => {
                if self.is_stale(&parallel_id, epoch, "branch failure") {
                    return Ok(());
                }
                warn!(execution_id = %self.id, node_id = %parallel_id, branch = %branch_id, error = %error, "Parallel branch failed");
                let cause = StrandError::ParallelBranch {
                    node: parallel_id.clone(),
                    branch: branch_id,
                    message: error.message(),
                };
                self.on_failed(parallel_id, cause).await
            }
            Command::Progress {
                node_id,
                fragment,
                epoch,
            } => {
                if !self.is_stale(&node_id, epoch, "progress") {
                    self.publish(EngineEvent::NodeProgress {
                        execution_id: self.id.clone(),
                        node_id,
                    });
                    let _ = self.reply.send(FlowData::Fragment(fragment));
                }
                Ok(())
            }
        }
    }

    async fn on_start(&mut self, state: GlobalState, config: RunConfig) -> Result<()> {
        let entry = self.graph.entry().to_string();
        info!(execution_id = %self.id, graph = %self.graph.id(), entry = %entry, "Run started");
        self.persist(ExecutionEvent::Start {
            entry: entry.clone(),
            state,
            config,
            reply_to: self.reply_to.clone(),
        })
        .await?;
        self.publish(EngineEvent::RunStarted {
            execution_id: self.id.clone(),
        });
        self.dispatch(Command::Proceed { node_id: entry });
        Ok(())
    }

    async fn on_resume(&mut self) -> Result<()> {
        if let Some(error) = self.holder.take_failure() {
            self.finish_failed(error);
            return Ok(());
        }

        if let Some(error) = self.routing_error.take() {
            let node_id = self.holder.last_completed.clone().unwrap_or_default();
            return self.fail_routing(node_id, error).await;
        }

        match self.holder.current_node.clone() {
            Some(node_id) => {
                info!(execution_id = %self.id, node_id = %node_id, "Resuming run");
                self.dispatch(Command::Proceed { node_id });
                Ok(())
            }
            None => Err(StrandError::recovery(format!(
                "{}: no node to resume from",
                self.id
            ))),
        }
    }

    async fn on_proceed(&mut self, node_id: String) -> Result<()> {
        if is_terminal(&node_id) {
            self.finish_done();
            return Ok(());
        }

        let max = self.shared.settings.max_transitions;
        if max > 0 && self.transitions >= max {
            return Err(StrandError::config(format!(
                "run exceeded {} transitions at '{}'",
                max, node_id
            )));
        }

        let action = self.graph.action(&node_id).cloned().ok_or_else(|| {
            StrandError::config(format!(
                "node '{}' is not registered in graph '{}'",
                node_id,
                self.graph.id()
            ))
        })?;

        self.transitions += 1;
        self.epoch += 1;
        self.holder.advance(node_id.clone());
        self.node_started = Some(Instant::now());
        self.status.send_replace(RunStatus::Running(node_id.clone()));
        self.publish(EngineEvent::NodeStarted {
            execution_id: self.id.clone(),
            node_id: node_id.clone(),
        });
        debug!(execution_id = %self.id, node_id = %node_id, kind = action.name(), "Dispatching node");

        match action {
            StepKind::Task(step) => {
                self.launch(&node_id, step, None);
                Ok(())
            }
            StepKind::Parallel(branches) => self.dispatch_parallel(node_id, &branches).await,
            StepKind::Async(branches) => self.dispatch_async(node_id, &branches).await,
            StepKind::Subgraph(graph_id) => self.spawn_subgraph(node_id, &graph_id).await,
        }
    }

    async fn on_completed(&mut self, node_id: String, output: GlobalState) -> Result<()> {
        // Steps may return a partial map; keys already committed are never dropped.
        let committed = self.holder.state.merge(&output);
        self.persist(ExecutionEvent::NodeExecuted {
            node_id: node_id.clone(),
            output: committed,
            reply_to: self.reply_to.clone(),
            branch_of: None,
        })
        .await?;

        let elapsed_ms = self
            .node_started
            .take()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        debug!(execution_id = %self.id, node_id = %node_id, elapsed_ms, "Node completed");
        self.publish(EngineEvent::NodeCompleted {
            execution_id: self.id.clone(),
            node_id: node_id.clone(),
            elapsed_ms,
        });

        match self.route_from(&node_id) {
            Ok(next) => {
                debug!(execution_id = %self.id, from = %node_id, to = %next, "Routed");
                self.holder.advance(next.clone());
                self.snapshot.send_replace(self.holder.clone());
                self.dispatch(Command::Proceed { node_id: next });
                Ok(())
            }
            Err(e) => self.fail_routing(node_id, e).await,
        }
    }

    async fn on_failed(&mut self, node_id: String, error: StrandError) -> Result<()> {
        let handled_by = self.graph.error_route(&node_id).map(str::to_string);
        error!(
            execution_id = %self.id,
            node_id = %node_id,
            error = %error,
            handled = handled_by.is_some(),
            "Node failed"
        );
        self.node_started = None;
        self.persist(ExecutionEvent::NodeFailed {
            node_id: node_id.clone(),
            error: error.clone(),
            reply_to: self.reply_to.clone(),
            handled_by: handled_by.clone(),
        })
        .await?;
        self.publish(EngineEvent::NodeFailed {
            execution_id: self.id.clone(),
            node_id,
            error: error.to_string(),
        });

        match handled_by {
            Some(target) => self.dispatch(Command::Proceed { node_id: target }),
            None => self.deliver_pending_failure(),
        }
        Ok(())
    }

    async fn fail_routing(&mut self, node_id: String, error: StrandError) -> Result<()> {
        error!(execution_id = %self.id, node_id = %node_id, error = %error, "Routing failed");
        self.persist(ExecutionEvent::NodeFailed {
            node_id: node_id.clone(),
            error: error.clone(),
            reply_to: self.reply_to.clone(),
            handled_by: None,
        })
        .await?;
        self.publish(EngineEvent::NodeFailed {
            execution_id: self.id.clone(),
            node_id,
            error: error.to_string(),
        });
        self.deliver_pending_failure();
        Ok(())
    }

    async fn dispatch_parallel(&mut self, node_id: String, branches: &[Branch]) -> Result<()> {
        let targets = match self.satisfied(&node_id, branches) {
            Ok(targets) => targets,
            Err(e) => return self.on_failed(node_id, e).await,
        };
        self.publish(EngineEvent::ParallelDispatched {
            execution_id: self.id.clone(),
            node_id: node_id.clone(),
            branches: targets.clone(),
        });
        self.parallel_expected = targets;

        let mut launched = 0;
        for target in self.parallel_expected.clone() {
            if self.holder.branch_done(&node_id, &target) {
                debug!(execution_id = %self.id, node_id = %node_id, branch = %target, "Branch already recorded, skipping");
                continue;
            }
            let step = self.branch_step(&node_id, &target)?;
            self.launch(&target, step, Some(&node_id));
            launched += 1;
        }

        debug!(execution_id = %self.id, node_id = %node_id, launched, "Parallel branches dispatched");
        if launched == 0 {
            return self.join_parallel(node_id).await;
        }
        Ok(())
    }

    async fn on_branch_completed(
        &mut self,
        parallel_id: String,
        branch_id: String,
        output: GlobalState,
    ) -> Result<()> {
        if self.holder.branch_done(&parallel_id, &branch_id) {
            warn!(execution_id = %self.id, node_id = %parallel_id, branch = %branch_id, "Duplicate branch completion discarded");
            return Ok(());
        }
        self.persist(ExecutionEvent::NodeExecuted {
            node_id: branch_id.clone(),
            output,
            reply_to: self.reply_to.clone(),
            branch_of: Some(parallel_id.clone()),
        })
        .await?;
        debug!(execution_id = %self.id, node_id = %parallel_id, branch = %branch_id, "Branch completed");

        let all_done = self
            .parallel_expected
            .iter()
            .all(|b| self.holder.branch_done(&parallel_id, b));
        if all_done {
            self.join_parallel(parallel_id).await?;
        }
        Ok(())
    }

    /// Merge every branch's changes over the node's input, in declaration order.
    async fn join_parallel(&mut self, node_id: String) -> Result<()> {
        let base = self.holder.state.clone();
        let mut merged = base.clone();
        if let Some(progress) = self.holder.parallel.get(&node_id) {
            for branch in &self.parallel_expected {
                if let Some(output) = progress.done.get(branch) {
                    merged = merged.merge(&output.diff(&base));
                }
            }
        }
        self.parallel_expected.clear();
        self.on_completed(node_id, merged).await
    }

    async fn dispatch_async(&mut self, node_id: String, branches: &[Branch]) -> Result<()> {
        let targets = match self.satisfied(&node_id, branches) {
            Ok(targets) => targets,
            Err(e) => return self.on_failed(node_id, e).await,
        };

        for target in targets {
            let step = self.branch_step(&node_id, &target)?;
            let execution_id = self.id.clone();
            let parent = node_id.clone();
            let branch = target.clone();
            let reporter: Reporter = Arc::new(move |signal| match signal {
                UnitSignal::Failed(e) => {
                    warn!(execution_id = %execution_id, node_id = %parent, branch = %branch, error = %e, "Async branch failed");
                }
                UnitSignal::Completed(_) => {
                    debug!(execution_id = %execution_id, node_id = %parent, branch = %branch, "Async branch completed");
                }
                _ => {}
            });
            StepExecutionUnit::new(target.clone(), step).launch(self.step_context(&target), reporter);
        }

        let state = self.holder.state.clone();
        self.on_completed(node_id, state).await
    }

    async fn spawn_subgraph(&mut self, node_id: String, graph_id: &str) -> Result<()> {
        let graph = self.library.get(graph_id).cloned().ok_or_else(|| {
            StrandError::config(format!(
                "node '{}' references unknown subgraph '{}'",
                node_id, graph_id
            ))
        })?;

        let child_id = self.id.child(&node_id, self.holder.seq);
        let (child_tx, mut child_rx) = mpsc::unbounded_channel();
        let (mut child, _watch) = ExecutionStateMachine::new(
            child_id.clone(),
            graph,
            self.library.clone(),
            self.shared.clone(),
            ReplyTo::parent(&self.id, node_id.clone()),
            child_tx,
            self.cancel.child_token(),
        );

        let existing = self.shared.log.replay(&child_id).await?;
        if existing.is_empty() {
            child.dispatch(Command::Start {
                state: self.holder.state.clone(),
                config: self.holder.config.clone(),
            });
        } else {
            child.restore(existing)?;
            child.dispatch(Command::Resume);
        }

        info!(execution_id = %self.id, node_id = %node_id, child_id = %child_id, graph = %graph_id, "Subgraph started");
        self.publish(EngineEvent::SubgraphStarted {
            execution_id: self.id.clone(),
            node_id: node_id.clone(),
            child_id,
        });
        child.spawn();

        // Forward the child's replies into this machine's mailbox.
        let tx = self.tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            while let Some(signal) = child_rx.recv().await {
                let (command, terminal) = match signal {
                    FlowData::Fragment(fragment) => (
                        Command::Progress {
                            node_id: node_id.clone(),
                            fragment,
                            epoch,
                        },
                        false,
                    ),
                    FlowData::Done(output) => (
                        Command::ActionCompleted {
                            node_id: node_id.clone(),
                            output,
                            epoch,
                        },
                        true,
                    ),
                    FlowData::Error(error) => (
                        Command::ActionFailed {
                            node_id: node_id.clone(),
                            error,
                            epoch,
                        },
                        true,
                    ),
                };
                if tx.send(command).is_err() || terminal {
                    break;
                }
            }
        });
        Ok(())
    }

    fn satisfied(&self, node_id: &str, branches: &[Branch]) -> Result<Vec<String>> {
        let mut targets = Vec::new();
        for branch in branches {
            let ok = branch.predicate.evaluate(&self.holder.state).map_err(|e| {
                StrandError::routing(
                    node_id,
                    format!("predicate for branch '{}' failed: {}", branch.target, e.message()),
                )
            })?;
            if ok {
                targets.push(branch.target.clone());
            }
        }
        Ok(targets)
    }

    fn branch_step(&self, node_id: &str, target: &str) -> Result<Arc<dyn Step>> {
        match self.graph.action(target) {
            Some(StepKind::Task(step)) => Ok(step.clone()),
            Some(other) => Err(StrandError::config(format!(
                "branch '{}' of '{}' is a {} step; branches must be tasks",
                target,
                node_id,
                other.name()
            ))),
            None => Err(StrandError::config(format!(
                "branch '{}' of '{}' is not registered in graph '{}'",
                target,
                node_id,
                self.graph.id()
            ))),
        }
    }

    fn step_context(&self, node_id: &str) -> StepContext {
        StepContext {
            execution_id: self.id.clone(),
            node_id: node_id.to_string(),
            state: self.holder.state.clone(),
            config: self.holder.config.clone(),
            buffers: self.shared.buffers.clone(),
        }
    }

    /// Start a unit for `target`, reporting into this machine's mailbox.
    fn launch(&self, target: &str, step: Arc<dyn Step>, branch_of: Option<&str>) {
        let tx = self.tx.clone();
        let epoch = self.epoch;
        let node = target.to_string();
        let parallel = branch_of.map(str::to_string);

        let reporter: Reporter = Arc::new(move |signal| {
            let command = match (signal, &parallel) {
                (UnitSignal::Started, _) => return,
                (UnitSignal::Progress(fragment), Some(p)) => Command::Progress {
                    node_id: p.clone(),
                    fragment,
                    epoch,
                },
                (UnitSignal::Progress(fragment), None) => Command::Progress {
                    node_id: node.clone(),
                    fragment,
                    epoch,
                },
                (UnitSignal::Completed(output), Some(p)) => Command::BranchCompleted {
                    parallel_id: p.clone(),
                    branch_id: node.clone(),
                    output,
                    epoch,
                },
                (UnitSignal::Completed(output), None) => Command::ActionCompleted {
                    node_id: node.clone(),
                    output,
                    epoch,
                },
                (UnitSignal::Failed(error), Some(p)) => Command::BranchFailed {
                    parallel_id: p.clone(),
                    branch_id: node.clone(),
                    error,
                    epoch,
                },
                (UnitSignal::Failed(error), None) => Command::ActionFailed {
                    node_id: node.clone(),
                    error,
                    epoch,
                },
            };
            let _ = tx.send(command);
        });

        StepExecutionUnit::new(target, step).launch(self.step_context(target), reporter);
    }

    fn route_from(&mut self, node_id: &str) -> Result<String> {
        let state = self.holder.state.clone();
        self.router.route(RouteContext {
            graph: &self.graph,
            current: node_id,
            state: &state,
            last_output: Some(&state),
        })
    }

    fn is_stale(&self, node_id: &str, epoch: u64, what: &str) -> bool {
        let stale = self.finished
            || epoch != self.epoch
            || self.holder.current_node.as_deref() != Some(node_id);
        if stale {
            warn!(execution_id = %self.id, node_id = %node_id, epoch, current_epoch = self.epoch, "Discarding stale {}", what);
        }
        stale
    }

    /// Persist an event, then apply it.
    async fn persist(&mut self, event: ExecutionEvent) -> Result<()> {
        let record = EventRecord::new(self.id.clone(), self.holder.seq + 1, event);
        self.shared.log.append(record.clone()).await?;
        self.holder.apply(&record)?;
        self.snapshot.send_replace(self.holder.clone());
        Ok(())
    }

    fn deliver_pending_failure(&mut self) {
        if let Some(error) = self.holder.take_failure() {
            self.snapshot.send_replace(self.holder.clone());
            self.finish_failed(error);
        }
    }

    fn finish_done(&mut self) {
        info!(execution_id = %self.id, keys = self.holder.state.len(), "Run completed");
        let _ = self.reply.send(FlowData::Done(self.holder.state.clone()));
        self.status.send_replace(RunStatus::Completed);
        self.publish(EngineEvent::RunCompleted {
            execution_id: self.id.clone(),
        });
        self.finished = true;
    }

    fn finish_failed(&mut self, error: StrandError) {
        info!(execution_id = %self.id, error = %error, "Run failed");
        self.publish(EngineEvent::RunFailed {
            execution_id: self.id.clone(),
            error: error.to_string(),
        });
        let _ = self.reply.send(FlowData::Error(error));
        self.status.send_replace(RunStatus::Failed);
        self.finished = true;
    }

    fn on_cancelled(&mut self) {
        info!(execution_id = %self.id, "Run cancelled");
        self.status.send_replace(RunStatus::Cancelled);
        self.publish(EngineEvent::RunCancelled {
            execution_id: self.id.clone(),
        });
        self.finished = true;
    }

    fn publish(&self, event: EngineEvent) {
        self.shared.bus.publish(event);
    }
}
