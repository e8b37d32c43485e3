use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use strand_core::config::EngineSettings;
use strand_core::error::{Result, StrandError};
use strand_core::event::EventBus;
use strand_core::record::ReplyTo;
use strand_core::state::GlobalState;
use strand_core::traits::EventLog;
use strand_core::types::{ExecutionId, RunConfig};
use strand_stream::BufferRegistry;

use super::handle::RunHandle;
use super::Engine;
use crate::graph::{transition_routers, CompiledGraph, RouterFactory};
use crate::machine::{Command, ExecutionStateMachine, MachineShared, StateHolder};

/// Event-sourced engine: every run is an [`ExecutionStateMachine`] whose
/// progress is appended to an [`EventLog`] and can be recovered after a
/// restart.
pub struct DurableEngine {
    log: Arc<dyn EventLog>,
    bus: Arc<EventBus>,
    buffers: Arc<BufferRegistry>,
    routers: RouterFactory,
    settings: EngineSettings,
}

impl DurableEngine {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        let settings = EngineSettings::default();
        Self {
            log,
            bus: Arc::new(EventBus::new(settings.event_bus_capacity)),
            buffers: Arc::new(BufferRegistry::new()),
            routers: transition_routers(),
            settings,
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
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

    /// Use a different routing strategy. Each run gets its own router.
    pub fn with_routers(mut self, routers: RouterFactory) -> Self {
        self.routers = routers;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn buffers(&self) -> &Arc<BufferRegistry> {
        &self.buffers
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    fn shared(&self) -> Arc<MachineShared> {
        Arc::new(MachineShared {
            log: self.log.clone(),
            bus: self.bus.clone(),
            buffers: self.buffers.clone(),
            routers: self.routers.clone(),
            settings: self.settings.clone(),
        })
    }

    fn machine(
        &self,
        id: ExecutionId,
        graph: Arc<CompiledGraph>,
    ) -> (ExecutionStateMachine, RunHandle) {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let library = graph.library().clone();
        let (machine, watch) = ExecutionStateMachine::new(
            id.clone(),
            graph,
            library,
            self.shared(),
            ReplyTo::caller(&id),
            reply_tx,
            cancel.clone(),
        );
        let handle = RunHandle::new(id, reply_rx, watch.status, Some(watch.holder), cancel);
        (machine, handle)
    }

    /// Start a run under a caller-chosen id.
    pub async fn start_with_id(
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
        if !self.log.replay(&id).await?.is_empty() {
            return Err(StrandError::config(format!(
                "execution {} already exists; recover it instead",
                id
            )));
        }

        let (machine, handle) = self.machine(id, graph);
        machine.dispatch(Command::Start {
            state: input,
            config,
        });
        machine.spawn();
        Ok(handle)
    }

    /// Rebuild a run from its event log and continue it, delivering to a
    /// fresh handle. Completed steps are not executed again.
    pub async fn recover(&self, graph: Arc<CompiledGraph>, id: &ExecutionId) -> Result<RunHandle> {
        if self.settings.validate_edges {
            graph.validate()?;
        }
        let records = self.log.replay(id).await?;
        let (mut machine, handle) = self.machine(id.clone(), graph);
        let replayed = machine.restore(records)?;
        info!(execution_id = %id, replayed, "Recovering run");
        machine.dispatch(Command::Resume);
        machine.spawn();
        Ok(handle)
    }

    /// Replay a run's log into a holder without resuming it.
    pub async fn inspect(&self, graph: Arc<CompiledGraph>, id: &ExecutionId) -> Result<StateHolder> {
        let records = self.log.replay(id).await?;
        let (mut machine, _handle) = self.machine(id.clone(), graph);
        machine.restore(records)?;
        Ok(machine.holder().clone())
    }

    /// Top-level runs present in the event log.
    pub async fn pending_executions(&self) -> Result<Vec<ExecutionId>> {
        let ids = self.log.executions().await?;
        Ok(ids.into_iter().filter(|id| !id.is_child()).collect())
    }

    /// Delete a run's events, including those of its subgraph runs.
    pub async fn release(&self, id: &ExecutionId) -> Result<usize> {
        let prefix = format!("{}/", id);
        let mut removed = self.log.purge(id).await?;
        for child in self.log.executions().await? {
            if child.as_str().starts_with(&prefix) {
                removed += self.log.purge(&child).await?;
            }
        }
        info!(execution_id = %id, removed, "Run released");
        Ok(removed)
    }
}

impl Engine for DurableEngine {
    fn start(
        &self,
        graph: Arc<CompiledGraph>,
        input: GlobalState,
        config: RunConfig,
    ) -> BoxFuture<'_, Result<RunHandle>> {
        Box::pin(self.start_with_id(ExecutionId::new(), graph, input, config))
    }
}
