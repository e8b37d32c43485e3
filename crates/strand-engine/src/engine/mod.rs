//! Engine facades: one contract, a durable and a future-based implementation.

pub mod durable;
pub mod future_engine;
pub mod handle;

use std::sync::Arc;

use futures::future::BoxFuture;

use strand_core::error::Result;
use strand_core::state::GlobalState;
use strand_core::types::RunConfig;

use crate::graph::CompiledGraph;

pub use durable::DurableEngine;
pub use future_engine::FutureEngine;
pub use handle::RunHandle;

/// Starts runs of compiled graphs.
pub trait Engine: Send + Sync {
    /// Start a run and return its handle immediately.
    fn start(
        &self,
        graph: Arc<CompiledGraph>,
        input: GlobalState,
        config: RunConfig,
    ) -> BoxFuture<'_, Result<RunHandle>>;

    /// Start a run and wait for its final state.
    fn execute(
        &self,
        graph: Arc<CompiledGraph>,
        input: GlobalState,
        config: RunConfig,
    ) -> BoxFuture<'_, Result<GlobalState>> {
        Box::pin(async move { self.start(graph, input, config).await?.result().await })
    }
}
