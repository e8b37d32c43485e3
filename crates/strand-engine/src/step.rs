use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};

use strand_core::error::Result;
use strand_core::flow_data::FlowData;
use strand_core::state::GlobalState;
use strand_core::types::{ExecutionId, RunConfig};
use strand_stream::{BufferRegistry, BufferWriter};

/// A stream of signals produced by a streaming step.
pub type StepStream = BoxStream<'static, FlowData<GlobalState>>;

/// What a step body hands back.
pub enum StepOutput {
    /// The step finished with this state.
    State(GlobalState),
    /// The step emits fragments and must end with `Done` or `Error`.
    Stream(StepStream),
}

impl std::fmt::Debug for StepOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State(state) => f.debug_tuple("State").field(state).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Everything a step sees when invoked.
#[derive(Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub state: GlobalState,
    pub config: RunConfig,
    pub buffers: Arc<BufferRegistry>,
}

impl StepContext {
    pub fn new(node_id: impl Into<String>, state: GlobalState) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            node_id: node_id.into(),
            state,
            config: RunConfig::default(),
            buffers: Arc::new(BufferRegistry::new()),
        }
    }

    /// Writer on buffer `id`, stamped with this step as the source.
    pub fn buffer(&self, id: &str) -> BufferWriter {
        self.buffers.acquire_buffer(id).for_step(self.node_id.clone())
    }
}

/// The logic behind one task node.
///
/// Implementations receive the committed state and return the next state,
/// either at once or as a stream of fragments ending in a terminal signal.
pub trait Step: Send + Sync + 'static {
    fn call(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>>;
}

struct FnStep<F>(F);

impl<F> Step for FnStep<F>
where
    F: Fn(StepContext) -> Result<GlobalState> + Send + Sync + 'static,
{
    fn call(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move { (self.0)(ctx).map(StepOutput::State) })
    }
}

struct AsyncFnStep<F>(F);

impl<F, Fut> Step for AsyncFnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GlobalState>> + Send + 'static,
{
    fn call(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>> {
        let fut = (self.0)(ctx);
        Box::pin(async move { fut.await.map(StepOutput::State) })
    }
}

struct StreamFnStep<F>(F);

impl<F, S> Step for StreamFnStep<F>
where
    F: Fn(StepContext) -> S + Send + Sync + 'static,
    S: Stream<Item = FlowData<GlobalState>> + Send + 'static,
{
    fn call(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>> {
        let stream = (self.0)(ctx).boxed();
        Box::pin(async move { Ok(StepOutput::Stream(stream)) })
    }
}

/// Wrap a synchronous function as a step.
pub fn step_fn<F>(f: F) -> Arc<dyn Step>
where
    F: Fn(StepContext) -> Result<GlobalState> + Send + Sync + 'static,
{
    Arc::new(FnStep(f))
}

/// Wrap an async function as a step.
pub fn async_step<F, Fut>(f: F) -> Arc<dyn Step>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GlobalState>> + Send + 'static,
{
    Arc::new(AsyncFnStep(f))
}

/// Wrap a function returning a stream of signals as a step.
pub fn stream_step<F, S>(f: F) -> Arc<dyn Step>
where
    F: Fn(StepContext) -> S + Send + Sync + 'static,
    S: Stream<Item = FlowData<GlobalState>> + Send + 'static,
{
    Arc::new(StreamFnStep(f))
}

/// A step that sets `key` to `value` and does nothing else.
pub fn set_key(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Arc<dyn Step> {
    let key = key.into();
    let value = value.into();
    step_fn(move |ctx| Ok(ctx.state.with(key.clone(), value.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;
    use strand_core::error::StrandError;

    #[tokio::test]
    async fn test_sync_step() {
        let step = step_fn(|ctx| Ok(ctx.state.with("a", 1)));
        let out = step.call(StepContext::new("a", GlobalState::new())).await.unwrap();
        match out {
            StepOutput::State(s) => assert_eq!(s.get("a"), Some(&json!(1))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_async_step_error() {
        let step = async_step(|ctx| async move {
            Err::<GlobalState, _>(StrandError::step(ctx.node_id, "nope"))
        });
        let err = step
            .call(StepContext::new("b", GlobalState::new()))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "nope");
    }

    #[tokio::test]
    async fn test_stream_step() {
        let step = stream_step(|ctx| {
            stream::iter(vec![
                FlowData::fragment(ctx.state.with("part", 1)),
                FlowData::done(ctx.state.with("part", 2)),
            ])
        });
        let out = step.call(StepContext::new("s", GlobalState::new())).await.unwrap();
        let StepOutput::Stream(s) = out else {
            panic!("expected stream");
        };
        let items: Vec<_> = s.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_done());
    }

    #[tokio::test]
    async fn test_context_buffer_stamps_source() {
        let ctx = StepContext::new("writer", GlobalState::new());
        ctx.buffer("notes").text("hello").unwrap();
        let chunks = ctx.buffers.get_buffer("notes").unwrap().snapshot();
        assert_eq!(chunks[0].source_step.as_deref(), Some("writer"));
    }
}
