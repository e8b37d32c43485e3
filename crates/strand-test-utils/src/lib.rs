//! Fixtures shared by the Strand test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use strand_core::error::{Result, StrandError};
use strand_core::record::{EventRecord, ExecutionEvent, ReplyTo};
use strand_core::state::GlobalState;
use strand_core::traits::EventLog;
use strand_core::types::{ExecutionId, RunConfig};
use strand_store::MemoryEventLog;
use strand_stream::FlowDataChunk;

/// Build a state from key/value pairs, keeping their order.
pub fn state(pairs: &[(&str, Value)]) -> GlobalState {
    pairs
        .iter()
        .fold(GlobalState::new(), |acc, (k, v)| acc.with(*k, v.clone()))
}

/// The keys of `state` in insertion order.
pub fn keys(state: &GlobalState) -> Vec<String> {
    state.keys().map(str::to_string).collect()
}

/// A `START` record for `id` with the given entry and input.
pub fn start_record(id: &ExecutionId, entry: &str, input: GlobalState) -> EventRecord {
    EventRecord::new(
        id.clone(),
        1,
        ExecutionEvent::Start {
            entry: entry.to_string(),
            state: input,
            config: RunConfig::default(),
            reply_to: ReplyTo::caller(id),
        },
    )
}

/// A `NODE_EXECUTED` record for a plain node.
pub fn executed_record(id: &ExecutionId, seq: u64, node_id: &str, output: GlobalState) -> EventRecord {
    EventRecord::new(
        id.clone(),
        seq,
        ExecutionEvent::NodeExecuted {
            node_id: node_id.to_string(),
            output,
            reply_to: ReplyTo::caller(id),
            branch_of: None,
        },
    )
}

/// Text chunks numbered `0..count` on `buffer_id`.
pub fn text_chunks(buffer_id: &str, count: usize) -> Vec<FlowDataChunk> {
    (0..count)
        .map(|i| FlowDataChunk::text(buffer_id, format!("chunk-{}", i)))
        .collect()
}

/// In-memory event log that starts rejecting appends after a fixed number
/// of successful ones.
pub struct FailingEventLog {
    inner: MemoryEventLog,
    remaining: AtomicUsize,
}

impl FailingEventLog {
    pub fn after(successful_appends: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryEventLog::new(),
            remaining: AtomicUsize::new(successful_appends),
        })
    }
}

impl EventLog for FailingEventLog {
    fn append(&self, record: EventRecord) -> BoxFuture<'_, Result<()>> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Box::pin(async { Err(StrandError::event_log("disk full")) });
        }
        self.inner.append(record)
    }

    fn replay(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Vec<EventRecord>>> {
        self.inner.replay(execution_id)
    }

    fn executions(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>> {
        self.inner.executions()
    }

    fn purge(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<usize>> {
        self.inner.purge(execution_id)
    }
}

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
