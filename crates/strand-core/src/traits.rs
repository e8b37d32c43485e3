use futures::future::BoxFuture;

use crate::error::Result;
use crate::record::EventRecord;
use crate::types::ExecutionId;

/// Append-only persistence backend for durable runs.
///
/// Implementations must return records of one execution in the order they
/// were appended; recovery depends on faithful replay order.
pub trait EventLog: Send + Sync + 'static {
    /// Append one record to its execution's log.
    fn append(&self, record: EventRecord) -> BoxFuture<'_, Result<()>>;

    /// All records of an execution, in append order.
    fn replay(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Vec<EventRecord>>>;

    /// Ids of every execution with at least one record.
    fn executions(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>>;

    /// Delete an execution's records. Returns how many were removed.
    fn purge(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<usize>>;
}
