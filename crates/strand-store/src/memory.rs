use std::collections::BTreeMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::record::EventRecord;
use strand_core::traits::EventLog;
use strand_core::types::ExecutionId;

/// Process-local event log.
///
/// Records are kept serialized so replay goes through the same JSON
/// round trip as a persistent backend.
#[derive(Default)]
pub struct MemoryEventLog {
    runs: Mutex<BTreeMap<ExecutionId, Vec<String>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all executions.
    pub fn len(&self) -> usize {
        self.runs
            .lock()
            .map(|runs| runs.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite the raw JSON of one stored record (for corruption tests).
    pub fn tamper(&self, execution_id: &ExecutionId, index: usize, raw: impl Into<String>) -> bool {
        let mut runs = match self.runs.lock() {
            Ok(runs) => runs,
            Err(_) => return false,
        };
        match runs.get_mut(execution_id).and_then(|r| r.get_mut(index)) {
            Some(slot) => {
                *slot = raw.into();
                true
            }
            None => false,
        }
    }
}

impl EventLog for MemoryEventLog {
    fn append(&self, record: EventRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let line = serde_json::to_string(&record)?;
            let mut runs = self
                .runs
                .lock()
                .map_err(|e| StrandError::event_log(e.to_string()))?;
            let entries = runs.entry(record.execution_id.clone()).or_default();

            let expected = entries.len() as u64 + 1;
            if record.seq != expected {
                return Err(StrandError::event_log(format!(
                    "out-of-order append for {}: expected seq {}, got {}",
                    record.execution_id, expected, record.seq
                )));
            }

            entries.push(line);
            debug!(execution_id = %record.execution_id, seq = record.seq, kind = record.event.kind(), "Event appended");
            Ok(())
        })
    }

    fn replay(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Vec<EventRecord>>> {
        let execution_id = execution_id.clone();
        Box::pin(async move {
            let lines = {
                let runs = self
                    .runs
                    .lock()
                    .map_err(|e| StrandError::event_log(e.to_string()))?;
                runs.get(&execution_id).cloned().unwrap_or_default()
            };

            lines
                .iter()
                .enumerate()
                .map(|(i, line)| {
                    serde_json::from_str(line).map_err(|e| {
                        StrandError::recovery(format!(
                            "corrupt event #{} of {}: {}",
                            i + 1,
                            execution_id,
                            e
                        ))
                    })
                })
                .collect()
        })
    }

    fn executions(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>> {
        Box::pin(async move {
            let runs = self
                .runs
                .lock()
                .map_err(|e| StrandError::event_log(e.to_string()))?;
            Ok(runs.keys().cloned().collect())
        })
    }

    fn purge(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<usize>> {
        let execution_id = execution_id.clone();
        Box::pin(async move {
            let mut runs = self
                .runs
                .lock()
                .map_err(|e| StrandError::event_log(e.to_string()))?;
            Ok(runs.remove(&execution_id).map(|r| r.len()).unwrap_or(0))
        })
    }
}
