use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use strand_core::error::{Result, StrandError};
use strand_core::record::{EventRecord, ExecutionEvent};
use strand_core::traits::EventLog;
use strand_core::types::ExecutionId;

/// Persistent event log backed by SQLite.
///
/// One row per record. The event body is stored as JSON next to a few
/// denormalized columns (`kind`, `node_id`) for inspection from the CLI.
pub struct SqliteEventLog {
    conn: Mutex<Connection>,
}

impl SqliteEventLog {
    /// Open or create the event database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StrandError::event_log(format!("Failed to create store directory: {}", e)))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| StrandError::event_log(format!("Failed to open event log: {}", e)))?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "Event log opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StrandError::event_log(format!("Failed to open in-memory event log: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 execution_id TEXT NOT NULL,
                 seq INTEGER NOT NULL,
                 kind TEXT NOT NULL,
                 node_id TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 timestamp TEXT NOT NULL,
                 UNIQUE(execution_id, seq)
             );

             CREATE INDEX IF NOT EXISTS idx_events_execution
                 ON events(execution_id, seq);",
        )
        .map_err(|e| StrandError::event_log(format!("Failed to initialize event schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append_sync(&self, record: &EventRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.event)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| StrandError::event_log(e.to_string()))?;

        let last: Option<i64> = conn
            .query_row(
                "SELECT MAX(seq) FROM events WHERE execution_id = ?1",
                params![record.execution_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StrandError::event_log(format!("Failed to read last seq: {}", e)))?
            .flatten();
        let expected = last.unwrap_or(0) as u64 + 1;
        if record.seq != expected {
            return Err(StrandError::event_log(format!(
                "out-of-order append for {}: expected seq {}, got {}",
                record.execution_id, expected, record.seq
            )));
        }

        conn.execute(
            "INSERT INTO events (execution_id, seq, kind, node_id, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.execution_id.as_str(),
                record.seq as i64,
                record.event.kind(),
                record.event.node_id(),
                payload,
                record.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| StrandError::event_log(format!("Failed to append event: {}", e)))?;

        debug!(execution_id = %record.execution_id, seq = record.seq, kind = record.event.kind(), "Event appended");
        Ok(())
    }

    fn replay_sync(&self, execution_id: &ExecutionId) -> Result<Vec<EventRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StrandError::event_log(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT seq, payload, timestamp FROM events
                 WHERE execution_id = ?1
                 ORDER BY seq ASC",
            )
            .map_err(|e| StrandError::event_log(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![execution_id.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| StrandError::event_log(format!("Failed to query events: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            let (seq, payload, ts) =
                row.map_err(|e| StrandError::event_log(format!("Failed to read event row: {}", e)))?;
            let event: ExecutionEvent = serde_json::from_str(&payload).map_err(|e| {
                StrandError::recovery(format!("corrupt event #{} of {}: {}", seq, execution_id, e))
            })?;
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    StrandError::recovery(format!("bad timestamp on event #{} of {}: {}", seq, execution_id, e))
                })?;
            records.push(EventRecord {
                execution_id: execution_id.clone(),
                seq: seq as u64,
                timestamp,
                event,
            });
        }
        Ok(records)
    }

    fn executions_sync(&self) -> Result<Vec<ExecutionId>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StrandError::event_log(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT execution_id FROM events ORDER BY execution_id")
            .map_err(|e| StrandError::event_log(format!("Failed to prepare query: {}", e)))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StrandError::event_log(format!("Failed to list executions: {}", e)))?
            .filter_map(|r| r.ok())
            .map(ExecutionId)
            .collect();
        Ok(ids)
    }

    fn purge_sync(&self, execution_id: &ExecutionId) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StrandError::event_log(e.to_string()))?;
        conn.execute(
            "DELETE FROM events WHERE execution_id = ?1",
            params![execution_id.as_str()],
        )
        .map_err(|e| StrandError::event_log(format!("Failed to purge events: {}", e)))
    }

    /// Raw access for corruption tests.
    #[cfg(test)]
    fn overwrite_payload(&self, execution_id: &ExecutionId, seq: u64, payload: &str) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE events SET payload = ?1 WHERE execution_id = ?2 AND seq = ?3",
            params![payload, execution_id.as_str(), seq as i64],
        )
        .unwrap();
    }
}

impl EventLog for SqliteEventLog {
    fn append(&self, record: EventRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.append_sync(&record) })
    }

    fn replay(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Vec<EventRecord>>> {
        let execution_id = execution_id.clone();
        Box::pin(async move { self.replay_sync(&execution_id) })
    }

    fn executions(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>> {
        Box::pin(async move { self.executions_sync() })
    }

    fn purge(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<usize>> {
        let execution_id = execution_id.clone();
        Box::pin(async move { self.purge_sync(&execution_id) })
    }
}
