pub mod memory;
pub mod sqlite;

pub use memory::MemoryEventLog;
pub use sqlite::SqliteEventLog;

use std::sync::Arc;

use strand_core::config::{StoreBackend, StoreConfig};
use strand_core::error::Result;
use strand_core::traits::EventLog;

/// Open the event log selected by `config`.
pub fn open_event_log(config: &StoreConfig) -> Result<Arc<dyn EventLog>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryEventLog::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteEventLog::open(&config.resolved_path())?)),
    }
}
