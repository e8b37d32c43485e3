pub mod config;
pub mod error;
pub mod event;
pub mod flow_data;
pub mod record;
pub mod state;
pub mod traits;
pub mod types;

pub use config::StrandConfig;
pub use error::{Result, StrandError};
pub use event::EventBus;
pub use flow_data::FlowData;
pub use record::{EventRecord, ExecutionEvent, ReplyTo};
pub use state::GlobalState;
pub use traits::EventLog;
pub use types::*;
