//! The durable execution state machine.
//!
//! One [`ExecutionStateMachine`] drives one run of a compiled graph. It reads
//! [`Command`]s from a private mailbox and handles each to completion before
//! taking the next, so its [`StateHolder`] needs no locking even while
//! parallel branches execute on other tasks.
//!
//! Every step outcome is appended to the [`EventLog`](strand_core::EventLog)
//! before it is applied. Replaying the log through [`StateHolder::apply`] and
//! the run's router restores the run exactly where it stopped.

pub mod command;
pub mod holder;
pub mod runner;

pub use command::Command;
pub use holder::{ParallelProgress, StateHolder, LAST_ERROR_KEY};
pub use runner::ExecutionStateMachine;

pub(crate) use runner::{MachineShared, MachineWatch, ReplySink};
