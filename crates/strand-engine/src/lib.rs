pub mod engine;
pub mod graph;
pub mod machine;
pub mod run_log;
pub mod step;
pub mod unit;

pub use engine::{DurableEngine, Engine, FutureEngine, RunHandle};
pub use graph::{
    compile, Branch, CompiledGraph, Edge, GraphDefinition, Predicate, PredicateRouter, RouteContext,
    Router, RouterFactory, SequentialRouter, StepDefinition, StepKind, SubgraphDef, TableRouter,
    Transition, TransitionRouter,
};
pub use machine::{Command, ExecutionStateMachine, StateHolder, LAST_ERROR_KEY};
pub use run_log::RunLogger;
pub use step::{async_step, set_key, step_fn, stream_step, Step, StepContext, StepOutput, StepStream};
pub use unit::{StepExecutionUnit, UnitSignal};
