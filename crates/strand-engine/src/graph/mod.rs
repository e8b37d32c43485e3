//! Graph definitions, the compiler, and routing strategies.

pub mod compiler;
pub mod definition;
pub mod predicate;
pub mod router;

pub use compiler::{compile, CompiledGraph, Route, SubgraphLibrary};
pub use definition::{Branch, Edge, GraphDefinition, StepDefinition, StepKind, SubgraphDef, Transition};
pub use predicate::{evaluate_condition, Predicate};
pub use router::{
    transition_routers, PredicateRouter, RouteContext, Router, RouterFactory, SequentialRouter,
    TableRouter, TransitionRouter,
};
