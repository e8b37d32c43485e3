use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use strand_core::error::Result;

use super::compiler::CompiledGraph;
use super::predicate::Predicate;
use crate::step::Step;

/// A guarded edge from one step to a named target.
#[derive(Debug, Clone)]
pub struct Transition {
    pub guard: Predicate,
    pub target: String,
    /// Routing-table label. Defaults to the target name.
    pub label: Option<String>,
}

impl Transition {
    /// Unconditional transition.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            guard: Predicate::Always,
            target: target.into(),
            label: None,
        }
    }

    pub fn when(guard: Predicate, target: impl Into<String>) -> Self {
        Self {
            guard,
            target: target.into(),
            label: None,
        }
    }

    /// Transition guarded by an expression such as `status == "ok"`.
    pub fn when_expr(expr: impl Into<String>, target: impl Into<String>) -> Self {
        Self::when(Predicate::expr(expr), target)
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// One branch of a parallel or async step.
#[derive(Debug, Clone)]
pub struct Branch {
    pub predicate: Predicate,
    pub target: String,
}

impl Branch {
    pub fn always(target: impl Into<String>) -> Self {
        Self {
            predicate: Predicate::Always,
            target: target.into(),
        }
    }

    pub fn when(predicate: Predicate, target: impl Into<String>) -> Self {
        Self {
            predicate,
            target: target.into(),
        }
    }
}

/// What a step does when dispatched.
#[derive(Clone)]
pub enum StepKind {
    /// Run the step's logic.
    Task(Arc<dyn Step>),
    /// Run every satisfied branch concurrently and join them.
    Parallel(Vec<Branch>),
    /// Start every satisfied branch without waiting for it.
    Async(Vec<Branch>),
    /// Run the named subgraph as a nested execution.
    Subgraph(String),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Parallel(_) => "parallel",
            Self::Async(_) => "async",
            Self::Subgraph(_) => "subgraph",
        }
    }
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(_) => write!(f, "Task(..)"),
            Self::Parallel(b) => f.debug_tuple("Parallel").field(b).finish(),
            Self::Async(b) => f.debug_tuple("Async").field(b).finish(),
            Self::Subgraph(id) => f.debug_tuple("Subgraph").field(id).finish(),
        }
    }
}

/// A named step of a graph.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub name: String,
    pub description: Option<String>,
    pub kind: StepKind,
    /// Evaluated in declaration order; first match wins.
    pub transitions: Vec<Transition>,
    /// Taken instead of failing the run when the step fails.
    pub on_error: Option<Transition>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            description: None,
            kind,
            transitions: Vec::new(),
            on_error: None,
        }
    }

    pub fn task(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self::new(name, StepKind::Task(step))
    }

    pub fn parallel(name: impl Into<String>, branches: Vec<Branch>) -> Self {
        Self::new(name, StepKind::Parallel(branches))
    }

    pub fn fan_out(name: impl Into<String>, branches: Vec<Branch>) -> Self {
        Self::new(name, StepKind::Async(branches))
    }

    pub fn subgraph(name: impl Into<String>, graph_id: impl Into<String>) -> Self {
        Self::new(name, StepKind::Subgraph(graph_id.into()))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add an unconditional transition to `target`.
    pub fn then(self, target: impl Into<String>) -> Self {
        self.transition(Transition::to(target))
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn on_error(mut self, target: impl Into<String>) -> Self {
        self.on_error = Some(Transition::to(target));
        self
    }
}

/// A labeled edge `(from, label, to)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub label: String,
    pub to: String,
}

impl Edge {
    /// Edge with the empty (default) label.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::labeled(from, "", to)
    }

    pub fn labeled(from: impl Into<String>, label: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            label: label.into(),
            to: to.into(),
        }
    }
}

/// A reusable nested graph.
#[derive(Debug, Clone, Default)]
pub struct SubgraphDef {
    pub steps: Vec<StepDefinition>,
    pub edges: Vec<Edge>,
    pub entry: String,
}

impl SubgraphDef {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            ..Self::default()
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }
}

/// Steps, edges, entry, and the subgraphs any step may reference.
#[derive(Debug, Clone, Default)]
pub struct GraphDefinition {
    pub steps: Vec<StepDefinition>,
    pub edges: Vec<Edge>,
    pub entry: String,
    pub subgraphs: BTreeMap<String, SubgraphDef>,
}

impl GraphDefinition {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            ..Self::default()
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn subgraph(mut self, id: impl Into<String>, def: SubgraphDef) -> Self {
        self.subgraphs.insert(id.into(), def);
        self
    }

    /// Compile into an immutable, shareable graph.
    pub fn compile(self) -> Result<Arc<CompiledGraph>> {
        CompiledGraph::from_definition(self).map(Arc::new)
    }
}
