use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::types::is_terminal;

use super::definition::{Edge, GraphDefinition, StepDefinition, StepKind};
use super::predicate::Predicate;

/// Subgraphs reachable from a compiled graph, by id.
pub type SubgraphLibrary = BTreeMap<String, Arc<CompiledGraph>>;

/// One outgoing route of a node.
#[derive(Debug, Clone)]
pub struct Route {
    pub label: String,
    pub target: String,
    pub guard: Predicate,
}

/// Immutable, query-optimized form of a graph definition.
///
/// Holds the `node → action` lookup, the `from → [route]` table, the error
/// routes, and the entry id. Targets are not checked here; an unknown target
/// is reported when first traversed, or by [`validate`](Self::validate).
#[derive(Debug)]
pub struct CompiledGraph {
    id: String,
    entry: String,
    order: Vec<String>,
    actions: HashMap<String, StepKind>,
    descriptions: HashMap<String, String>,
    routes: HashMap<String, Vec<Route>>,
    error_routes: HashMap<String, String>,
    subgraphs: Arc<SubgraphLibrary>,
}

/// Compile steps and edges into a graph with no subgraph library.
pub fn compile(steps: Vec<StepDefinition>, edges: Vec<Edge>, entry: &str) -> Result<CompiledGraph> {
    CompiledGraph::build("main", steps, edges, entry, Arc::new(SubgraphLibrary::new()))
}

impl CompiledGraph {
    pub(crate) fn from_definition(def: GraphDefinition) -> Result<Self> {
        let mut library = SubgraphLibrary::new();
        for (id, sub) in def.subgraphs {
            let compiled = Self::build(&id, sub.steps, sub.edges, &sub.entry, Arc::new(SubgraphLibrary::new()))?;
            library.insert(id, Arc::new(compiled));
        }
        Self::build("main", def.steps, def.edges, &def.entry, Arc::new(library))
    }

    fn build(
        id: &str,
        steps: Vec<StepDefinition>,
        edges: Vec<Edge>,
        entry: &str,
        subgraphs: Arc<SubgraphLibrary>,
    ) -> Result<Self> {
        let mut order = Vec::with_capacity(steps.len());
        let mut actions = HashMap::new();
        let mut descriptions = HashMap::new();
        let mut routes: HashMap<String, Vec<Route>> = HashMap::new();
        let mut error_routes = HashMap::new();

        for step in steps {
            if is_terminal(&step.name) {
                return Err(StrandError::config(format!(
                    "graph '{}': '{}' is reserved as the terminal marker",
                    id, step.name
                )));
            }
            if actions.contains_key(&step.name) {
                return Err(StrandError::config(format!(
                    "graph '{}': duplicate step '{}'",
                    id, step.name
                )));
            }

            let table = routes.entry(step.name.clone()).or_default();
            for t in step.transitions {
                table.push(Route {
                    label: t.label.unwrap_or_else(|| t.target.clone()),
                    target: t.target,
                    guard: t.guard,
                });
            }
            if let Some(on_error) = step.on_error {
                error_routes.insert(step.name.clone(), on_error.target);
            }
            if let Some(description) = step.description {
                descriptions.insert(step.name.clone(), description);
            }
            order.push(step.name.clone());
            actions.insert(step.name, step.kind);
        }

        if !actions.contains_key(entry) {
            return Err(StrandError::config(format!(
                "graph '{}': entry step '{}' is not defined",
                id, entry
            )));
        }

        for edge in edges {
            routes.entry(edge.from).or_default().push(Route {
                label: edge.label,
                target: edge.to,
                guard: Predicate::Always,
            });
        }
        routes.retain(|_, r| !r.is_empty());

        debug!(graph = %id, steps = order.len(), entry = %entry, "Graph compiled");
        Ok(Self {
            id: id.to_string(),
            entry: entry.to_string(),
            order,
            actions,
            descriptions,
            routes,
            error_routes,
            subgraphs,
        })
    }

    /// `"main"` for a top-level graph, otherwise the subgraph id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Step ids in declaration order.
    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.actions.contains_key(node_id)
    }

    pub fn action(&self, node_id: &str) -> Option<&StepKind> {
        self.actions.get(node_id)
    }

    pub fn description(&self, node_id: &str) -> Option<&str> {
        self.descriptions.get(node_id).map(String::as_str)
    }

    /// Outgoing routes of `from`, transitions first, then edges.
    pub fn routes(&self, from: &str) -> &[Route] {
        self.routes.get(from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Target of the first route from `from` labeled `label`.
    pub fn route(&self, from: &str, label: &str) -> Option<&str> {
        self.routes(from)
            .iter()
            .find(|r| r.label == label)
            .map(|r| r.target.as_str())
    }

    pub fn error_route(&self, node_id: &str) -> Option<&str> {
        self.error_routes.get(node_id).map(String::as_str)
    }

    pub fn subgraph(&self, id: &str) -> Option<&Arc<CompiledGraph>> {
        self.subgraphs.get(id)
    }

    pub fn library(&self) -> &Arc<SubgraphLibrary> {
        &self.subgraphs
    }

    /// Check every route, error route, branch, and subgraph reference of this
    /// graph and its subgraphs.
    pub fn validate(&self) -> Result<()> {
        self.validate_with(&self.subgraphs)?;
        for sub in self.subgraphs.values() {
            sub.validate_with(&self.subgraphs)?;
        }
        Ok(())
    }

    fn validate_with(&self, library: &SubgraphLibrary) -> Result<()> {
        let check = |from: &str, target: &str| -> Result<()> {
            if is_terminal(target) || self.contains(target) {
                Ok(())
            } else {
                Err(StrandError::config(format!(
                    "graph '{}': '{}' routes to undefined step '{}'",
                    self.id, from, target
                )))
            }
        };

        for (from, routes) in &self.routes {
            if !self.contains(from) {
                return Err(StrandError::config(format!(
                    "graph '{}': edge from undefined step '{}'",
                    self.id, from
                )));
            }
            for route in routes {
                check(from, &route.target)?;
            }
        }
        for (from, target) in &self.error_routes {
            check(from, target)?;
        }

        for (name, kind) in &self.actions {
            match kind {
                StepKind::Parallel(branches) | StepKind::Async(branches) => {
                    for branch in branches {
                        if !matches!(self.action(&branch.target), Some(StepKind::Task(_))) {
                            return Err(StrandError::config(format!(
                                "graph '{}': branch '{}' of '{}' must name a task step",
                                self.id, branch.target, name
                            )));
                        }
                    }
                }
                StepKind::Subgraph(id) if !library.contains_key(id) => {
                    return Err(StrandError::config(format!(
                        "graph '{}': step '{}' references unknown subgraph '{}'",
                        self.id, name, id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
