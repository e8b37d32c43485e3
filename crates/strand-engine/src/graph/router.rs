use std::sync::Arc;

use strand_core::error::{Result, StrandError};
use strand_core::state::GlobalState;
use strand_core::types::END;

use super::compiler::CompiledGraph;
use super::predicate::Predicate;

/// Inputs to one routing decision.
#[derive(Clone, Copy)]
pub struct RouteContext<'a> {
    pub graph: &'a CompiledGraph,
    /// The node that just completed.
    pub current: &'a str,
    /// Global state after the node committed.
    pub state: &'a GlobalState,
    /// The node's own output, when it differs from `state`.
    pub last_output: Option<&'a GlobalState>,
}

/// Picks the next node id after a node completes.
///
/// Routers may keep state (see [`SequentialRouter`]); each running graph
/// instance owns its router exclusively. Routing must be deterministic for a
/// given sequence of calls, since recovery rebuilds router state by replaying
/// the same calls.
pub trait Router: Send {
    fn route(&mut self, ctx: RouteContext<'_>) -> Result<String>;
}

/// Builds a fresh router for every graph instance, including subgraphs.
pub type RouterFactory = Arc<dyn Fn(&CompiledGraph) -> Box<dyn Router> + Send + Sync>;

/// Factory for the default [`TransitionRouter`].
pub fn transition_routers() -> RouterFactory {
    Arc::new(|_| Box::new(TransitionRouter))
}

/// Walks the node's routes in order and takes the first whose guard holds.
/// A node with no routes, or no matching route, ends the run.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransitionRouter;

impl Router for TransitionRouter {
    fn route(&mut self, ctx: RouteContext<'_>) -> Result<String> {
        for route in ctx.graph.routes(ctx.current) {
            let matched = route.guard.evaluate(ctx.state).map_err(|e| {
                StrandError::routing(ctx.current, format!("guard for '{}' failed: {}", route.target, e.message()))
            })?;
            if matched {
                return Ok(route.target.clone());
            }
        }
        Ok(END.to_string())
    }
}

/// Advances a cursor over a fixed id list, clamping at the last id.
#[derive(Debug, Clone)]
pub struct SequentialRouter {
    ids: Vec<String>,
    cursor: usize,
}

impl SequentialRouter {
    /// `ids[0]` is the starting position; the first call returns `ids[1]`.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            cursor: 0,
        }
    }

    pub fn next_id(&mut self) -> String {
        if self.ids.is_empty() {
            return END.to_string();
        }
        self.cursor = (self.cursor + 1).min(self.ids.len() - 1);
        self.ids[self.cursor].clone()
    }
}

impl Router for SequentialRouter {
    fn route(&mut self, _ctx: RouteContext<'_>) -> Result<String> {
        Ok(self.next_id())
    }
}

/// Resolves routes by label from the compiled routing table.
///
/// With a `label_key`, the label is read from that state key. Otherwise a
/// node with exactly one route takes it, a node with none ends the run, and
/// a node with several is a routing error.
#[derive(Debug, Default, Clone)]
pub struct TableRouter {
    label_key: Option<String>,
}

impl TableRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_key(key: impl Into<String>) -> Self {
        Self {
            label_key: Some(key.into()),
        }
    }
}

impl Router for TableRouter {
    fn route(&mut self, ctx: RouteContext<'_>) -> Result<String> {
        if let Some(label) = self.label_key.as_deref().and_then(|k| ctx.state.get_str(k)) {
            return ctx
                .graph
                .route(ctx.current, label)
                .map(str::to_string)
                .ok_or_else(|| StrandError::routing(ctx.current, format!("no route labeled '{}'", label)));
        }

        match ctx.graph.routes(ctx.current) {
            [] => Ok(END.to_string()),
            [only] => Ok(only.target.clone()),
            many => Err(StrandError::routing(
                ctx.current,
                format!("{} routes and no label to choose one", many.len()),
            )),
        }
    }
}

/// Ordered `(predicate, target)` rules with a fallback.
#[derive(Debug, Clone)]
pub struct PredicateRouter {
    rules: Vec<(Predicate, String)>,
    default: String,
}

impl PredicateRouter {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default: default.into(),
        }
    }

    pub fn rule(mut self, predicate: Predicate, target: impl Into<String>) -> Self {
        self.rules.push((predicate, target.into()));
        self
    }
}

impl Router for PredicateRouter {
    fn route(&mut self, ctx: RouteContext<'_>) -> Result<String> {
        for (predicate, target) in &self.rules {
            if predicate
                .evaluate(ctx.state)
                .map_err(|e| StrandError::routing(ctx.current, e.message()))?
            {
                return Ok(target.clone());
            }
        }
        Ok(self.default.clone())
    }
}
