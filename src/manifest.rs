//! Graph manifests: JSON or TOML files describing a graph declaratively.
//!
//! Task steps carry simple actions (`set` keys, sleep for `delay_ms`, `fail`
//! with a message) so a graph can be exercised end to end without code.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::{Map, Value};

use strand_core::error::StrandError;
use strand_core::state::GlobalState;
use strand_engine::{
    async_step, Branch, CompiledGraph, Edge, GraphDefinition, Predicate, Step, StepDefinition,
    StepKind, SubgraphDef, Transition,
};

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub entry: String,
    #[serde(default)]
    pub steps: Vec<StepDecl>,
    #[serde(default)]
    pub edges: Vec<EdgeDecl>,
    #[serde(default)]
    pub subgraphs: BTreeMap<String, SubgraphDecl>,
    /// Initial state, overridden key by key by `--input`.
    #[serde(default)]
    pub input: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct SubgraphDecl {
    pub entry: String,
    #[serde(default)]
    pub steps: Vec<StepDecl>,
    #[serde(default)]
    pub edges: Vec<EdgeDecl>,
}

#[derive(Debug, Deserialize)]
pub struct StepDecl {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub set: Map<String, Value>,
    pub fail: Option<String>,
    pub delay_ms: Option<u64>,
    pub parallel: Option<Vec<BranchDecl>>,
    pub fan_out: Option<Vec<BranchDecl>>,
    pub subgraph: Option<String>,
    /// Shorthand for a single unconditional transition.
    pub next: Option<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionDecl>,
    pub on_error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BranchDecl {
    Target(String),
    Guarded { to: String, when: Option<String> },
}

#[derive(Debug, Deserialize)]
pub struct TransitionDecl {
    pub to: String,
    pub when: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EdgeDecl {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: String,
}

impl Manifest {
    /// Load a manifest, choosing the format from the file extension.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        serde_json::from_str(content).context("invalid JSON manifest")
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid TOML manifest")
    }

    pub fn input(&self) -> GlobalState {
        self.input
            .iter()
            .fold(GlobalState::new(), |state, (k, v)| state.with(k.clone(), v.clone()))
    }

    pub fn definition(&self) -> anyhow::Result<GraphDefinition> {
        let mut def = GraphDefinition::new(&self.entry);
        def.steps = build_steps(&self.steps)?;
        def.edges = build_edges(&self.edges);
        for (id, sub) in &self.subgraphs {
            let mut subgraph = SubgraphDef::new(&sub.entry);
            subgraph.steps =
                build_steps(&sub.steps).with_context(|| format!("in subgraph '{}'", id))?;
            subgraph.edges = build_edges(&sub.edges);
            def = def.subgraph(id.clone(), subgraph);
        }
        Ok(def)
    }

    pub fn compile(&self) -> anyhow::Result<Arc<CompiledGraph>> {
        Ok(self.definition()?.compile()?)
    }
}

fn build_steps(decls: &[StepDecl]) -> anyhow::Result<Vec<StepDefinition>> {
    decls.iter().map(build_step).collect()
}

fn build_edges(decls: &[EdgeDecl]) -> Vec<Edge> {
    decls
        .iter()
        .map(|e| Edge::labeled(&e.from, &e.label, &e.to))
        .collect()
}

fn build_step(decl: &StepDecl) -> anyhow::Result<StepDefinition> {
    let kinds = [decl.parallel.is_some(), decl.fan_out.is_some(), decl.subgraph.is_some()]
        .iter()
        .filter(|k| **k)
        .count();
    if kinds > 1 {
        bail!("step '{}' mixes parallel, fan_out and subgraph", decl.name);
    }
    let has_action = !decl.set.is_empty() || decl.fail.is_some() || decl.delay_ms.is_some();
    if kinds == 1 && has_action {
        bail!("step '{}' has actions but is not a task step", decl.name);
    }

    let kind = if let Some(branches) = &decl.parallel {
        StepKind::Parallel(build_branches(branches))
    } else if let Some(branches) = &decl.fan_out {
        StepKind::Async(build_branches(branches))
    } else if let Some(graph_id) = &decl.subgraph {
        StepKind::Subgraph(graph_id.clone())
    } else {
        StepKind::Task(action_step(decl))
    };

    let mut step = StepDefinition::new(&decl.name, kind);
    if let Some(description) = &decl.description {
        step = step.with_description(description);
    }
    for t in &decl.transitions {
        let mut transition = match &t.when {
            Some(expr) => Transition::when_expr(expr, &t.to),
            None => Transition::to(&t.to),
        };
        if let Some(label) = &t.label {
            transition = transition.labeled(label);
        }
        step = step.transition(transition);
    }
    if let Some(next) = &decl.next {
        step = step.then(next);
    }
    if let Some(target) = &decl.on_error {
        step = step.on_error(target);
    }
    Ok(step)
}

fn build_branches(decls: &[BranchDecl]) -> Vec<Branch> {
    decls
        .iter()
        .map(|b| match b {
            BranchDecl::Target(to) | BranchDecl::Guarded { to, when: None } => Branch::always(to),
            BranchDecl::Guarded {
                to,
                when: Some(expr),
            } => Branch::when(Predicate::expr(expr), to),
        })
        .collect()
}

fn action_step(decl: &StepDecl) -> Arc<dyn Step> {
    let set = decl.set.clone();
    let fail = decl.fail.clone();
    let delay = decl.delay_ms.map(Duration::from_millis);
    async_step(move |ctx| {
        let set = set.clone();
        let fail = fail.clone();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = fail {
                return Err(StrandError::step(ctx.node_id, message));
            }
            Ok(set
                .into_iter()
                .fold(ctx.state, |state, (k, v)| state.with(k, v)))
        }
    })
}
