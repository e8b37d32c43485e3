#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use strand_core::config::EngineSettings;
use strand_core::error::StrandError;
use strand_core::state::GlobalState;
use strand_core::traits::EventLog;
use strand_engine::{
    async_step, set_key, step_fn, Branch, CompiledGraph, DurableEngine, GraphDefinition, Router,
    RouterFactory, RunHandle, Step, StepDefinition, SubgraphDef,
};
use strand_store::MemoryEventLog;

pub use strand_test_utils::{init_tracing, keys, state};

pub fn memory_engine() -> (DurableEngine, Arc<MemoryEventLog>) {
    init_tracing();
    let log = Arc::new(MemoryEventLog::new());
    let engine = DurableEngine::new(log.clone() as Arc<dyn EventLog>);
    (engine, log)
}

pub fn engine_with_settings(settings: EngineSettings) -> (DurableEngine, Arc<MemoryEventLog>) {
    let (engine, log) = memory_engine();
    (engine.with_settings(settings), log)
}

/// Factory handing every graph instance its own copy of `router`.
pub fn routers<R>(router: R) -> RouterFactory
where
    R: Router + Clone + Sync + 'static,
{
    Arc::new(move |_: &CompiledGraph| -> Box<dyn Router> { Box::new(router.clone()) })
}

/// Step that fails with `message`.
pub fn failing(message: &'static str) -> Arc<dyn Step> {
    step_fn(move |ctx| Err(StrandError::step(ctx.node_id, message)))
}

/// Step that never finishes.
pub fn hanging() -> Arc<dyn Step> {
    async_step(|_ctx| async {
        futures::future::pending::<()>().await;
        Ok(GlobalState::new())
    })
}

/// Step that sets `key` and counts its invocations.
pub fn counted(key: &'static str, value: i64, counter: Arc<AtomicUsize>) -> Arc<dyn Step> {
    step_fn(move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(ctx.state.with(key, value))
    })
}

/// A -> B -> END, setting `a = 1` then `b = 2`.
pub fn linear_graph() -> Arc<CompiledGraph> {
    GraphDefinition::new("A")
        .step(StepDefinition::task("A", set_key("a", 1)).then("B"))
        .step(StepDefinition::task("B", set_key("b", 2)).then("END"))
        .compile()
        .expect("compile linear graph")
}

/// A -> B -> C -> END where B fails.
pub fn failing_graph() -> Arc<CompiledGraph> {
    GraphDefinition::new("A")
        .step(StepDefinition::task("A", set_key("a", 1)).then("B"))
        .step(StepDefinition::task("B", failing("B exploded")).then("C"))
        .step(StepDefinition::task("C", set_key("c", 3)).then("END"))
        .compile()
        .expect("compile failing graph")
}

/// FAN runs `ok` and `bad` in parallel; `bad` fails.
pub fn failing_parallel_graph() -> Arc<CompiledGraph> {
    GraphDefinition::new("FAN")
        .step(
            StepDefinition::parallel("FAN", vec![Branch::always("ok"), Branch::always("bad")])
                .then("END"),
        )
        .step(StepDefinition::task("ok", set_key("ok", true)))
        .step(StepDefinition::task("bad", failing("branch broke")))
        .compile()
        .expect("compile parallel graph")
}

/// FAN runs `left` and `right` in parallel, then JOIN.
pub fn parallel_graph() -> Arc<CompiledGraph> {
    let slow = async_step(|ctx| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(ctx.state.with("left", "L"))
    });
    GraphDefinition::new("FAN")
        .step(
            StepDefinition::parallel("FAN", vec![Branch::always("left"), Branch::always("right")])
                .then("JOIN"),
        )
        .step(StepDefinition::task("left", slow))
        .step(StepDefinition::task("right", set_key("right", "R")))
        .step(StepDefinition::task("JOIN", set_key("joined", true)).then("END"))
        .compile()
        .expect("compile parallel graph")
}

/// A -> B -> END where B returns a fresh map holding only `b = 2`.
pub fn partial_output_graph() -> Arc<CompiledGraph> {
    let fresh = step_fn(|_ctx| Ok(GlobalState::new().with("b", 2)));
    GraphDefinition::new("A")
        .step(StepDefinition::task("A", set_key("a", 1)).then("B"))
        .step(StepDefinition::task("B", fresh).then("END"))
        .compile()
        .expect("compile partial output graph")
}

/// FAN runs `stuck`, which never finishes, beside `bad`, which fails.
pub fn hanging_sibling_graph() -> Arc<CompiledGraph> {
    GraphDefinition::new("FAN")
        .step(
            StepDefinition::parallel("FAN", vec![Branch::always("stuck"), Branch::always("bad")])
                .then("END"),
        )
        .step(StepDefinition::task("stuck", hanging()))
        .step(StepDefinition::task("bad", failing("boom")))
        .compile()
        .expect("compile hanging sibling graph")
}

/// NOTIFY fans out to `mail` (counted) and `pager` (fails), then NEXT.
pub fn fan_out_graph(mailed: Arc<AtomicUsize>) -> Arc<CompiledGraph> {
    GraphDefinition::new("NOTIFY")
        .step(
            StepDefinition::fan_out("NOTIFY", vec![Branch::always("mail"), Branch::always("pager")])
                .then("NEXT"),
        )
        .step(StepDefinition::task("mail", counted("mailed", 1, mailed)))
        .step(StepDefinition::task("pager", failing("pager offline")))
        .step(StepDefinition::task("NEXT", set_key("next", 1)).then("END"))
        .compile()
        .expect("compile fan-out graph")
}

/// Wait until `counter` reaches `expected`.
pub async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
    for _ in 0..400 {
        if counter.load(Ordering::SeqCst) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("counter never reached {}", expected);
}

/// A -> SUB(x -> y) -> C -> END.
pub fn subgraph_graph() -> Arc<CompiledGraph> {
    GraphDefinition::new("A")
        .step(StepDefinition::task("A", set_key("a", 1)).then("SUB"))
        .step(StepDefinition::subgraph("SUB", "inner").then("C"))
        .step(StepDefinition::task("C", set_key("c", 3)).then("END"))
        .subgraph(
            "inner",
            SubgraphDef::new("x")
                .step(StepDefinition::task("x", set_key("x", "X")).then("y"))
                .step(StepDefinition::task("y", set_key("y", "Y")).then("END")),
        )
        .compile()
        .expect("compile subgraph graph")
}

pub fn expected_linear() -> GlobalState {
    state(&[("a", json!(1)), ("b", json!(2))])
}

/// Wait until the run's persisted holder satisfies `done`.
pub async fn wait_for_holder<F>(handle: &RunHandle, done: F)
where
    F: Fn(&strand_engine::StateHolder) -> bool,
{
    for _ in 0..400 {
        if handle.holder().as_ref().is_some_and(&done) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("holder never reached the expected state");
}
