mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use strand_core::config::EngineSettings;
use strand_core::error::StrandError;
use strand_core::state::GlobalState;
use strand_core::types::{ExecutionId, RunConfig, RunStatus};
use strand_engine::{
    async_step, set_key, Branch, Engine, FutureEngine, GraphDefinition, StepDefinition,
    LAST_ERROR_KEY,
};

use common::*;

fn engine() -> FutureEngine {
    init_tracing();
    FutureEngine::new()
}

#[tokio::test]
async fn test_linear_run_completes() {
    let result = engine()
        .execute(linear_graph(), GlobalState::new(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(result, expected_linear());
}

#[tokio::test]
async fn test_failure_midway_stops_run() {
    let err = engine()
        .execute(failing_graph(), GlobalState::new(), RunConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err, StrandError::step("B", "B exploded"));
}

#[tokio::test]
async fn test_parallel_branches_merge() {
    let result = engine()
        .execute(parallel_graph(), state(&[("seed", json!(0))]), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(result.get("joined"), Some(&json!(true)));
    assert_eq!(result.get("left"), Some(&json!("L")));
    assert_eq!(result.get("right"), Some(&json!("R")));
}

#[tokio::test]
async fn test_parallel_branch_failure_fails_fast() {
    let err = engine()
        .execute(failing_parallel_graph(), GlobalState::new(), RunConfig::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StrandError::ParallelBranch {
            node: "FAN".into(),
            branch: "bad".into(),
            message: "branch broke".into(),
        }
    );
}

#[tokio::test]
async fn test_subgraph_runs_inline() {
    let result = engine()
        .execute(subgraph_graph(), GlobalState::new(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(keys(&result), vec!["a", "x", "y", "c"]);
}

#[tokio::test]
async fn test_async_branches_do_not_block() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let background = async_step(move |ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ctx.state.with("ignored", true))
        }
    });
    let graph = GraphDefinition::new("NOTIFY")
        .step(StepDefinition::fan_out("NOTIFY", vec![Branch::always("mail")]).then("NEXT"))
        .step(StepDefinition::task("mail", background))
        .step(StepDefinition::task("NEXT", set_key("next", 1)).then("END"))
        .compile()
        .unwrap();

    let result = engine()
        .execute(graph, GlobalState::new(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(keys(&result), vec!["next"]);

    for _ in 0..100 {
        if fired.load(Ordering::SeqCst) == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("async branch never ran");
}

#[tokio::test]
async fn test_error_transition_sets_last_error() {
    let graph = GraphDefinition::new("A")
        .step(StepDefinition::task("A", failing("flaky upstream")).then("END").on_error("FALLBACK"))
        .step(StepDefinition::task("FALLBACK", set_key("fallback", true)).then("END"))
        .compile()
        .unwrap();

    let result = engine()
        .execute(graph, GlobalState::new(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(result.get("fallback"), Some(&json!(true)));
    assert_eq!(result.get(LAST_ERROR_KEY).unwrap()["node"], "A");
}

#[tokio::test]
async fn test_loop_guard() {
    let graph = GraphDefinition::new("SPIN")
        .step(StepDefinition::task("SPIN", set_key("spun", true)).then("SPIN"))
        .compile()
        .unwrap();
    let engine = engine().with_settings(EngineSettings {
        max_transitions: 3,
        ..EngineSettings::default()
    });
    let err = engine
        .execute(graph, GlobalState::new(), RunConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StrandError::Configuration { .. }));
}

#[tokio::test]
async fn test_unknown_target_is_configuration_error() {
    let graph = GraphDefinition::new("A")
        .step(StepDefinition::task("A", set_key("a", 1)).then("GHOST"))
        .compile()
        .unwrap();
    let err = engine()
        .execute(graph, GlobalState::new(), RunConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StrandError::Configuration { .. }));
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let make = |key: &'static str| {
        let running = running.clone();
        let peak = peak.clone();
        async_step(move |ctx| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(ctx.state.with(key, true))
            }
        })
    };
    let graph = GraphDefinition::new("FAN")
        .step(
            StepDefinition::parallel(
                "FAN",
                vec![Branch::always("b1"), Branch::always("b2"), Branch::always("b3")],
            )
            .then("END"),
        )
        .step(StepDefinition::task("b1", make("b1")))
        .step(StepDefinition::task("b2", make("b2")))
        .step(StepDefinition::task("b3", make("b3")))
        .compile()
        .unwrap();

    let engine = engine().with_settings(EngineSettings {
        worker_pool_size: 1,
        ..EngineSettings::default()
    });
    let result = engine
        .execute(graph, GlobalState::new(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(result.len(), 3);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_cancels_run() {
    let graph = GraphDefinition::new("WAIT")
        .step(StepDefinition::task("WAIT", hanging()).then("END"))
        .compile()
        .unwrap();
    let mut handle = engine()
        .start(graph, GlobalState::new(), RunConfig::default())
        .await
        .unwrap();
    assert!(handle.holder().is_none());
    handle.stop();
    assert_eq!(handle.finished().await, RunStatus::Cancelled);
    assert!(handle.next().await.is_none());
}

#[tokio::test]
async fn test_engines_agree() {
    let (durable, _log) = memory_engine();
    let engines: Vec<Box<dyn Engine>> = vec![Box::new(durable), Box::new(engine())];
    let mut results = Vec::new();
    for engine in &engines {
        results.push(
            engine
                .execute(subgraph_graph(), state(&[("in", json!("x"))]), RunConfig::default())
                .await
                .unwrap(),
        );
    }
    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn test_partial_output_keeps_committed_keys() {
    let result = engine()
        .execute(
            partial_output_graph(),
            state(&[("input", json!("x"))]),
            RunConfig::default(),
        )
        .await
        .unwrap();
    assert_eq!(keys(&result), vec!["input", "a", "b"]);
    assert_eq!(result.get("a"), Some(&json!(1)));
}

#[tokio::test]
async fn test_parallel_failure_does_not_wait_for_hanging_sibling() {
    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        engine().execute(hanging_sibling_graph(), GlobalState::new(), RunConfig::default()),
    )
    .await
    .expect("run should fail without waiting for the stuck branch");
    assert_eq!(
        outcome.unwrap_err(),
        StrandError::ParallelBranch {
            node: "FAN".into(),
            branch: "bad".into(),
            message: "boom".into(),
        }
    );
}

#[tokio::test]
async fn test_start_with_id_rejects_subgraph_shaped_id() {
    let parent = ExecutionId::from_string("nightly");
    let err = engine()
        .start_with_id(
            parent.child("SUB", 2),
            linear_graph(),
            GlobalState::new(),
            RunConfig::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StrandError::Configuration { .. }));
}
