mod common;

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::json;

use strand_core::error::StrandError;
use strand_core::flow_data::FlowData;
use strand_core::state::GlobalState;
use strand_core::types::RunConfig;
use strand_engine::{
    set_key, step_fn, stream_step, CompiledGraph, Engine, FutureEngine, GraphDefinition,
    StepDefinition,
};
use strand_stream::{DataKind, TransferStatus};

use common::*;

fn streaming_graph() -> Arc<CompiledGraph> {
    let tokens = stream_step(|ctx| {
        let base = ctx.state.clone();
        stream::iter(vec![
            FlowData::fragment(GlobalState::new().with("token", "he")),
            FlowData::fragment(GlobalState::new().with("token", "llo")),
            FlowData::done(base.with("text", "hello")),
        ])
    });
    GraphDefinition::new("GEN")
        .step(StepDefinition::task("GEN", tokens).then("END"))
        .compile()
        .unwrap()
}

#[tokio::test]
async fn test_fragments_precede_result() {
    let (engine, _log) = memory_engine();
    let handle = engine
        .start(streaming_graph(), GlobalState::new(), RunConfig::default())
        .await
        .unwrap();
    let (fragments, result) = handle.collect().await;
    let tokens: Vec<&str> = fragments.iter().filter_map(|f| f.get_str("token")).collect();
    assert_eq!(tokens, vec!["he", "llo"]);
    assert_eq!(result.unwrap().get_str("text"), Some("hello"));
}

#[tokio::test]
async fn test_future_engine_streams_fragments() {
    init_tracing();
    let handle = FutureEngine::new()
        .start(streaming_graph(), GlobalState::new(), RunConfig::default())
        .await
        .unwrap();
    let signals: Vec<FlowData<GlobalState>> = handle.into_stream().collect().await;
    assert_eq!(signals.len(), 3);
    assert!(signals[0].is_fragment());
    assert!(signals[1].is_fragment());
    assert!(signals[2].is_done());
}

#[tokio::test]
async fn test_stream_error_fails_node() {
    let broken = stream_step(|_ctx| {
        stream::iter(vec![
            FlowData::fragment(GlobalState::new().with("partial", 1)),
            FlowData::error(StrandError::step("GEN", "model went away")),
        ])
    });
    let graph = GraphDefinition::new("GEN")
        .step(StepDefinition::task("GEN", broken).then("END"))
        .compile()
        .unwrap();

    let (engine, _log) = memory_engine();
    let handle = engine
        .start(graph, GlobalState::new(), RunConfig::default())
        .await
        .unwrap();
    let (fragments, result) = handle.collect().await;
    assert_eq!(fragments.len(), 1);
    assert_eq!(result.unwrap_err().message(), "model went away");
}

#[tokio::test]
async fn test_late_listener_sees_earlier_chunks() {
    let producer = step_fn(|ctx| {
        let out = ctx.buffer("report");
        out.text("one")?;
        out.text("two")?;
        out.text("three")?;
        out.done(json!({ "pages": 3 }))?;
        Ok(ctx.state.with("produced", true))
    });
    let graph = GraphDefinition::new("PRODUCE")
        .step(StepDefinition::task("PRODUCE", producer).then("CONSUME"))
        .step(StepDefinition::task("CONSUME", set_key("consumed", true)).then("END"))
        .compile()
        .unwrap();

    let (engine, _log) = memory_engine();
    let buffers = engine.buffers().clone();
    engine
        .execute(graph, GlobalState::new(), RunConfig::default())
        .await
        .unwrap();

    // The run is over before anyone listens
    let reader = buffers.require_buffer("report").unwrap();
    let chunks = reader.collect().await;
    let texts: Vec<&str> = chunks.iter().filter_map(|c| c.as_text()).collect();
    assert_eq!(texts, vec!["one", "two", "three"]);

    let last = chunks.last().unwrap();
    assert_eq!(last.transfer_status, TransferStatus::Done);
    assert_eq!(last.data_kind, DataKind::Json);
    assert!(chunks.iter().all(|c| c.source_step.as_deref() == Some("PRODUCE")));
}

#[tokio::test]
async fn test_downstream_step_reads_buffer_snapshot() {
    let producer = step_fn(|ctx| {
        let out = ctx.buffer("log");
        for chunk in strand_test_utils::text_chunks("log", 3) {
            out.push(chunk)?;
        }
        Ok(ctx.state.clone())
    });
    let consumer = step_fn(|ctx| {
        let chunks = ctx.buffers.require_buffer("log")?.snapshot();
        let lines: Vec<&str> = chunks.iter().filter_map(|c| c.as_text()).collect();
        Ok(ctx.state.with("lines", lines.join(",")))
    });
    let graph = GraphDefinition::new("PRODUCE")
        .step(StepDefinition::task("PRODUCE", producer).then("CONSUME"))
        .step(StepDefinition::task("CONSUME", consumer).then("END"))
        .compile()
        .unwrap();

    let (engine, _log) = memory_engine();
    let result = engine
        .execute(graph, GlobalState::new(), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(result.get_str("lines"), Some("chunk-0,chunk-1,chunk-2"));
}
