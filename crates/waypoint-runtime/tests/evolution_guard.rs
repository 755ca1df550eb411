use std::sync::Arc;

use waypoint_core::event::EventType;
use waypoint_core::evolution::{EvolutionDecision, GraphDelta};
use waypoint_core::graph::{EdgeSpec, NodeSpec};
use waypoint_runtime::evolution::{EvolutionGuard, ExecutorProbation};
use waypoint_runtime::graph::RunRequest;
use waypoint_runtime::WorkflowRuntime;
use waypoint_store::JsonlLogStore;
use waypoint_test_utils::{
    linear_graph, simple_goal, step_registry, Harness, RecordingLogStore, ScriptedNode,
};

fn probation() -> Arc<ExecutorProbation> {
    Arc::new(ExecutorProbation::new(
        Arc::new(step_registry(ScriptedNode::succeeding())),
        simple_goal(),
    ))
}

fn extend_with_d() -> GraphDelta {
    GraphDelta {
        add_nodes: vec![NodeSpec::new("d", "step")],
        add_edges: vec![EdgeSpec::on_success("c", "d")],
        terminal_nodes: Some(vec!["d".into()]),
        ..Default::default()
    }
}

fn unbound_node() -> GraphDelta {
    GraphDelta {
        add_nodes: vec![NodeSpec::new("d", "llm")],
        add_edges: vec![EdgeSpec::on_success("c", "d")],
        terminal_nodes: Some(vec!["d".into()]),
        ..Default::default()
    }
}

#[tokio::test]
async fn every_update_is_audited_once_and_swaps_only_when_approved() {
    let sink = RecordingLogStore::new();
    let h = Harness::new(step_registry(ScriptedNode::succeeding()));
    let (_, mut rx) = h.events.subscribe_channel(&[
        EventType::GraphEvolutionApplied,
        EventType::GraphEvolutionRejected,
    ]);
    let guard = EvolutionGuard::new(linear_graph(), probation())
        .with_log_store(sink.clone())
        .with_events(h.events.clone());

    let before = guard.current();
    let rejected = guard.propose(&unbound_node(), "corr-1").await.unwrap();
    assert_eq!(rejected.decision, EvolutionDecision::Rejected);
    assert!(rejected
        .violations
        .iter()
        .any(|v| v.contains("no executor registered")));
    assert!(Arc::ptr_eq(&before, &guard.current()));

    let applied = guard.propose(&extend_with_d(), "corr-2").await.unwrap();
    assert_eq!(applied.decision, EvolutionDecision::Applied);
    assert!(applied.violations.is_empty());
    assert_eq!(guard.current().version, 2);
    assert!(guard.current().get_node("d").is_some());

    let ids: Vec<_> = guard
        .audit_log()
        .iter()
        .map(|e| e.correlation_id.clone())
        .collect();
    assert_eq!(ids, vec!["corr-1", "corr-2"]);
    let sunk: Vec<_> = sink
        .entries()
        .iter()
        .map(|e| e.correlation_id.clone())
        .collect();
    assert_eq!(sunk, ids);

    let mut events = 0;
    while rx.try_recv().is_ok() {
        events += 1;
    }
    assert_eq!(events, 2);
}

#[tokio::test]
async fn probation_never_touches_the_live_ledger() {
    let h = Harness::new(step_registry(ScriptedNode::succeeding()));
    let guard = EvolutionGuard::new(linear_graph(), probation());
    guard.propose(&extend_with_d(), "corr-1").await.unwrap();

    assert!(h.ledger.active_runs().is_empty());
    use waypoint_core::traits::RunStorage;
    assert!(h.storage.list_all_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_log_sink_still_yields_one_entry() {
    let guard = EvolutionGuard::new(linear_graph(), probation())
        .with_log_store(RecordingLogStore::failing());
    guard.propose(&extend_with_d(), "corr-1").await.unwrap();
    assert_eq!(guard.audit_log().len(), 1);
}

#[tokio::test]
async fn audit_entries_land_in_the_jsonl_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("evolution.jsonl");
    let store = Arc::new(JsonlLogStore::new(&path));
    let guard = EvolutionGuard::new(linear_graph(), probation()).with_log_store(store.clone());

    guard.propose(&extend_with_d(), "corr-1").await.unwrap();
    guard.propose(&unbound_node(), "corr-2").await.unwrap();

    let entries = waypoint_store::log_store::read_audit_log(&path).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].decision, EvolutionDecision::Applied);
    assert_eq!(entries[1].decision, EvolutionDecision::Rejected);
}

#[tokio::test]
async fn runs_pick_up_the_graph_live_at_start() {
    let h = Harness::new(step_registry(ScriptedNode::succeeding()));
    let guard = Arc::new(EvolutionGuard::new(linear_graph(), probation()));
    let rt = WorkflowRuntime::new(guard.clone(), simple_goal(), h.executor, h.waits);

    let before = rt.run(RunRequest::default()).await.unwrap();
    assert_eq!(before.path, vec!["a", "b", "c"]);

    guard.propose(&extend_with_d(), "corr-1").await.unwrap();
    let after = rt.run(RunRequest::default()).await.unwrap();
    assert_eq!(after.path, vec!["a", "b", "c", "d"]);
}
