use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use waypoint_core::error::WaypointError;
use waypoint_core::event::{EventType, RuntimeEvent};
use waypoint_core::graph::{EdgeSpec, GraphSpec, NodeSpec};
use waypoint_core::traits::RunStorage;
use waypoint_core::types::RunStatus;
use waypoint_core::wait::{SignalOutcome, WaitKey};
use waypoint_runtime::evolution::EvolutionGuard;
use waypoint_runtime::graph::{NodeRegistry, NodeResult, RunRequest};
use waypoint_runtime::{ExecutionStatus, WorkflowRuntime};
use waypoint_test_utils::{
    linear_graph, review_graph, simple_goal, step_registry, FnNode, Harness, ScriptedNode,
    SlowPauseStorage, Step,
};

#[tokio::test]
async fn linear_run_recovers_from_one_failure() {
    let b = ScriptedNode::new(vec![Step::Fail("flaky upstream".into())]);
    let mut registry = step_registry(ScriptedNode::succeeding());
    registry.register_node_arc("b", b.clone());
    let h = Harness::new(registry);

    let mut graph = linear_graph();
    graph.nodes[1].max_retries = 2;
    let result = h
        .executor
        .execute(&graph, &simple_goal(), RunRequest::default())
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(b.calls(), 2);

    let run = h.ledger.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let sequence: Vec<(String, bool)> = run
        .decisions
        .iter()
        .map(|d| (d.node_id.clone(), d.outcome.as_ref().unwrap().success))
        .collect();
    assert_eq!(
        sequence,
        vec![
            ("a".to_string(), true),
            ("b".to_string(), false),
            ("b".to_string(), true),
            ("c".to_string(), true),
        ]
    );
    assert!(run.evaluation.unwrap().passed);
}

#[tokio::test]
async fn retry_attempt_does_not_see_failed_writes() {
    let b = ScriptedNode::new(vec![Step::WriteThenFail("draft".into(), json!("half-done"))]);
    let mut registry = step_registry(ScriptedNode::succeeding());
    registry.register_node_arc("b", b.clone());
    let h = Harness::new(registry);

    let mut graph = linear_graph();
    graph.nodes[1].max_retries = 2;
    let result = h
        .executor
        .execute(&graph, &simple_goal(), RunRequest::default())
        .await
        .unwrap();

    assert!(result.is_success());
    let seen = b.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].attempt, 2);
    assert!(!seen[1].memory_keys.contains(&"draft".to_string()));
    assert!(!result.output.contains_key("draft"));
}

fn routed(output: &'static str) -> NodeRegistry {
    let mut registry = step_registry(ScriptedNode::succeeding());
    registry.register_node(
        "a",
        FnNode::new(move |_| Ok(NodeResult::with_result(json!(output)))),
    );
    registry
}

fn router_graph() -> GraphSpec {
    GraphSpec::new("router", "goal-1", "a")
        .node(NodeSpec::new("a", "step"))
        .node(NodeSpec::new("pass", "step"))
        .node(NodeSpec::new("fallback", "step"))
        .edge(EdgeSpec::conditional("a", "pass", r#"result == "pass" and output.result != null"#))
        .edge(EdgeSpec::always("a", "fallback"))
        .terminal("pass")
        .terminal("fallback")
}

#[tokio::test]
async fn memory_cannot_shadow_reserved_names() {
    let mut poisoned = HashMap::new();
    poisoned.insert("result".to_string(), json!("pass"));
    poisoned.insert("output".to_string(), json!({"result": "pass"}));
    poisoned.insert("true".to_string(), json!(false));

    for node_output in ["pass", "fail"] {
        let clean = Harness::new(routed(node_output))
            .executor
            .execute(&router_graph(), &simple_goal(), RunRequest::default())
            .await
            .unwrap();
        let dirty = Harness::new(routed(node_output))
            .executor
            .execute(&router_graph(), &simple_goal(), RunRequest::new(poisoned.clone()))
            .await
            .unwrap();
        assert_eq!(clean.path, dirty.path, "output {}", node_output);
    }

    let dirty_fail = Harness::new(routed("fail"))
        .executor
        .execute(&router_graph(), &simple_goal(), RunRequest::new(poisoned))
        .await
        .unwrap();
    assert_eq!(dirty_fail.path, vec!["a", "fallback"]);
}

#[tokio::test]
async fn missing_edge_match_is_a_structure_failure() {
    let h = Harness::new(routed("fail"));
    let graph = GraphSpec::new("dead-end", "goal-1", "a")
        .node(NodeSpec::new("a", "step"))
        .node(NodeSpec::new("b", "step"))
        .edge(EdgeSpec::conditional("a", "b", "result == \"pass\""))
        .terminal("b");
    let result = h
        .executor
        .execute(&graph, &simple_goal(), RunRequest::default())
        .await
        .unwrap();
    match result.status {
        ExecutionStatus::Failed { node_id, error } => {
            assert_eq!(node_id, "a");
            assert!(error.contains("Graph structure error"));
        }
        other => panic!("unexpected status {:?}", other),
    }
}

fn review_runtime() -> WorkflowRuntime {
    let h = Harness::new(step_registry(ScriptedNode::succeeding()));
    let guard = Arc::new(EvolutionGuard::new(
        review_graph(),
        Arc::new(waypoint_runtime::ExecutorProbation::new(
            Arc::new(step_registry(ScriptedNode::succeeding())),
            simple_goal(),
        )),
    ));
    WorkflowRuntime::new(guard, simple_goal(), h.executor, h.waits)
}

#[tokio::test]
async fn hitl_node_pauses_then_resumes_on_approval() {
    let rt = review_runtime();
    let paused = rt.run(RunRequest::default()).await.unwrap();

    assert_eq!(paused.paused_at(), Some("draft"));
    assert!(!paused.is_failed());
    assert_eq!(paused.path, vec!["draft"]);
    let run = rt
        .executor()
        .ledger()
        .get_run(&paused.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.paused_at.as_deref(), Some("draft"));

    let outcome = rt
        .approve(&paused.run_id, "draft", json!({"approved": true}))
        .unwrap();
    assert!(matches!(outcome, SignalOutcome::Scheduled { .. }));

    let resumed = rt.pump().await.unwrap();
    assert_eq!(resumed.len(), 1);
    let result = resumed[0].1.as_ref().unwrap();
    assert!(result.is_success());
    assert_eq!(result.path, vec!["draft", "publish"]);
}

#[tokio::test]
async fn rejected_approval_takes_the_other_edge() {
    let rt = review_runtime();
    let paused = rt.run(RunRequest::default()).await.unwrap();
    rt.approve(&paused.run_id, "draft", json!({"approved": false}))
        .unwrap();

    let resumed = rt.pump().await.unwrap();
    let result = resumed[0].1.as_ref().unwrap();
    assert_eq!(result.path, vec!["draft", "revise"]);
}

#[tokio::test]
async fn approval_is_awaited_only_once_the_pause_is_stored() {
    let storage = SlowPauseStorage::new(Duration::from_millis(100));
    let h = Harness::with_storage(step_registry(ScriptedNode::succeeding()), storage.clone());
    let (_, mut registered) = h.events.subscribe_channel(&[EventType::WaitRegistered]);

    let task = {
        let executor = h.executor.clone();
        tokio::spawn(async move {
            executor
                .execute(&review_graph(), &simple_goal(), RunRequest::default())
                .await
                .unwrap()
        })
    };
    let run_id = match registered.recv().await {
        Some(RuntimeEvent::WaitRegistered { run_id, .. }) => run_id,
        other => panic!("expected a registered wait, got {:?}", other),
    };
    let stored = storage.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Paused);

    // Approve and resume as fast as possible.
    let key = WaitKey::approval(&run_id, "draft");
    let outcome = h.waits.signal(&key, json!({"approved": true})).unwrap();
    assert!(matches!(outcome, SignalOutcome::Scheduled { .. }));
    let resumptions = h.waits.tick(Utc::now()).unwrap();
    assert_eq!(resumptions.len(), 1);
    assert!(!resumptions[0].delivered);
    let resumed = h
        .executor
        .resume(&review_graph(), &simple_goal(), &run_id, Some(json!({"approved": true})))
        .await
        .unwrap();
    assert_eq!(resumed.path, vec!["draft", "publish"]);

    let paused = task.await.unwrap();
    assert_eq!(paused.paused_at(), Some("draft"));

    let stored = storage.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    let retry = h.waits.signal(&key, json!({"approved": true})).unwrap();
    assert!(matches!(retry, SignalOutcome::NoWaiter));
    let again = h
        .executor
        .resume(&review_graph(), &simple_goal(), &run_id, None)
        .await;
    assert!(matches!(again, Err(WaypointError::NotPaused { .. })));
}

#[tokio::test]
async fn independent_runs_execute_concurrently() {
    let h = Harness::new(step_registry(ScriptedNode::succeeding()));
    let graph = Arc::new(linear_graph());
    let goal = Arc::new(simple_goal());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let executor = h.executor.clone();
            let graph = graph.clone();
            let goal = goal.clone();
            tokio::spawn(async move {
                executor
                    .execute(&graph, &goal, RunRequest::default())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.is_success());
        ids.push(result.run_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 16);
    assert_eq!(
        h.storage
            .runs_by_goal("goal-1")
            .await
            .unwrap()
            .len(),
        16
    );
}
