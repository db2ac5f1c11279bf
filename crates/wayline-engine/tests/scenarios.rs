use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::Notify;

use wayline_core::config::EngineConfig;
use wayline_core::error::WaylineError;
use wayline_core::state::{BRANCH_ERRORS_KEY, ERROR_KEY, ITERATIONS_KEY, SELECTED_WORKER_KEY};
use wayline_core::traits::{CheckpointStore, ExecutionStore};
use wayline_core::types::{
    ApprovalResponse, Checkpoint, Decision, EngineEvent, ExecutionId, ExecutionStatus, NextStep,
};
use wayline_engine::ExecutionEngine;
use wayline_store::{MemoryStore, SqliteStore, Stores};
use wayline_test_utils::*;
use wayline_tools::{ToolRegistry, ToolSpec};

fn engine(tools: ToolRegistry) -> Arc<ExecutionEngine> {
    engine_on(tools, Stores::shared(MemoryStore::new()))
}

fn engine_on(tools: ToolRegistry, stores: Stores) -> Arc<ExecutionEngine> {
    Arc::new(
        ExecutionEngine::new(Arc::new(tools), stores.checkpoints, stores.executions)
            .with_config(EngineConfig::default(), fast_retry(3)),
    )
}

fn assert_contiguous(checkpoints: &[Checkpoint]) {
    for (i, cp) in checkpoints.iter().enumerate() {
        assert_eq!(cp.sequence_number, i as u64 + 1, "gap before {:?}", cp.node_id);
    }
}

fn node_ids(checkpoints: &[Checkpoint]) -> Vec<&str> {
    checkpoints.iter().map(|c| c.node_id.as_str()).collect()
}

fn order_tools() -> (ToolRegistry, Calls) {
    let mut tools = ToolRegistry::new();
    static_tool(&mut tools, "prepare_order", json!({"qty": 1, "drug": "amoxicillin"}));
    let submit = static_tool(&mut tools, "submit_order", json!({"submitted": true}));
    (tools, submit)
}

// ── Scenario A ─────────────────────────────────────────────────────

#[tokio::test]
async fn routes_to_selected_specialist() {
    let mut tools = ToolRegistry::new();
    let fetch = static_tool(&mut tools, "fetch_patient", json!({"age": 54}));
    scripted_classifier(&mut tools, "triage_classifier", &["specialist_a"]);
    let engine = engine(tools);
    engine.register(&triage_definition()).unwrap();

    let exec = engine
        .start("triage", "1", json!({"patient_id": "P1"}))
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get_str(SELECTED_WORKER_KEY), Some("specialist_a"));
    assert_eq!(exec.state.get("age"), Some(&json!(54)));
    assert_eq!(exec.current_node_id, "end");
    assert_eq!(fetch.count(), 1);

    let checkpoints = engine.checkpoints(&exec.execution_id, 1).await.unwrap();
    assert_eq!(checkpoints.len(), 3);
    assert_eq!(node_ids(&checkpoints), vec!["start", "fetch", "route"]);
    assert_contiguous(&checkpoints);
    assert_eq!(checkpoints[2].next, NextStep::Node("end".into()));
    assert_eq!(checkpoints[1].invocations[0].tool_name, "fetch_patient");
    assert_eq!(
        checkpoints[2].state.get("_routing"),
        Some(&json!([{"node_id": "route", "worker": "specialist_a"}]))
    );
}

#[tokio::test]
async fn router_dead_end_fails_execution() {
    let mut tools = ToolRegistry::new();
    static_tool(&mut tools, "fetch_patient", json!({}));
    scripted_classifier(&mut tools, "triage_classifier", &["specialist_z"]);
    let engine = engine(tools);
    engine.register(&triage_definition()).unwrap();

    let exec = engine.start("triage", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    let error = exec.error.unwrap();
    assert_eq!(error.kind, "routing_dead_end");
    assert_eq!(error.node_id.as_deref(), Some("route"));

    let checkpoints = engine.checkpoints(&exec.execution_id, 1).await.unwrap();
    let last = checkpoints.last().unwrap();
    assert_eq!(last.status, ExecutionStatus::Failed);
    assert_eq!(last.next, NextStep::Halt);
    assert_eq!(last.state.get(ERROR_KEY).unwrap()["kind"], "routing_dead_end");
    // The classifier call that produced the bad worker is kept.
    assert_eq!(last.invocations.len(), 1);
}

// ── Scenario B and approvals ───────────────────────────────────────

#[tokio::test]
async fn tier3_rejection_fails_without_running_more_nodes() {
    let (tools, submit) = order_tools();
    let engine = engine(tools);
    engine.register(&approval_definition("tier3", "fail")).unwrap();

    let exec = engine.start("order", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Suspended);

    let pending = engine.pending_approvals(&exec.execution_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].decision, Decision::Pending);
    assert_eq!(pending[0].node_id, "review");

    let response = ApprovalResponse::new(&pending[0].request_id, Decision::Rejected).by("dr.lee");
    let exec = engine.resume(&exec.execution_id, response).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error.as_ref().unwrap().kind, "approval_rejected");
    assert_eq!(exec.state.get_str("review_decision"), Some("rejected"));
    assert_eq!(submit.count(), 0);

    let checkpoints = engine.checkpoints(&exec.execution_id, 1).await.unwrap();
    assert!(checkpoints.iter().all(|c| c.node_id != "submit"));
    assert!(engine.pending_approvals(&exec.execution_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn tier3_requires_identified_reviewer() {
    let (tools, _) = order_tools();
    let engine = engine(tools);
    engine.register(&approval_definition("tier3", "fail")).unwrap();
    let exec = engine.start("order", "1", json!({})).await.unwrap();
    let request = engine.pending_approvals(&exec.execution_id).await.unwrap().remove(0);

    for response in [
        ApprovalResponse::new(&request.request_id, Decision::Approved),
        ApprovalResponse::new(&request.request_id, Decision::Approved).by("system"),
        ApprovalResponse::new(&request.request_id, Decision::Pending).by("dr.lee"),
    ] {
        let err = engine.resume(&exec.execution_id, response).await.unwrap_err();
        assert!(matches!(err, WaylineError::InvalidDecision(_)), "{err}");
    }
    let exec = engine.execution(&exec.execution_id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Suspended);
}

#[tokio::test]
async fn tier1_never_suspends() {
    let (tools, submit) = order_tools();
    let engine = engine(tools);
    engine.register(&approval_definition("tier1", "fail")).unwrap();

    let exec = engine.start("order", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(submit.count(), 1);
    assert_eq!(exec.state.get_str("review_decision"), Some("approved"));

    let approvals = engine.approvals(&exec.execution_id).await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].decision, Decision::Approved);
    assert_eq!(approvals[0].decided_by.as_deref(), Some("policy"));
}

#[tokio::test]
async fn edited_resume_merges_payload_and_continues() {
    let (tools, submit) = order_tools();
    let engine = engine(tools);
    engine.register(&approval_definition("tier2", "fail")).unwrap();

    let exec = engine.start("order", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Suspended);
    let suspended_at = engine.checkpoints(&exec.execution_id, 1).await.unwrap();
    let last = suspended_at.last().unwrap();
    assert_eq!(last.status, ExecutionStatus::Suspended);
    assert!(matches!(last.next, NextStep::AwaitingApproval(_)));

    let request = engine.pending_approvals(&exec.execution_id).await.unwrap().remove(0);
    let response = ApprovalResponse::new(&request.request_id, Decision::Edited)
        .with_payload(json!({"qty": 2}));
    let exec = engine.resume(&exec.execution_id, response.clone()).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get("qty"), Some(&json!(2)));
    assert_eq!(exec.state.get_str("review_decision"), Some("edited"));
    assert_eq!(submit.count(), 1);

    let approvals = engine.approvals(&exec.execution_id).await.unwrap();
    assert_eq!(approvals[0].decided_by.as_deref(), Some("anonymous"));

    // A second resume is a caller error and changes nothing.
    let err = engine.resume(&exec.execution_id, response).await.unwrap_err();
    assert!(matches!(err, WaylineError::InvalidStateTransition { .. }));
    assert_eq!(submit.count(), 1);
}

#[tokio::test]
async fn rejection_can_continue() {
    let (tools, submit) = order_tools();
    let engine = engine(tools);
    engine.register(&approval_definition("tier2", "continue")).unwrap();

    let exec = engine.start("order", "1", json!({})).await.unwrap();
    let request = engine.pending_approvals(&exec.execution_id).await.unwrap().remove(0);
    let exec = engine
        .resume(
            &exec.execution_id,
            ApprovalResponse::new(&request.request_id, Decision::Rejected).by("nurse.kim"),
        )
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get_str("review_decision"), Some("rejected"));
    assert_eq!(submit.count(), 1);
}

#[tokio::test]
async fn expired_approval_fails_by_default() {
    let (tools, submit) = order_tools();
    let engine = engine(tools);
    engine
        .register(&approval_definition_with(json!({"tier": "tier2", "timeout_secs": 60})))
        .unwrap();
    let exec = engine.start("order", "1", json!({})).await.unwrap();

    // Nothing has expired yet.
    assert!(engine.expire_approvals(Utc::now()).await.unwrap().is_empty());

    let later = Utc::now() + chrono::Duration::seconds(120);
    let touched = engine.expire_approvals(later).await.unwrap();
    assert_eq!(touched.len(), 1);
    assert_eq!(touched[0].status, ExecutionStatus::Failed);
    assert_eq!(touched[0].error.as_ref().unwrap().kind, "approval_timeout");
    assert_eq!(submit.count(), 0);

    let approvals = engine.approvals(&exec.execution_id).await.unwrap();
    assert_eq!(approvals[0].decision, Decision::Rejected);
    assert_eq!(approvals[0].decided_by.as_deref(), Some("system:timeout"));
}

#[tokio::test]
async fn expired_approval_can_fall_back_to_a_decision() {
    let (tools, submit) = order_tools();
    let engine = engine(tools);
    engine
        .register(&approval_definition_with(json!({
            "tier": "tier2",
            "timeout_secs": 60,
            "on_timeout": {"decide": "approved"}
        })))
        .unwrap();
    engine.start("order", "1", json!({})).await.unwrap();

    let later = Utc::now() + chrono::Duration::seconds(120);
    let touched = engine.expire_approvals(later).await.unwrap();
    assert_eq!(touched[0].status, ExecutionStatus::Completed);
    assert_eq!(submit.count(), 1);
}

// ── Scenario C and fanout ──────────────────────────────────────────

fn workup_tools(vitals_fail: bool) -> (ToolRegistry, Calls, Calls) {
    let mut tools = ToolRegistry::new();
    static_tool(&mut tools, "fetch_labs", json!({"labs": "normal"}));
    if vitals_fail {
        failing_tool(&mut tools, "fetch_vitals", "monitor offline");
    } else {
        static_tool(&mut tools, "fetch_vitals", json!({"vitals": {"hr": 72}}));
    }
    let imaging = static_tool(&mut tools, "fetch_imaging", json!({"imaging": "clear"}));
    let summarize = static_tool(&mut tools, "summarize", json!({"summary": "ok"}));
    (tools, imaging, summarize)
}

#[tokio::test]
async fn failing_branch_stops_fanout() {
    let (tools, imaging, summarize) = workup_tools(true);
    let engine = engine(tools);
    engine.register(&fanout_definition(false, Some(1))).unwrap();

    let exec = engine.start("workup", "1", json!({})).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    let error = exec.error.unwrap();
    assert_eq!(error.kind, "tool_invocation_error");
    assert_eq!(error.node_id.as_deref(), Some("vitals"));
    // Branch 3 never started and the fanin never ran.
    assert_eq!(imaging.count(), 0);
    assert_eq!(summarize.count(), 0);

    let checkpoints = engine.checkpoints(&exec.execution_id, 1).await.unwrap();
    assert!(checkpoints.iter().all(|c| c.node_id != "join"));
    assert_contiguous(&checkpoints);
}

#[tokio::test]
async fn fanout_merges_branches_in_declared_order() {
    let (tools, imaging, summarize) = workup_tools(false);
    let engine = engine(tools);
    engine.register(&fanout_definition(false, None)).unwrap();

    let exec = engine
        .start("workup", "1", json!({"patient_id": "P7"}))
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get("labs"), Some(&json!("normal")));
    assert_eq!(exec.state.get("vitals"), Some(&json!({"hr": 72})));
    assert_eq!(exec.state.get("imaging"), Some(&json!("clear")));
    assert_eq!(exec.state.get("patient_id"), Some(&json!("P7")));
    assert_eq!((imaging.count(), summarize.count()), (1, 1));

    let checkpoints = engine.checkpoints(&exec.execution_id, 1).await.unwrap();
    assert_contiguous(&checkpoints);
    // start, gather, three branch nodes, join, summarize
    assert_eq!(checkpoints.len(), 7);
    let branch_ids: Vec<&str> = checkpoints
        .iter()
        .filter_map(|c| c.branch_id.as_deref())
        .collect();
    assert_eq!(branch_ids.len(), 3);
    assert!(branch_ids.contains(&"gather/1:vitals"));
    assert_eq!(checkpoints[1].next, NextStep::Branches("gather".into()));
    let join = checkpoints.iter().find(|c| c.node_id == "join").unwrap();
    assert!(join.is_root());
}

#[tokio::test]
async fn best_effort_fanout_records_branch_errors() {
    let (tools, _, summarize) = workup_tools(true);
    let engine = engine(tools);
    engine.register(&fanout_definition(true, None)).unwrap();

    let exec = engine.start("workup", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(summarize.count(), 1);
    let errors = exec.state.get(BRANCH_ERRORS_KEY).unwrap().as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["branch_id"], "gather/1:vitals");
    assert_eq!(errors[0]["node_id"], "vitals");
    assert_eq!(exec.state.get("labs"), Some(&json!("normal")));
    assert!(exec.state.get("vitals").is_none());
}

// ── Retry ──────────────────────────────────────────────────────────

#[tokio::test]
async fn idempotent_tool_retries_until_success() {
    let mut tools = ToolRegistry::new();
    let flaky = flaky_tool(&mut tools, "lookup", 2, json!({"found": true}), true);
    let engine = engine(tools);
    engine.register(&linear_definition("lookup", &["lookup"])).unwrap();

    let mut events = engine.subscribe();
    let exec = engine.start("lookup", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(flaky.count(), 3);

    let checkpoints = engine.checkpoints(&exec.execution_id, 1).await.unwrap();
    let step = checkpoints.iter().find(|c| c.node_id == "step_1").unwrap();
    assert_eq!(step.invocations.len(), 1);
    assert_eq!(step.invocations[0].attempt_count, 3);

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::ToolRetry { .. } = event {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn non_idempotent_tool_is_not_retried() {
    let mut tools = ToolRegistry::new();
    let flaky = flaky_tool(&mut tools, "charge", 1, json!({"charged": true}), false);
    let engine = engine(tools);
    engine.register(&linear_definition("billing", &["charge"])).unwrap();

    let exec = engine.start("billing", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(flaky.count(), 1);

    let checkpoints = engine.checkpoints(&exec.execution_id, 1).await.unwrap();
    let failed = checkpoints.last().unwrap();
    assert_eq!(failed.invocations[0].attempt_count, 1);
    assert!(!failed.invocations[0].error.as_ref().unwrap().retryable);
}

// ── Loops ──────────────────────────────────────────────────────────

#[tokio::test]
async fn loop_runs_body_up_to_max_iterations() {
    let mut tools = ToolRegistry::new();
    let draft = static_tool(&mut tools, "draft_note", json!({"note": "v"}));
    let engine = engine(tools);
    engine.register(&loop_definition(3, None)).unwrap();

    let exec = engine.start("drafting", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(draft.count(), 3);
    assert_eq!(exec.state.get(ITERATIONS_KEY), Some(&json!({"revise": 0})));
}

#[tokio::test]
async fn loop_exits_early_when_condition_holds() {
    let mut tools = ToolRegistry::new();
    let draft = static_tool(&mut tools, "draft_note", json!({"done": true}));
    let engine = engine(tools);
    engine.register(&loop_definition(5, Some("done == true"))).unwrap();

    let exec = engine.start("drafting", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(draft.count(), 1);
}

// ── Replay ─────────────────────────────────────────────────────────

fn comparable(checkpoints: &[Checkpoint]) -> Vec<(String, Value, NextStep)> {
    checkpoints
        .iter()
        .map(|c| (c.node_id.clone(), c.state.to_value(), c.next.clone()))
        .collect()
}

#[tokio::test]
async fn replay_forks_without_rerunning_completed_nodes() {
    let mut tools = ToolRegistry::new();
    let fetch = static_tool(&mut tools, "fetch_patient", json!({"age": 54}));
    let classifier = scripted_classifier(&mut tools, "triage_classifier", &["specialist_b"]);
    let engine = engine(tools);
    engine.register(&triage_definition()).unwrap();

    let source = engine.start("triage", "1", json!({"patient_id": "P1"})).await.unwrap();
    let fork = engine.replay(&source.execution_id, 2).await.unwrap();

    assert_ne!(fork.execution_id, source.execution_id);
    assert_eq!(fork.status, ExecutionStatus::Completed);
    let origin = fork.forked_from.as_ref().unwrap();
    assert_eq!(origin.execution_id, source.execution_id);
    assert_eq!(origin.sequence_number, 2);

    // fetch ran once; the router ran again in the fork.
    assert_eq!(fetch.count(), 1);
    assert_eq!(classifier.count(), 2);

    let original = engine.checkpoints(&source.execution_id, 1).await.unwrap();
    let forked = engine.checkpoints(&fork.execution_id, 1).await.unwrap();
    assert_eq!(original.len(), 3);
    assert_contiguous(&forked);
    assert_eq!(comparable(&original), comparable(&forked));
    assert_eq!(fork.state, source.state);
}

#[tokio::test]
async fn replay_from_failure_checkpoint_is_refused() {
    let mut tools = ToolRegistry::new();
    failing_tool(&mut tools, "lookup", "gone");
    let engine = engine(tools);
    engine.register(&linear_definition("lookup", &["lookup"])).unwrap();

    let exec = engine.start("lookup", "1", json!({})).await.unwrap();
    let last = engine.checkpoints(&exec.execution_id, 1).await.unwrap().len() as u64;
    let err = engine.replay(&exec.execution_id, last).await.unwrap_err();
    assert!(matches!(err, WaylineError::InvalidStateTransition { .. }));

    let err = engine.replay(&exec.execution_id, 99).await.unwrap_err();
    assert!(matches!(err, WaylineError::CheckpointNotFound { .. }));
}

#[tokio::test]
async fn replay_of_suspended_checkpoint_raises_a_new_request() {
    let (tools, _) = order_tools();
    let engine = engine(tools);
    engine.register(&approval_definition("tier2", "fail")).unwrap();

    let source = engine.start("order", "1", json!({})).await.unwrap();
    let seq = engine.checkpoints(&source.execution_id, 1).await.unwrap().len() as u64;
    let fork = engine.replay(&source.execution_id, seq).await.unwrap();

    assert_eq!(fork.status, ExecutionStatus::Suspended);
    let source_req = engine.pending_approvals(&source.execution_id).await.unwrap();
    let fork_req = engine.pending_approvals(&fork.execution_id).await.unwrap();
    assert_eq!((source_req.len(), fork_req.len()), (1, 1));
    assert_ne!(source_req[0].request_id, fork_req[0].request_id);

    let fork = engine
        .resume(
            &fork.execution_id,
            ApprovalResponse::new(&fork_req[0].request_id, Decision::Approved),
        )
        .await
        .unwrap();
    assert_eq!(fork.status, ExecutionStatus::Completed);
    let source = engine.execution(&source.execution_id).await.unwrap();
    assert_eq!(source.status, ExecutionStatus::Suspended);
}

// ── Cancellation ───────────────────────────────────────────────────

#[tokio::test]
async fn cancelling_suspended_execution_closes_requests() {
    let (tools, submit) = order_tools();
    let engine = engine(tools);
    engine.register(&approval_definition("tier2", "fail")).unwrap();
    let exec = engine.start("order", "1", json!({})).await.unwrap();

    let cancelled = engine.cancel(&exec.execution_id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert_eq!(submit.count(), 0);
    let approvals = engine.approvals(&exec.execution_id).await.unwrap();
    assert_eq!(approvals[0].decision, Decision::Rejected);
    assert_eq!(approvals[0].decided_by.as_deref(), Some("system:cancelled"));

    let err = engine.cancel(&exec.execution_id).await.unwrap_err();
    assert!(matches!(err, WaylineError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn running_execution_stops_at_next_boundary() {
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let mut tools = ToolRegistry::new();
    let hold = gated_tool(&mut tools, "hold", entered.clone(), gate.clone(), json!({"held": true}));
    let after = static_tool(&mut tools, "after", json!({}));
    let engine = engine(tools);
    engine.register(&linear_definition("slow", &["hold", "after"])).unwrap();

    let exec = engine.create("slow", "1", json!({})).await.unwrap();
    let id = exec.execution_id.clone();
    let runner = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.run(&id).await })
    };
    entered.notified().await;

    let canceller = {
        let engine = engine.clone();
        let id = id.clone();
        tokio::spawn(async move { engine.cancel(&id).await })
    };
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    gate.notify_one();

    let finished = runner.await.unwrap().unwrap();
    assert_eq!(finished.status, ExecutionStatus::Cancelled);
    let cancelled = canceller.await.unwrap().unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    // The in-flight call finished; nothing after it ran.
    assert_eq!(hold.count(), 1);
    assert_eq!(after.count(), 0);
    let checkpoints = engine.checkpoints(&id, 1).await.unwrap();
    assert_eq!(node_ids(&checkpoints), vec!["start", "step_1"]);
}

// ── Recovery ───────────────────────────────────────────────────────

#[tokio::test]
async fn recovers_from_latest_checkpoint_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("wayline.db");
    let def = linear_definition("intake", &["register_patient", "notify_team"]);

    let id = {
        let mut tools = ToolRegistry::new();
        static_tool(&mut tools, "register_patient", json!({"mrn": "M-1"}));
        static_tool(&mut tools, "notify_team", json!({}));
        let engine = engine_on(tools, Stores::shared(SqliteStore::open(&db).unwrap()));
        engine.register(&def).unwrap();
        let exec = engine.create("intake", "1", json!({})).await.unwrap();
        engine.step(&exec.execution_id).await.unwrap();
        let exec = engine.step(&exec.execution_id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.current_node_id, "step_2");
        exec.execution_id
    };

    let mut tools = ToolRegistry::new();
    let register = static_tool(&mut tools, "register_patient", json!({"mrn": "M-2"}));
    let notify = static_tool(&mut tools, "notify_team", json!({"notified": true}));
    let engine = engine_on(tools, Stores::shared(SqliteStore::open(&db).unwrap()));
    engine.register(&def).unwrap();

    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered.len(), 1);
    let exec = &recovered[0];
    assert_eq!(exec.execution_id, id);
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get("mrn"), Some(&json!("M-1")));
    assert_eq!(register.count(), 0);
    assert_eq!(notify.count(), 1);

    let checkpoints = engine.checkpoints(&id, 1).await.unwrap();
    assert_eq!(node_ids(&checkpoints), vec!["start", "step_1", "step_2"]);
    assert_contiguous(&checkpoints);
}

// ── Interrupted fanouts ────────────────────────────────────────────

/// Counters for every tool of the workup definition, in branch order.
fn counted_workup_tools() -> (ToolRegistry, [Calls; 4]) {
    let mut tools = ToolRegistry::new();
    let labs = static_tool(&mut tools, "fetch_labs", json!({"labs": "normal"}));
    let vitals = static_tool(&mut tools, "fetch_vitals", json!({"vitals": {"hr": 72}}));
    let imaging = static_tool(&mut tools, "fetch_imaging", json!({"imaging": "clear"}));
    let summarize = static_tool(&mut tools, "summarize", json!({"summary": "ok"}));
    (tools, [labs, vitals, imaging, summarize])
}

fn counts(calls: &[Calls; 4]) -> [u32; 4] {
    [calls[0].count(), calls[1].count(), calls[2].count(), calls[3].count()]
}

#[tokio::test]
async fn replay_inside_fanout_keeps_finished_branches() {
    let (tools, calls) = counted_workup_tools();
    let engine = engine(tools);
    engine.register(&fanout_definition(false, Some(1))).unwrap();

    let source = engine.start("workup", "1", json!({})).await.unwrap();
    let checkpoints = engine.checkpoints(&source.execution_id, 1).await.unwrap();
    assert_eq!(
        node_ids(&checkpoints),
        vec!["start", "gather", "labs", "vitals", "imaging", "join", "summarize"]
    );
    assert_eq!(counts(&calls), [1, 1, 1, 1]);

    // Every branch had finished by checkpoint 5: only the fanin onwards runs.
    let fork = engine.replay(&source.execution_id, 5).await.unwrap();
    assert_eq!(fork.status, ExecutionStatus::Completed);
    assert_eq!(fork.forked_from.as_ref().unwrap().sequence_number, 5);
    assert_eq!(counts(&calls), [1, 1, 1, 2]);
    assert_eq!(fork.state.get("imaging"), Some(&json!("clear")));

    // At checkpoint 4 imaging had not run yet.
    let fork = engine.replay(&source.execution_id, 4).await.unwrap();
    assert_eq!(fork.status, ExecutionStatus::Completed);
    assert_eq!(fork.forked_from.as_ref().unwrap().sequence_number, 4);
    assert_eq!(counts(&calls), [1, 1, 2, 3]);
    assert_eq!(fork.state.get("labs"), Some(&json!("normal")));
    assert_eq!(fork.state.get("vitals"), Some(&json!({"hr": 72})));

    let copied = engine.checkpoints(&fork.execution_id, 1).await.unwrap();
    assert_contiguous(&copied);
    assert_eq!(node_ids(&copied), node_ids(&checkpoints));
}

#[tokio::test]
async fn recovery_inside_fanout_resumes_unfinished_branches() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("wayline.db");
    let def = fanout_definition(false, Some(1));

    let id = {
        let mut tools = ToolRegistry::new();
        static_tool(&mut tools, "fetch_labs", json!({"labs": "normal"}));
        static_tool(&mut tools, "fetch_vitals", json!({"vitals": {"hr": 72}}));
        // Never returns: the process stops while imaging is in flight.
        tools.register(ToolSpec::new("fetch_imaging"), |_| async {
            std::future::pending::<()>().await;
            Ok(json!({}))
        });
        static_tool(&mut tools, "summarize", json!({}));
        let engine = engine_on(tools, Stores::shared(SqliteStore::open(&db).unwrap()));
        engine.register(&def).unwrap();
        let exec = engine.create("workup", "1", json!({})).await.unwrap();
        let id = exec.execution_id.clone();

        let running = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.run(&id).await })
        };
        for _ in 0..200 {
            if engine.checkpoints(&id, 1).await.unwrap().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());
        id
    };

    let (tools, calls) = counted_workup_tools();
    let engine = engine_on(tools, Stores::shared(SqliteStore::open(&db).unwrap()));
    engine.register(&def).unwrap();

    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].execution_id, id);
    assert_eq!(recovered[0].status, ExecutionStatus::Completed);
    assert_eq!(counts(&calls), [0, 0, 1, 1]);
    assert_eq!(recovered[0].state.get("labs"), Some(&json!("normal")));

    let checkpoints = engine.checkpoints(&id, 1).await.unwrap();
    assert_contiguous(&checkpoints);
    assert_eq!(checkpoints.len(), 7);
}

// ── Stored but unapplied decisions ─────────────────────────────────

fn memory_stores(store: &Arc<MemoryStore>) -> Stores {
    Stores {
        checkpoints: store.clone(),
        executions: store.clone(),
    }
}

#[tokio::test]
async fn recovery_applies_decision_stored_before_restart() {
    let store = Arc::new(MemoryStore::new());
    let def = approval_definition("tier2", "fail");

    let (tools, _) = order_tools();
    let first = engine_on(tools, memory_stores(&store));
    first.register(&def).unwrap();
    let exec = first.start("order", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Suspended);

    // The decision reached the store, then the process stopped.
    let mut request = first.pending_approvals(&exec.execution_id).await.unwrap().remove(0);
    request.decide(Decision::Edited, "nurse.kim");
    request.edited_payload = Some(json!({"qty": 2}));
    store.save_approval(&request).await.unwrap();

    let (tools, submit) = order_tools();
    let engine = engine_on(tools, memory_stores(&store));
    engine.register(&def).unwrap();

    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered.len(), 1);
    let exec = &recovered[0];
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.state.get("qty"), Some(&json!(2)));
    assert_eq!(exec.state.get_str("review_decision"), Some("edited"));
    assert_eq!(submit.count(), 1);

    let checkpoints = engine.checkpoints(&exec.execution_id, 1).await.unwrap();
    assert_contiguous(&checkpoints);
    assert_eq!(
        node_ids(&checkpoints),
        vec!["start", "prepare", "review", "review", "submit"]
    );
}

#[tokio::test]
async fn recovery_applies_stored_rejection() {
    let store = Arc::new(MemoryStore::new());
    let def = approval_definition("tier2", "fail");

    let (tools, _) = order_tools();
    let first = engine_on(tools, memory_stores(&store));
    first.register(&def).unwrap();
    let exec = first.start("order", "1", json!({})).await.unwrap();
    let mut request = first.pending_approvals(&exec.execution_id).await.unwrap().remove(0);
    request.decide(Decision::Rejected, "nurse.kim");
    store.save_approval(&request).await.unwrap();

    let (tools, submit) = order_tools();
    let engine = engine_on(tools, memory_stores(&store));
    engine.register(&def).unwrap();

    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered[0].status, ExecutionStatus::Failed);
    assert_eq!(recovered[0].error.as_ref().unwrap().kind, "approval_rejected");
    assert_eq!(submit.count(), 0);
}

#[tokio::test]
async fn recovery_leaves_undecided_approvals_waiting() {
    let store = Arc::new(MemoryStore::new());
    let def = approval_definition("tier2", "fail");

    let (tools, _) = order_tools();
    let first = engine_on(tools, memory_stores(&store));
    first.register(&def).unwrap();
    let exec = first.start("order", "1", json!({})).await.unwrap();

    let (tools, _) = order_tools();
    let engine = engine_on(tools, memory_stores(&store));
    engine.register(&def).unwrap();
    assert!(engine.recover().await.unwrap().is_empty());
    let exec = engine.execution(&exec.execution_id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Suspended);
}

// ── Checkpoint write failures ──────────────────────────────────────

/// Accepts the first `limit` checkpoints of an execution and refuses the rest.
struct FullDisk {
    inner: MemoryStore,
    limit: u64,
}

impl CheckpointStore for FullDisk {
    fn append(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, wayline_core::error::Result<()>> {
        if checkpoint.sequence_number > self.limit {
            return Box::pin(async { Err(WaylineError::Database("disk full".into())) });
        }
        self.inner.append(checkpoint)
    }

    fn latest(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, wayline_core::error::Result<Option<Checkpoint>>> {
        self.inner.latest(execution_id)
    }

    fn get(
        &self,
        execution_id: &ExecutionId,
        sequence_number: u64,
    ) -> BoxFuture<'_, wayline_core::error::Result<Option<Checkpoint>>> {
        self.inner.get(execution_id, sequence_number)
    }

    fn list(
        &self,
        execution_id: &ExecutionId,
        from: u64,
    ) -> BoxFuture<'_, wayline_core::error::Result<Vec<Checkpoint>>> {
        self.inner.list(execution_id, from)
    }
}

#[tokio::test]
async fn unwritable_failure_checkpoint_is_reported_on_the_execution() {
    let mut tools = ToolRegistry::new();
    static_tool(&mut tools, "register_patient", json!({"mrn": "M-1"}));
    let notify = static_tool(&mut tools, "notify_team", json!({}));
    let stores = Stores {
        checkpoints: Arc::new(FullDisk {
            inner: MemoryStore::new(),
            limit: 1,
        }),
        executions: Arc::new(MemoryStore::new()),
    };
    let engine = engine_on(tools, stores);
    engine
        .register(&linear_definition("intake", &["register_patient", "notify_team"]))
        .unwrap();

    let exec = engine.start("intake", "1", json!({})).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    let error = exec.error.unwrap();
    assert_eq!(error.kind, "checkpoint_write_error");
    assert_eq!(error.node_id.as_deref(), Some("step_1"));
    assert!(error.checkpoint_error.unwrap().contains("disk full"));
    assert_eq!(notify.count(), 0);
    assert_eq!(engine.checkpoints(&exec.execution_id, 1).await.unwrap().len(), 1);
}

// ── Concurrency ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executions_keep_their_own_sequences() {
    let mut tools = ToolRegistry::new();
    slow_tool(&mut tools, "fetch_labs", Duration::from_millis(5), json!({"labs": 1}));
    slow_tool(&mut tools, "fetch_vitals", Duration::from_millis(3), json!({"vitals": 2}));
    slow_tool(&mut tools, "fetch_imaging", Duration::from_millis(1), json!({"imaging": 3}));
    static_tool(&mut tools, "summarize", json!({}));
    let engine = engine(tools);
    engine.register(&fanout_definition(false, None)).unwrap();

    let runs = (0..8).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start("workup", "1", json!({"n": i})).await })
    });
    let results = futures::future::join_all(runs).await;

    for result in results {
        let exec = result.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        let checkpoints = engine.checkpoints(&exec.execution_id, 1).await.unwrap();
        assert_eq!(checkpoints.len(), 7);
        assert_contiguous(&checkpoints);
        assert!(checkpoints.iter().all(|c| c.execution_id == exec.execution_id));
    }
}

#[tokio::test]
async fn events_follow_the_lifecycle() {
    let mut tools = ToolRegistry::new();
    static_tool(&mut tools, "fetch_patient", json!({}));
    scripted_classifier(&mut tools, "triage_classifier", &["specialist_a"]);
    let engine = engine(tools);
    engine.register(&triage_definition()).unwrap();

    let mut events = engine.subscribe();
    engine.start("triage", "1", json!({})).await.unwrap();

    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(EngineEvent::ExecutionStarted { .. })));
    assert!(matches!(
        seen.last(),
        Some(EngineEvent::ExecutionFinished {
            status: ExecutionStatus::Completed,
            ..
        })
    ));
    let written = seen
        .iter()
        .filter(|e| matches!(e, EngineEvent::CheckpointWritten { .. }))
        .count();
    assert_eq!(written, 3);
}

#[tokio::test]
async fn caller_errors_leave_state_alone() {
    let engine = engine(ToolRegistry::new());
    let missing = wayline_core::types::ExecutionId::new();
    assert!(matches!(
        engine.execution(&missing).await,
        Err(WaylineError::ExecutionNotFound(_))
    ));
    assert!(matches!(
        engine.start("nope", "1", json!({})).await,
        Err(WaylineError::DefinitionNotFound { .. })
    ));
}
