//! Mock tools and workflow fixtures shared by Wayline test suites.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Notify;

use wayline_core::config::RetryConfig;
use wayline_core::definition::{EdgeSpec, NodeSpec, NodeType, WorkflowDefinition};
use wayline_core::error::ToolInvocationError;
use wayline_tools::{ToolRegistry, ToolSpec};

/// Call counter handed back by every mock tool.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicU32>);

impl Calls {
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Retry policy with millisecond backoff so retry tests stay fast.
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
    }
}

/// A tool that always returns `output`.
pub fn static_tool(tools: &mut ToolRegistry, name: &str, output: Value) -> Calls {
    let calls = Calls::default();
    let counter = calls.clone();
    tools.register(ToolSpec::new(name), move |_| {
        counter.bump();
        let output = output.clone();
        async move { Ok(output) }
    });
    calls
}

/// A tool that always fails fatally.
pub fn failing_tool(tools: &mut ToolRegistry, name: &str, message: &str) -> Calls {
    let calls = Calls::default();
    let counter = calls.clone();
    let tool = name.to_string();
    let message = message.to_string();
    tools.register(ToolSpec::new(name), move |_| {
        counter.bump();
        let err = ToolInvocationError::failed(tool.clone(), message.clone());
        async move { Err(err) }
    });
    calls
}

/// A tool that fails transiently `failures` times, then returns `output`.
pub fn flaky_tool(
    tools: &mut ToolRegistry,
    name: &str,
    failures: u32,
    output: Value,
    idempotent: bool,
) -> Calls {
    let calls = Calls::default();
    let counter = calls.clone();
    let tool = name.to_string();
    tools.register(ToolSpec::new(name).idempotent(idempotent), move |_| {
        let attempt = counter.bump();
        let result = if attempt <= failures {
            Err(ToolInvocationError::transient(tool.clone(), "upstream unavailable"))
        } else {
            Ok(output.clone())
        };
        async move { result }
    });
    calls
}

/// A tool that sleeps for `delay` before answering.
pub fn slow_tool(tools: &mut ToolRegistry, name: &str, delay: Duration, output: Value) -> Calls {
    let calls = Calls::default();
    let counter = calls.clone();
    tools.register(ToolSpec::new(name), move |_| {
        counter.bump();
        let output = output.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok(output)
        }
    });
    calls
}

/// A tool that blocks until `gate` is notified. `entered` is notified once
/// the call has started.
pub fn gated_tool(
    tools: &mut ToolRegistry,
    name: &str,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
    output: Value,
) -> Calls {
    let calls = Calls::default();
    let counter = calls.clone();
    tools.register(ToolSpec::new(name), move |_| {
        counter.bump();
        let entered = entered.clone();
        let gate = gate.clone();
        let output = output.clone();
        async move {
            entered.notify_one();
            gate.notified().await;
            Ok(output)
        }
    });
    calls
}

/// A classifier returning `workers` in order, repeating the last one.
pub fn scripted_classifier(tools: &mut ToolRegistry, name: &str, workers: &[&str]) -> Calls {
    let calls = Calls::default();
    let counter = calls.clone();
    let workers: Vec<String> = workers.iter().map(|w| w.to_string()).collect();
    tools.register(ToolSpec::new(name), move |_| {
        let n = counter.bump() as usize;
        let worker = workers
            .get(n - 1)
            .or_else(|| workers.last())
            .cloned()
            .unwrap_or_default();
        async move { Ok(json!({ "worker": worker })) }
    });
    calls
}

fn tool_node(id: &str, tool: &str) -> NodeSpec {
    NodeSpec::new(id, NodeType::Tool).with_config(json!({ "tool": tool }))
}

/// `start → fetch(fetch_patient) → route(triage_classifier) → end`.
///
/// Needs tools `fetch_patient` and `triage_classifier`.
pub fn triage_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("triage", "1")
        .node(NodeSpec::new("start", NodeType::Start))
        .node(tool_node("fetch", "fetch_patient"))
        .node(NodeSpec::new("route", NodeType::Router).with_config(json!({
            "classifier": "triage_classifier",
            "candidates": ["specialist_a", "specialist_b"]
        })))
        .node(NodeSpec::new("end", NodeType::End))
        .edge(EdgeSpec::always("start", "fetch"))
        .edge(EdgeSpec::always("fetch", "route"))
        .edge(EdgeSpec::always("route", "end"))
}

/// `start → prepare(prepare_order) → review(approval) → submit(submit_order) → end`.
///
/// `tier` and `on_reject` are passed through to the approval config.
pub fn approval_definition(tier: &str, on_reject: &str) -> WorkflowDefinition {
    approval_definition_with(json!({ "tier": tier, "on_reject": on_reject }))
}

/// Same shape as [`approval_definition`] with a raw approval config.
pub fn approval_definition_with(config: Value) -> WorkflowDefinition {
    WorkflowDefinition::new("order", "1")
        .node(NodeSpec::new("start", NodeType::Start))
        .node(tool_node("prepare", "prepare_order"))
        .node(NodeSpec::new("review", NodeType::Approval).with_config(config))
        .node(tool_node("submit", "submit_order"))
        .node(NodeSpec::new("end", NodeType::End))
        .edge(EdgeSpec::always("start", "prepare"))
        .edge(EdgeSpec::always("prepare", "review"))
        .edge(EdgeSpec::always("review", "submit"))
        .edge(EdgeSpec::always("submit", "end"))
}

/// `start → gather(fanout: labs, vitals, imaging) → join(fanin) → summarize → end`.
///
/// Needs tools `fetch_labs`, `fetch_vitals`, `fetch_imaging` and `summarize`.
pub fn fanout_definition(best_effort: bool, max_concurrency: Option<usize>) -> WorkflowDefinition {
    let mut fanout = json!({
        "branches": ["labs", "vitals", "imaging"],
        "fanin": "join",
        "best_effort": best_effort
    });
    if let Some(limit) = max_concurrency {
        fanout["max_concurrency"] = json!(limit);
    }
    WorkflowDefinition::new("workup", "1")
        .node(NodeSpec::new("start", NodeType::Start))
        .node(NodeSpec::new("gather", NodeType::Fanout).with_config(fanout))
        .node(tool_node("labs", "fetch_labs"))
        .node(tool_node("vitals", "fetch_vitals"))
        .node(tool_node("imaging", "fetch_imaging"))
        .node(NodeSpec::new("join", NodeType::Fanin))
        .node(tool_node("summarize", "summarize"))
        .node(NodeSpec::new("end", NodeType::End))
        .edge(EdgeSpec::always("start", "gather"))
        .edge(EdgeSpec::always("labs", "join"))
        .edge(EdgeSpec::always("vitals", "join"))
        .edge(EdgeSpec::always("imaging", "join"))
        .edge(EdgeSpec::always("join", "summarize"))
        .edge(EdgeSpec::always("summarize", "end"))
}

/// `start → revise(loop) ⇄ draft(draft_note)`, exiting `revise → end`.
pub fn loop_definition(max_iterations: u32, until: Option<&str>) -> WorkflowDefinition {
    let mut config = json!({ "max_iterations": max_iterations, "body": "draft" });
    if let Some(until) = until {
        config["until"] = json!(until);
    }
    WorkflowDefinition::new("drafting", "1")
        .node(NodeSpec::new("start", NodeType::Start))
        .node(NodeSpec::new("revise", NodeType::Loop).with_config(config))
        .node(tool_node("draft", "draft_note"))
        .node(NodeSpec::new("end", NodeType::End))
        .edge(EdgeSpec::always("start", "revise"))
        .edge(EdgeSpec::always("draft", "revise"))
        .edge(EdgeSpec::always("revise", "end"))
}

/// `start → step_1 → … → step_n → end`, one tool node per entry of `tools`.
pub fn linear_definition(id: &str, tools: &[&str]) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(id, "1").node(NodeSpec::new("start", NodeType::Start));
    let mut prev = "start".to_string();
    for (i, tool) in tools.iter().enumerate() {
        let node_id = format!("step_{}", i + 1);
        def = def
            .node(tool_node(&node_id, tool))
            .edge(EdgeSpec::always(prev.clone(), node_id.clone()));
        prev = node_id;
    }
    def.node(NodeSpec::new("end", NodeType::End))
        .edge(EdgeSpec::always(prev, "end"))
}
