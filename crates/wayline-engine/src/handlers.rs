//! Node handlers. Each typed node config knows how to execute itself; the
//! engine looks the handler up through [`NodeKind::handler`].

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use wayline_core::error::{ToolErrorKind, ToolInvocationError, WaylineError};
use wayline_core::state::{
    decision_key, State, BRANCH_ERRORS_KEY, ITERATIONS_KEY, ROUTING_KEY, SELECTED_WORKER_KEY,
};
use wayline_core::types::{ApprovalRequest, Decision, ExecutionId, ToolInvocation};

use crate::approval::{self, POLICY_REVIEWER};
use crate::graph::{
    ApprovalConfig, CompiledGraph, FaninConfig, FanoutConfig, LoopNode, MergeStrategy, NodeKind,
    RouterConfig, ToolConfig,
};
use crate::retry::ToolInvoker;

/// Everything a handler may read while executing one node.
pub struct NodeContext<'a> {
    pub execution_id: &'a ExecutionId,
    pub node_id: &'a str,
    pub graph: &'a CompiledGraph,
    pub invoker: &'a ToolInvoker,
    pub cancel: &'a CancellationToken,
    /// Default lifetime of approval requests.
    pub approval_timeout_secs: u64,
    /// Branch results, present only when executing a fanin.
    pub fanin: Option<&'a FaninInput>,
}

/// What the branches of a fanout produced, handed to its fanin.
#[derive(Debug, Clone, Default)]
pub struct FaninInput {
    /// State at the fanout.
    pub base: State,
    /// Updates of each successful branch, in declared branch order.
    pub updates: Vec<State>,
    /// `{branch_id, kind, message, node_id}` of failed branches (best effort only).
    pub errors: Vec<Value>,
}

/// Where control goes after a handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Take the first matching outgoing edge.
    FollowEdges,
    /// Jump to a specific node.
    Goto(String),
    /// Wait for the approval request in the output.
    Suspend,
    /// Run this fanout's branches.
    Branches,
}

#[derive(Debug)]
pub struct NodeOutput {
    pub state: State,
    pub transition: Transition,
    pub invocations: Vec<ToolInvocation>,
    /// Request raised by an approval node, decided already for Tier1.
    pub approval: Option<ApprovalRequest>,
}

impl NodeOutput {
    fn follow(state: State) -> Self {
        Self {
            state,
            transition: Transition::FollowEdges,
            invocations: vec![],
            approval: None,
        }
    }

    fn goto(state: State, target: impl Into<String>) -> Self {
        Self {
            transition: Transition::Goto(target.into()),
            ..Self::follow(state)
        }
    }
}

/// A failed node, with the tool calls it made before failing.
#[derive(Debug)]
pub struct NodeFailure {
    pub error: WaylineError,
    pub invocations: Vec<ToolInvocation>,
}

impl From<WaylineError> for NodeFailure {
    fn from(error: WaylineError) -> Self {
        Self {
            error,
            invocations: vec![],
        }
    }
}

pub type HandlerResult = Result<NodeOutput, NodeFailure>;

pub trait NodeHandler: Send + Sync {
    fn execute<'a>(&'a self, ctx: &'a NodeContext<'a>, state: State)
        -> BoxFuture<'a, HandlerResult>;
}

impl NodeKind {
    pub fn handler(&self) -> &dyn NodeHandler {
        match self {
            Self::Start | Self::End => &Passthrough,
            Self::Tool(c) => c,
            Self::Router(c) => c,
            Self::Approval(c) => c,
            Self::Fanout(c) => c,
            Self::Fanin(c) => c,
            Self::Loop(l) => l,
        }
    }
}

/// Start and end nodes leave state untouched.
struct Passthrough;

impl NodeHandler for Passthrough {
    fn execute<'a>(
        &'a self,
        _ctx: &'a NodeContext<'a>,
        state: State,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move { Ok(NodeOutput::follow(state)) })
    }
}

/// Call a tool and fail the node with the recorded invocation on error.
async fn call_tool(
    ctx: &NodeContext<'_>,
    tool: &str,
    input: Value,
    max_retries: Option<u32>,
    invocations: &mut Vec<ToolInvocation>,
) -> Result<Value, NodeFailure> {
    let (record, result) = ctx
        .invoker
        .call(ctx.execution_id, tool, input, max_retries, ctx.cancel)
        .await;
    invocations.push(record);
    result.map_err(|e: ToolInvocationError| NodeFailure {
        error: e.into(),
        invocations: std::mem::take(invocations),
    })
}

impl ToolConfig {
    fn build_input(&self, state: &State) -> Value {
        if self.input.is_empty() && self.input_keys.is_empty() {
            return state.to_value();
        }
        let mut input: Map<String, Value> = self.input.clone();
        for key in &self.input_keys {
            if let Some(value) = state.get(key) {
                input.insert(key.clone(), value.clone());
            }
        }
        Value::Object(input)
    }

    fn store_output(&self, state: &mut State, output: Value) {
        match (&self.output_key, output) {
            (Some(key), output) => state.set(key.clone(), output),
            (None, output @ Value::Object(_)) => state.merge_value(&output),
            (None, output) => state.set(self.tool.clone(), output),
        }
    }
}

impl NodeHandler for ToolConfig {
    fn execute<'a>(
        &'a self,
        ctx: &'a NodeContext<'a>,
        mut state: State,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let mut invocations = Vec::new();
            let input = self.build_input(&state);
            let output =
                call_tool(ctx, &self.tool, input, self.max_retries, &mut invocations).await?;
            self.store_output(&mut state, output);
            Ok(NodeOutput {
                invocations,
                ..NodeOutput::follow(state)
            })
        })
    }
}

impl RouterConfig {
    fn worker_from(&self, node_id: &str, output: &Value) -> Result<String, WaylineError> {
        let worker = output
            .as_str()
            .or_else(|| output.get("worker").and_then(|w| w.as_str()))
            .ok_or_else(|| WaylineError::RoutingDeadEnd {
                node_id: node_id.to_string(),
                reason: format!("classifier '{}' returned no worker", self.classifier),
            })?;
        if !self.candidates.iter().any(|c| c == worker) {
            return Err(WaylineError::RoutingDeadEnd {
                node_id: node_id.to_string(),
                reason: format!("classifier selected '{}', which is not a candidate", worker),
            });
        }
        Ok(worker.to_string())
    }
}

impl NodeHandler for RouterConfig {
    fn execute<'a>(
        &'a self,
        ctx: &'a NodeContext<'a>,
        mut state: State,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let mut invocations = Vec::new();
            let mut input = state.project(&self.input_keys);
            if let Some(obj) = input.as_object_mut() {
                obj.insert("candidates".into(), json!(self.candidates));
            }
            let output = call_tool(ctx, &self.classifier, input, None, &mut invocations).await?;
            let worker = self
                .worker_from(ctx.node_id, &output)
                .map_err(|error| NodeFailure {
                    error,
                    invocations: invocations.clone(),
                })?;

            debug!(execution_id = %ctx.execution_id, router = ctx.node_id, worker = %worker, "Worker selected");
            state.set_str(SELECTED_WORKER_KEY, worker.clone());
            state.push(
                ROUTING_KEY,
                json!({"node_id": ctx.node_id, "worker": worker}),
            );

            let transition = match self.routes.get(&worker) {
                Some(target) => Transition::Goto(target.clone()),
                None if ctx.graph.node(&worker).is_some() => Transition::Goto(worker),
                None => Transition::FollowEdges,
            };
            Ok(NodeOutput {
                state,
                transition,
                invocations,
                approval: None,
            })
        })
    }
}

impl NodeHandler for ApprovalConfig {
    fn execute<'a>(
        &'a self,
        ctx: &'a NodeContext<'a>,
        mut state: State,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let mut request =
                approval::build_request(ctx.execution_id, ctx.node_id, self, &state, ctx.approval_timeout_secs);

            if !self.tier.suspends() {
                request.decide(Decision::Approved, POLICY_REVIEWER);
                state.set_str(decision_key(ctx.node_id), Decision::Approved.to_string());
                return Ok(NodeOutput {
                    approval: Some(request),
                    ..NodeOutput::follow(state)
                });
            }

            Ok(NodeOutput {
                state,
                transition: Transition::Suspend,
                invocations: vec![],
                approval: Some(request),
            })
        })
    }
}

impl NodeHandler for FanoutConfig {
    fn execute<'a>(
        &'a self,
        _ctx: &'a NodeContext<'a>,
        state: State,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            Ok(NodeOutput {
                transition: Transition::Branches,
                ..NodeOutput::follow(state)
            })
        })
    }
}

impl NodeHandler for FaninConfig {
    fn execute<'a>(
        &'a self,
        ctx: &'a NodeContext<'a>,
        state: State,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let Some(input) = ctx.fanin else {
                // Reached outside a fanout: nothing to merge.
                return Ok(NodeOutput::follow(state));
            };

            let mut merged = input.base.clone();
            let mut invocations = Vec::new();
            match &self.merge {
                MergeStrategy::LastWriterWins => {
                    for update in &input.updates {
                        merged.merge(update);
                    }
                }
                MergeStrategy::Collect => {
                    let mut keys: Vec<&String> =
                        input.updates.iter().flat_map(|u| u.data().keys()).collect();
                    keys.sort();
                    keys.dedup();
                    for key in keys {
                        let values: Vec<Value> = input
                            .updates
                            .iter()
                            .filter_map(|u| u.get(key).cloned())
                            .collect();
                        merged.set(key.clone(), Value::Array(values));
                    }
                }
                MergeStrategy::Tool(tool) => {
                    let payload = json!({
                        "base": input.base.to_value(),
                        "branches": input.updates.iter().map(State::to_value).collect::<Vec<_>>(),
                    });
                    let output = call_tool(ctx, tool, payload, None, &mut invocations).await?;
                    if !output.is_object() {
                        return Err(NodeFailure {
                            error: ToolInvocationError::new(
                                tool.clone(),
                                ToolErrorKind::InvalidOutput,
                                "merge tool must return an object",
                            )
                            .into(),
                            invocations,
                        });
                    }
                    merged.merge_value(&output);
                }
            }

            if !input.errors.is_empty() {
                merged.set(BRANCH_ERRORS_KEY, Value::Array(input.errors.clone()));
            }
            Ok(NodeOutput {
                invocations,
                ..NodeOutput::follow(merged)
            })
        })
    }
}

impl NodeHandler for LoopNode {
    fn execute<'a>(
        &'a self,
        ctx: &'a NodeContext<'a>,
        mut state: State,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let done = state.counter(ITERATIONS_KEY, ctx.node_id);
            let satisfied = self.until.as_ref().is_some_and(|c| c.evaluate(&state));
            if done >= u64::from(self.max_iterations) || satisfied {
                debug!(execution_id = %ctx.execution_id, node = ctx.node_id, iterations = done, "Loop exited");
                state.set_counter(ITERATIONS_KEY, ctx.node_id, 0);
                return Ok(NodeOutput::follow(state));
            }
            state.set_counter(ITERATIONS_KEY, ctx.node_id, done + 1);
            Ok(NodeOutput::goto(state, self.body.clone()))
        })
    }
}
