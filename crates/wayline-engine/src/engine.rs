use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wayline_core::config::{EngineConfig, RetryConfig};
use wayline_core::definition::WorkflowDefinition;
use wayline_core::error::{Result, WaylineError};
use wayline_core::event::EventBus;
use wayline_core::state::{decision_key, State, ERROR_KEY};
use wayline_core::traits::{CheckpointStore, ExecutionStore};
use wayline_core::types::{
    ApprovalRequest, ApprovalResponse, Checkpoint, Decision, EngineEvent, ExecutionError,
    ExecutionId, ExecutionStatus, ForkOrigin, NextStep, ToolInvocation, WorkflowExecution,
};
use wayline_tools::ToolRegistry;

use crate::approval::{self, ANONYMOUS_REVIEWER, CANCEL_REVIEWER, TIMEOUT_REVIEWER};
use crate::checkpoint::{CheckpointWriter, Draft};
use crate::fanout::{branch_progress, BranchProgress};
use crate::graph::{compile, CompiledGraph, NodeKind, RejectPolicy, TimeoutPolicy};
use crate::handlers::{NodeContext, NodeFailure, NodeOutput, Transition};
use crate::registry::DefinitionRegistry;
use crate::retry::ToolInvoker;

/// Where an execution goes next and the state it carries there.
pub(crate) struct Cursor {
    pub next: NextStep,
    pub state: State,
    /// Branches of the pending fanout that already made progress.
    pub branches: Vec<BranchProgress>,
}

impl Cursor {
    fn at(next: NextStep, state: State) -> Self {
        Self {
            next,
            state,
            branches: Vec::new(),
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// A decision about to be applied to a suspended execution.
struct Verdict {
    decision: Decision,
    reviewer: String,
    edits: Option<Value>,
    timed_out: bool,
}

impl Verdict {
    /// The verdict a stored decision stands for.
    fn recorded(request: &ApprovalRequest, graph: &CompiledGraph) -> Self {
        let reviewer = request
            .decided_by
            .clone()
            .unwrap_or_else(|| ANONYMOUS_REVIEWER.to_string());
        let falls_back = matches!(
            graph.node(&request.node_id).map(|n| &n.kind),
            Some(NodeKind::Approval(config))
                if matches!(config.on_timeout, TimeoutPolicy::Decide(d) if d != Decision::Pending)
        );
        Self {
            decision: request.decision,
            timed_out: reviewer == TIMEOUT_REVIEWER && !falls_back,
            reviewer,
            edits: request.edited_payload.clone(),
        }
    }
}

/// Drives workflow executions through their compiled graphs.
///
/// Every public operation on one execution serializes on that execution's
/// drive lock, so a resume can never race a running step. Different
/// executions proceed independently.
pub struct ExecutionEngine {
    definitions: DefinitionRegistry,
    tools: Arc<ToolRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) executions: Arc<dyn ExecutionStore>,
    pub(crate) writer: CheckpointWriter,
    pub(crate) invoker: ToolInvoker,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) config: EngineConfig,
    retry: RetryConfig,
    drive_locks: Mutex<HashMap<ExecutionId, Arc<tokio::sync::Mutex<()>>>>,
    tokens: Mutex<HashMap<ExecutionId, CancellationToken>>,
}

impl ExecutionEngine {
    pub fn new(
        tools: Arc<ToolRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        executions: Arc<dyn ExecutionStore>,
    ) -> Self {
        let config = EngineConfig::default();
        let retry = RetryConfig::default();
        let event_bus = Arc::new(EventBus::default());
        Self {
            definitions: DefinitionRegistry::new(),
            writer: CheckpointWriter::new(checkpoints.clone(), config.checkpoint_write_attempts),
            invoker: ToolInvoker::new(tools.clone(), retry.clone(), event_bus.clone()),
            tools,
            checkpoints,
            executions,
            event_bus,
            config,
            retry,
            drive_locks: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig, retry: RetryConfig) -> Self {
        self.writer = CheckpointWriter::new(self.checkpoints.clone(), config.checkpoint_write_attempts);
        self.config = config;
        self.retry = retry;
        self.rebuild_invoker();
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self.rebuild_invoker();
        self
    }

    fn rebuild_invoker(&mut self) {
        self.invoker = ToolInvoker::new(self.tools.clone(), self.retry.clone(), self.event_bus.clone());
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    // ── Definitions ────────────────────────────────────────────────

    /// Compile and register a definition.
    pub fn register(&self, definition: &WorkflowDefinition) -> Result<Arc<CompiledGraph>> {
        let graph = compile(definition, &self.tools).map_err(|e| {
            warn!(definition = %definition.id, version = %definition.version, error = %e, "Definition rejected");
            WaylineError::from(e)
        })?;
        self.definitions.insert(graph)
    }

    /// Register an already compiled graph.
    pub fn register_graph(&self, graph: CompiledGraph) -> Result<Arc<CompiledGraph>> {
        self.definitions.insert(graph)
    }

    /// Compile and register every `*.json` definition in `dir`.
    pub fn load_definitions(&self, dir: &Path) -> Result<Vec<Arc<CompiledGraph>>> {
        WorkflowDefinition::load_dir(dir)?
            .iter()
            .map(|def| self.register(def))
            .collect()
    }

    pub fn definition(&self, id: &str, version: &str) -> Result<Arc<CompiledGraph>> {
        self.definitions.get(id, version)
    }

    pub fn definitions(&self) -> Vec<Arc<CompiledGraph>> {
        self.definitions.list()
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Create a Pending execution of a registered definition.
    pub async fn create(
        &self,
        definition_id: &str,
        version: &str,
        input: Value,
    ) -> Result<WorkflowExecution> {
        let graph = self.definitions.get(definition_id, version)?;
        let exec = WorkflowExecution::new(
            graph.id.clone(),
            graph.version.clone(),
            graph.start.clone(),
            State::from_value(input),
        );
        self.executions.save_execution(&exec).await?;
        info!(
            execution_id = %exec.execution_id,
            definition = %graph.id,
            version = %graph.version,
            "Execution created"
        );
        Ok(exec)
    }

    /// Create an execution and run it until it suspends or finishes.
    pub async fn start(
        &self,
        definition_id: &str,
        version: &str,
        input: Value,
    ) -> Result<WorkflowExecution> {
        let exec = self.create(definition_id, version, input).await?;
        self.run(&exec.execution_id).await
    }

    /// Register `graph` if needed, then start an execution of it.
    pub async fn start_graph(&self, graph: CompiledGraph, input: Value) -> Result<WorkflowExecution> {
        let graph = self.definitions.insert(graph)?;
        self.start(&graph.id, &graph.version, input).await
    }

    /// Run a Pending or Running execution until it suspends or finishes.
    /// Suspended and terminal executions are returned unchanged.
    pub async fn run(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution> {
        let lock = self.lock_for(execution_id)?;
        let _guard = lock.lock().await;

        let mut exec = self.load(execution_id).await?;
        if !self.begin(&mut exec).await? {
            return Ok(exec);
        }
        let graph = self.graph_for(&exec)?;
        let token = self.token_for(execution_id)?;
        let mut cursor = self.cursor(&exec, &graph).await?;
        self.drive(&mut exec, &graph, &mut cursor, &token).await?;
        Ok(exec)
    }

    /// Execute a single node (or one whole fanout) and stop.
    pub async fn step(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution> {
        let lock = self.lock_for(execution_id)?;
        let _guard = lock.lock().await;

        let mut exec = self.load(execution_id).await?;
        if !self.begin(&mut exec).await? {
            return Ok(exec);
        }
        let graph = self.graph_for(&exec)?;
        let token = self.token_for(execution_id)?;
        let mut cursor = self.cursor(&exec, &graph).await?;
        self.advance(&mut exec, &graph, &mut cursor, &token).await?;
        Ok(exec)
    }

    /// Apply a reviewer's decision to a suspended execution and keep running.
    pub async fn resume(
        &self,
        execution_id: &ExecutionId,
        response: ApprovalResponse,
    ) -> Result<WorkflowExecution> {
        let lock = self.lock_for(execution_id)?;
        let _guard = lock.lock().await;

        let mut exec = self.load(execution_id).await?;
        if exec.status != ExecutionStatus::Suspended {
            return Err(WaylineError::InvalidStateTransition {
                execution_id: execution_id.to_string(),
                status: exec.status,
                action: "resume".into(),
            });
        }
        let request = self
            .executions
            .load_approval(&response.approval_request_id)
            .await?
            .ok_or_else(|| WaylineError::ApprovalNotFound(response.approval_request_id.clone()))?;
        let reviewer = approval::validate_response(execution_id, &request, &response)?;

        let graph = self.graph_for(&exec)?;
        let mut cursor = self.cursor(&exec, &graph).await?;
        if cursor.next != NextStep::AwaitingApproval(request.request_id.clone()) {
            return Err(WaylineError::InvalidDecision(format!(
                "execution {} is not waiting on request {}",
                execution_id, request.request_id
            )));
        }

        let verdict = Verdict {
            decision: response.decision,
            reviewer,
            edits: response.edited_payload,
            timed_out: false,
        };
        let token = self.token_for(execution_id)?;
        if let Flow::Continue = self.decide(&mut exec, &graph, &mut cursor, request, verdict).await? {
            self.drive(&mut exec, &graph, &mut cursor, &token).await?;
        }
        Ok(exec)
    }

    /// Cancel a non-terminal execution. A running execution stops at its next
    /// node boundary; in-flight tool calls finish first.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution> {
        let exec = self.load(execution_id).await?;
        if exec.status.is_terminal() {
            return Err(WaylineError::InvalidStateTransition {
                execution_id: execution_id.to_string(),
                status: exec.status,
                action: "cancel".into(),
            });
        }
        self.token_for(execution_id)?.cancel();
        info!(execution_id = %execution_id, status = %exec.status, "Cancellation requested");

        let lock = self.lock_for(execution_id)?;
        let _guard = lock.lock().await;
        let mut exec = self.load(execution_id).await?;
        if !exec.status.is_terminal() {
            self.finish_cancelled(&mut exec).await?;
        }
        Ok(exec)
    }

    /// Fork a new execution from checkpoint `from` of `execution_id` and run it.
    ///
    /// The fork copies checkpoints `1..=from` and continues from the state they
    /// record. For a checkpoint inside a fanout branch, branches that reached
    /// the fanin by `from` keep their results and the rest continue from their
    /// own latest checkpoint. The source execution is untouched.
    pub async fn replay(&self, execution_id: &ExecutionId, from: u64) -> Result<WorkflowExecution> {
        let source = self.load(execution_id).await?;
        let graph = self.graph_for(&source)?;
        let not_found = || WaylineError::CheckpointNotFound {
            execution_id: execution_id.to_string(),
            sequence_number: from,
        };
        let target = self
            .checkpoints
            .get(execution_id, from)
            .await?
            .ok_or_else(not_found)?;
        let history: Vec<Checkpoint> = self
            .checkpoints
            .list(execution_id, 1)
            .await?
            .into_iter()
            .filter(|cp| cp.sequence_number <= from)
            .collect();
        let (origin, resumed) = resume_point(&graph, &history).ok_or_else(not_found)?;

        let refused = || WaylineError::InvalidStateTransition {
            execution_id: execution_id.to_string(),
            status: target.status,
            action: format!("replay from checkpoint {}", from),
        };
        if target.status.is_terminal() || resumed.next == NextStep::Halt {
            return Err(refused());
        }
        if !target.is_root() {
            let fanout = graph.enclosing_fanout(&target.node_id).map(String::from);
            if fanout.map(NextStep::Branches).as_ref() != Some(&resumed.next) {
                return Err(refused());
            }
        }

        let mut fork = WorkflowExecution::new(
            source.definition_id.clone(),
            source.definition_version.clone(),
            origin.node_id.clone(),
            origin.state.clone(),
        );
        fork.forked_from = Some(ForkOrigin {
            execution_id: execution_id.clone(),
            sequence_number: from,
        });
        fork.transition(ExecutionStatus::Running)?;

        let lock = self.lock_for(&fork.execution_id)?;
        let _guard = lock.lock().await;

        // The fork waits on its own copy of any pending request.
        let mut next = resumed.next.clone();
        let mut fork_request = None;
        if let NextStep::AwaitingApproval(request_id) = &resumed.next {
            let original = self
                .executions
                .load_approval(request_id)
                .await?
                .ok_or_else(|| WaylineError::ApprovalNotFound(request_id.clone()))?;
            let mut copy = ApprovalRequest::new(
                fork.execution_id.clone(),
                original.node_id.clone(),
                original.tier,
                original.payload.clone(),
            );
            copy.expires_at = original
                .expires_at
                .map(|at| copy.created_at + (at - original.created_at));
            next = NextStep::AwaitingApproval(copy.request_id.clone());
            fork_request = Some(copy);
        }

        if let Some(request) = &fork_request {
            self.executions.save_approval(request).await?;
        }
        for cp in &history {
            let mut copy = cp.clone();
            copy.execution_id = fork.execution_id.clone();
            if copy.sequence_number == origin.sequence_number {
                copy.next = next.clone();
            }
            self.writer.append(copy).await?;
        }
        if let NextStep::Node(node_id) = &next {
            fork.current_node_id = node_id.clone();
        }

        info!(
            execution_id = %fork.execution_id,
            source = %execution_id,
            from,
            "Replaying execution"
        );

        if let Some(request) = fork_request {
            fork.transition(ExecutionStatus::Suspended)?;
            self.executions.save_execution(&fork).await?;
            self.event_bus.publish(EngineEvent::ExecutionSuspended {
                execution_id: fork.execution_id.clone(),
                request_id: request.request_id.clone(),
            });
            self.event_bus.publish(EngineEvent::ApprovalRequested { request });
            return Ok(fork);
        }

        self.executions.save_execution(&fork).await?;
        self.event_bus.publish(EngineEvent::ExecutionStarted {
            execution_id: fork.execution_id.clone(),
            definition_id: fork.definition_id.clone(),
        });
        let token = self.token_for(&fork.execution_id)?;
        let mut cursor = Cursor { next, ..resumed };
        self.drive(&mut fork, &graph, &mut cursor, &token).await?;
        Ok(fork)
    }

    /// Resume every Pending or Running execution from its latest checkpoint.
    ///
    /// Suspended executions stay suspended unless the decision they wait on
    /// was already stored, in which case it is applied now.
    pub async fn recover(&self) -> Result<Vec<WorkflowExecution>> {
        let active = self.executions.list_active().await?;
        let mut recovered = Vec::new();
        for exec in active {
            let result = if exec.status == ExecutionStatus::Suspended {
                self.settle(&exec.execution_id).await
            } else {
                info!(execution_id = %exec.execution_id, status = %exec.status, "Recovering execution");
                self.run(&exec.execution_id).await.map(Some)
            };
            match result {
                Ok(Some(exec)) => recovered.push(exec),
                Ok(None) => {
                    debug!(execution_id = %exec.execution_id, "Execution awaiting approval, left suspended")
                }
                Err(e) => error!(execution_id = %exec.execution_id, error = %e, "Recovery failed"),
            }
        }
        Ok(recovered)
    }

    /// Finish a suspended execution whose decision was stored but not applied.
    /// Returns `None` while it still waits on a reviewer.
    async fn settle(&self, execution_id: &ExecutionId) -> Result<Option<WorkflowExecution>> {
        let lock = self.lock_for(execution_id)?;
        let _guard = lock.lock().await;

        let mut exec = self.load(execution_id).await?;
        if exec.status != ExecutionStatus::Suspended {
            return Ok(None);
        }
        let graph = self.graph_for(&exec)?;
        let mut cursor = self.cursor(&exec, &graph).await?;
        let token = self.token_for(execution_id)?;

        let NextStep::AwaitingApproval(request_id) = cursor.next.clone() else {
            // The decision checkpoint landed but the status update did not.
            info!(execution_id = %execution_id, "Recovering decided execution");
            if cursor.next != NextStep::Halt {
                exec.transition(ExecutionStatus::Running)?;
                self.executions.save_execution(&exec).await?;
            }
            self.drive(&mut exec, &graph, &mut cursor, &token).await?;
            return Ok(Some(exec));
        };
        let Some(request) = self
            .executions
            .load_approval(&request_id)
            .await?
            .filter(|r| !r.is_pending())
        else {
            return Ok(None);
        };
        if request.decided_by.as_deref() == Some(CANCEL_REVIEWER) {
            self.finish_cancelled(&mut exec).await?;
            return Ok(Some(exec));
        }

        warn!(
            execution_id = %execution_id,
            request_id = %request.request_id,
            decision = %request.decision,
            "Applying approval decision stored before restart"
        );
        let verdict = Verdict::recorded(&request, &graph);
        if let Flow::Continue = self
            .apply_decision(&mut exec, &graph, &mut cursor, &request, verdict)
            .await?
        {
            self.drive(&mut exec, &graph, &mut cursor, &token).await?;
        }
        Ok(Some(exec))
    }

    /// Apply the timeout policy to every pending request that expired by `now`.
    pub async fn expire_approvals(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowExecution>> {
        let expired: Vec<ApprovalRequest> = self
            .executions
            .list_pending_approvals()
            .await?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .collect();

        let mut touched = Vec::new();
        for request in expired {
            match self.expire(request, now).await {
                Ok(Some(exec)) => touched.push(exec),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to expire approval request"),
            }
        }
        Ok(touched)
    }

    async fn expire(
        &self,
        request: ApprovalRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowExecution>> {
        let execution_id = request.execution_id.clone();
        let lock = self.lock_for(&execution_id)?;
        let _guard = lock.lock().await;

        // Re-read under the lock: a reviewer may have answered meanwhile.
        let Some(mut request) = self
            .executions
            .load_approval(&request.request_id)
            .await?
            .filter(|r| r.is_expired(now))
        else {
            return Ok(None);
        };
        let mut exec = self.load(&execution_id).await?;
        let graph = self.graph_for(&exec)?;
        let mut cursor = self.cursor(&exec, &graph).await?;

        if exec.status != ExecutionStatus::Suspended
            || cursor.next != NextStep::AwaitingApproval(request.request_id.clone())
        {
            // Orphaned request: close it without touching the execution.
            request.decide(Decision::Rejected, TIMEOUT_REVIEWER);
            self.executions.save_approval(&request).await?;
            return Ok(None);
        }

        let policy = match graph.node(&request.node_id).map(|n| &n.kind) {
            Some(NodeKind::Approval(config)) => config.on_timeout,
            _ => TimeoutPolicy::Fail,
        };
        let verdict = match policy {
            TimeoutPolicy::Decide(decision) if decision != Decision::Pending => Verdict {
                decision,
                reviewer: TIMEOUT_REVIEWER.into(),
                edits: None,
                timed_out: false,
            },
            _ => Verdict {
                decision: Decision::Rejected,
                reviewer: TIMEOUT_REVIEWER.into(),
                edits: None,
                timed_out: true,
            },
        };
        warn!(
            execution_id = %execution_id,
            request_id = %request.request_id,
            node = %request.node_id,
            decision = %verdict.decision,
            "Approval request expired"
        );

        let token = self.token_for(&execution_id)?;
        if let Flow::Continue = self.decide(&mut exec, &graph, &mut cursor, request, verdict).await? {
            self.drive(&mut exec, &graph, &mut cursor, &token).await?;
        }
        Ok(Some(exec))
    }

    // ── Queries ────────────────────────────────────────────────────

    pub async fn execution(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution> {
        self.load(execution_id).await
    }

    /// All executions, newest first.
    pub async fn executions(&self) -> Result<Vec<WorkflowExecution>> {
        self.executions.list_executions().await
    }

    /// Checkpoints of an execution with sequence number `>= from`, ascending.
    pub async fn checkpoints(&self, execution_id: &ExecutionId, from: u64) -> Result<Vec<Checkpoint>> {
        self.load(execution_id).await?;
        self.checkpoints.list(execution_id, from).await
    }

    /// Every approval request an execution raised, decided or not.
    pub async fn approvals(&self, execution_id: &ExecutionId) -> Result<Vec<ApprovalRequest>> {
        self.load(execution_id).await?;
        self.executions.list_approvals(execution_id).await
    }

    pub async fn pending_approvals(&self, execution_id: &ExecutionId) -> Result<Vec<ApprovalRequest>> {
        Ok(self
            .approvals(execution_id)
            .await?
            .into_iter()
            .filter(|r| r.is_pending())
            .collect())
    }

    // ── Driving ────────────────────────────────────────────────────

    /// Move a Pending execution to Running. Returns false when there is nothing to drive.
    async fn begin(&self, exec: &mut WorkflowExecution) -> Result<bool> {
        match exec.status {
            ExecutionStatus::Pending => {
                exec.transition(ExecutionStatus::Running)?;
                self.executions.save_execution(exec).await?;
                info!(execution_id = %exec.execution_id, definition = %exec.definition_id, "Execution started");
                self.event_bus.publish(EngineEvent::ExecutionStarted {
                    execution_id: exec.execution_id.clone(),
                    definition_id: exec.definition_id.clone(),
                });
                Ok(true)
            }
            ExecutionStatus::Running => Ok(true),
            _ => Ok(false),
        }
    }

    async fn drive(
        &self,
        exec: &mut WorkflowExecution,
        graph: &CompiledGraph,
        cursor: &mut Cursor,
        token: &CancellationToken,
    ) -> Result<()> {
        while let Flow::Continue = self.advance(exec, graph, cursor, token).await? {}
        Ok(())
    }

    /// Where to continue: the latest main-path checkpoint, or the start node.
    async fn cursor(&self, exec: &WorkflowExecution, graph: &CompiledGraph) -> Result<Cursor> {
        let fresh = || Cursor::at(NextStep::Node(graph.start.clone()), exec.state.clone());
        let Some(latest) = self.checkpoints.latest(&exec.execution_id).await? else {
            return Ok(fresh());
        };
        if latest.is_root() {
            return Ok(Cursor::at(latest.next, latest.state));
        }
        // Interrupted inside a fanout: each branch picks up where it stopped.
        let history = self.checkpoints.list(&exec.execution_id, 1).await?;
        Ok(resume_point(graph, &history).map_or_else(fresh, |(_, cursor)| cursor))
    }

    async fn advance(
        &self,
        exec: &mut WorkflowExecution,
        graph: &CompiledGraph,
        cursor: &mut Cursor,
        token: &CancellationToken,
    ) -> Result<Flow> {
        if token.is_cancelled() {
            self.finish_cancelled(exec).await?;
            return Ok(Flow::Stop);
        }
        match cursor.next.clone() {
            NextStep::Halt => {
                // The failure checkpoint landed but the status update did not.
                if !exec.status.is_terminal() {
                    let record = recorded_error(&cursor.state);
                    self.finish_failed(exec, cursor.state.clone(), record).await?;
                }
                Ok(Flow::Stop)
            }
            NextStep::AwaitingApproval(request_id) => {
                // The checkpoint landed but the status update did not.
                if exec.status == ExecutionStatus::Running {
                    exec.transition(ExecutionStatus::Suspended)?;
                    self.executions.save_execution(exec).await?;
                    self.event_bus.publish(EngineEvent::ExecutionSuspended {
                        execution_id: exec.execution_id.clone(),
                        request_id,
                    });
                }
                Ok(Flow::Stop)
            }
            NextStep::Node(node_id) if graph.is_end(&node_id) => {
                self.complete(exec, &node_id, cursor.state.clone()).await?;
                Ok(Flow::Stop)
            }
            NextStep::Node(node_id) => self.run_node(exec, graph, cursor, &node_id, token).await,
            NextStep::Branches(fanout_id) => {
                self.run_fanout(exec, graph, cursor, &fanout_id, token).await
            }
        }
    }

    pub(crate) fn context<'a>(
        &'a self,
        execution_id: &'a ExecutionId,
        node_id: &'a str,
        graph: &'a CompiledGraph,
        token: &'a CancellationToken,
    ) -> NodeContext<'a> {
        NodeContext {
            execution_id,
            node_id,
            graph,
            invoker: &self.invoker,
            cancel: token,
            approval_timeout_secs: self.config.approval_timeout_secs,
            fanin: None,
        }
    }

    async fn run_node(
        &self,
        exec: &mut WorkflowExecution,
        graph: &CompiledGraph,
        cursor: &mut Cursor,
        node_id: &str,
        token: &CancellationToken,
    ) -> Result<Flow> {
        let Some(node) = graph.node(node_id) else {
            let error = WaylineError::RoutingDeadEnd {
                node_id: node_id.to_string(),
                reason: "node does not exist".into(),
            };
            let state = cursor.state.clone();
            return self.fail(exec, &state, node_id, error, vec![]).await;
        };
        exec.current_node_id = node_id.to_string();
        let execution_id = exec.execution_id.clone();
        let started = Instant::now();

        let result = {
            let ctx = self.context(&execution_id, node_id, graph, token);
            node.kind.handler().execute(&ctx, cursor.state.clone()).await
        };
        match result {
            Ok(output) => self.commit(exec, graph, cursor, node_id, output, started).await,
            Err(failure) => self.on_failure(exec, cursor, node_id, failure, token).await,
        }
    }

    async fn run_fanout(
        &self,
        exec: &mut WorkflowExecution,
        graph: &CompiledGraph,
        cursor: &mut Cursor,
        fanout_id: &str,
        token: &CancellationToken,
    ) -> Result<Flow> {
        let Some(NodeKind::Fanout(config)) = graph.node(fanout_id).map(|n| &n.kind) else {
            let error = WaylineError::RoutingDeadEnd {
                node_id: fanout_id.to_string(),
                reason: "not a fanout node".into(),
            };
            let state = cursor.state.clone();
            return self.fail(exec, &state, fanout_id, error, vec![]).await;
        };
        let execution_id = exec.execution_id.clone();
        let started = Instant::now();
        let progress = std::mem::take(&mut cursor.branches);

        let input = match self
            .run_branches(&execution_id, graph, fanout_id, config, &cursor.state, &progress, token)
            .await
        {
            Ok(input) => input,
            Err((node_id, failure)) => {
                return self.on_failure(exec, cursor, &node_id, failure, token).await;
            }
        };

        let fanin_id = config.fanin.as_str();
        let Some(fanin) = graph.node(fanin_id) else {
            let error = WaylineError::RoutingDeadEnd {
                node_id: fanin_id.to_string(),
                reason: "fanin does not exist".into(),
            };
            let state = cursor.state.clone();
            return self.fail(exec, &state, fanin_id, error, vec![]).await;
        };
        exec.current_node_id = fanin_id.to_string();
        let result = {
            let mut ctx = self.context(&execution_id, fanin_id, graph, token);
            ctx.fanin = Some(&input);
            fanin.kind.handler().execute(&ctx, input.base.clone()).await
        };
        match result {
            Ok(output) => self.commit(exec, graph, cursor, fanin_id, output, started).await,
            Err(failure) => self.on_failure(exec, cursor, fanin_id, failure, token).await,
        }
    }

    /// Checkpoint a completed node and move the cursor past it.
    async fn commit(
        &self,
        exec: &mut WorkflowExecution,
        graph: &CompiledGraph,
        cursor: &mut Cursor,
        node_id: &str,
        output: NodeOutput,
        started: Instant,
    ) -> Result<Flow> {
        let execution_id = exec.execution_id.clone();
        let next = match next_step(graph, node_id, &output) {
            Ok(next) => next,
            Err(e) => return self.fail(exec, &output.state, node_id, e, output.invocations).await,
        };
        let status = match next {
            NextStep::AwaitingApproval(_) => ExecutionStatus::Suspended,
            _ => ExecutionStatus::Running,
        };

        // The request is stored before the checkpoint that points at it.
        if let Some(request) = &output.approval {
            self.executions.save_approval(request).await?;
        }

        let draft = Draft {
            node_id,
            branch_id: None,
            state: &output.state,
            next: next.clone(),
            status,
            invocations: output.invocations.clone(),
        };
        let checkpoint = match self.writer.write(&execution_id, draft).await {
            Ok(cp) => cp,
            Err(e) => {
                let state = cursor.state.clone();
                return self.fail(exec, &state, node_id, e, output.invocations).await;
            }
        };
        debug!(
            execution_id = %execution_id,
            node = node_id,
            sequence = checkpoint.sequence_number,
            "Checkpoint written"
        );
        self.event_bus.publish(EngineEvent::NodeCompleted {
            execution_id: execution_id.clone(),
            node_id: node_id.to_string(),
            branch_id: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        self.event_bus.publish(EngineEvent::CheckpointWritten {
            execution_id: execution_id.clone(),
            sequence_number: checkpoint.sequence_number,
            node_id: node_id.to_string(),
        });

        if let Some(request) = output.approval {
            if request.is_pending() {
                self.event_bus.publish(EngineEvent::ApprovalRequested { request });
            } else {
                self.event_bus.publish(EngineEvent::ApprovalResolved {
                    request_id: request.request_id.clone(),
                    execution_id: execution_id.clone(),
                    decision: request.decision,
                });
            }
        }

        cursor.state = output.state;
        cursor.next = next;
        exec.state = cursor.state.clone();

        match &cursor.next {
            NextStep::AwaitingApproval(request_id) => {
                exec.transition(ExecutionStatus::Suspended)?;
                self.executions.save_execution(exec).await?;
                info!(execution_id = %execution_id, node = node_id, request_id = %request_id, "Execution suspended for approval");
                self.event_bus.publish(EngineEvent::ExecutionSuspended {
                    execution_id,
                    request_id: request_id.clone(),
                });
                return Ok(Flow::Stop);
            }
            NextStep::Node(next) => exec.current_node_id = next.clone(),
            NextStep::Branches(_) | NextStep::Halt => {}
        }
        exec.updated_at = Utc::now();
        self.executions.save_execution(exec).await?;
        Ok(Flow::Continue)
    }

    /// Record a decision on the pending request and continue past (or fail at) the gate.
    async fn decide(
        &self,
        exec: &mut WorkflowExecution,
        graph: &CompiledGraph,
        cursor: &mut Cursor,
        mut request: ApprovalRequest,
        verdict: Verdict,
    ) -> Result<Flow> {
        request.decide(verdict.decision, verdict.reviewer.clone());
        if verdict.decision == Decision::Edited {
            request.edited_payload = verdict.edits.clone();
        }
        // Stored before the checkpoint; `recover` applies it if we stop in between.
        self.executions.save_approval(&request).await?;
        info!(
            execution_id = %exec.execution_id,
            request_id = %request.request_id,
            decision = %verdict.decision,
            decided_by = %verdict.reviewer,
            "Approval decided"
        );
        self.event_bus.publish(EngineEvent::ApprovalResolved {
            request_id: request.request_id.clone(),
            execution_id: exec.execution_id.clone(),
            decision: verdict.decision,
        });
        self.apply_decision(exec, graph, cursor, &request, verdict).await
    }

    /// Continue past (or fail at) a gate whose decision is already stored.
    async fn apply_decision(
        &self,
        exec: &mut WorkflowExecution,
        graph: &CompiledGraph,
        cursor: &mut Cursor,
        request: &ApprovalRequest,
        verdict: Verdict,
    ) -> Result<Flow> {
        let node_id = request.node_id.clone();
        let on_reject = match graph.node(&node_id).map(|n| &n.kind) {
            Some(NodeKind::Approval(config)) => config.on_reject,
            _ => RejectPolicy::Fail,
        };

        let mut state = cursor.state.clone();
        if let Some(edits) = verdict.edits.as_ref().filter(|_| verdict.decision == Decision::Edited) {
            state.merge_value(edits);
        }
        state.set_str(decision_key(&node_id), verdict.decision.to_string());
        exec.transition(ExecutionStatus::Running)?;

        if verdict.timed_out {
            let error = WaylineError::ApprovalTimeout {
                request_id: request.request_id.clone(),
                node_id: node_id.clone(),
            };
            return self.fail(exec, &state, &node_id, error, vec![]).await;
        }
        if verdict.decision == Decision::Rejected && on_reject == RejectPolicy::Fail {
            let error = WaylineError::ApprovalRejected {
                request_id: request.request_id.clone(),
                node_id: node_id.clone(),
                decided_by: verdict.reviewer,
            };
            return self.fail(exec, &state, &node_id, error, vec![]).await;
        }

        let output = NodeOutput {
            state,
            transition: Transition::FollowEdges,
            invocations: vec![],
            approval: None,
        };
        self.commit(exec, graph, cursor, &node_id, output, Instant::now()).await
    }

    async fn on_failure(
        &self,
        exec: &mut WorkflowExecution,
        cursor: &Cursor,
        node_id: &str,
        failure: NodeFailure,
        token: &CancellationToken,
    ) -> Result<Flow> {
        if token.is_cancelled() {
            self.finish_cancelled(exec).await?;
            return Ok(Flow::Stop);
        }
        self.fail(exec, &cursor.state, node_id, failure.error, failure.invocations)
            .await
    }

    /// Record the error in state, write a terminal checkpoint and mark the execution Failed.
    async fn fail(
        &self,
        exec: &mut WorkflowExecution,
        state: &State,
        node_id: &str,
        error: WaylineError,
        invocations: Vec<ToolInvocation>,
    ) -> Result<Flow> {
        let execution_id = exec.execution_id.clone();
        let mut record = ExecutionError {
            kind: error.kind().to_string(),
            message: error.to_string(),
            node_id: Some(node_id.to_string()),
            checkpoint_error: None,
        };
        error!(execution_id = %execution_id, node = node_id, kind = %record.kind, error = %error, "Execution failed");

        let mut state = state.clone();
        state.set(
            ERROR_KEY,
            json!({"kind": record.kind, "message": record.message, "node_id": node_id}),
        );
        let draft = Draft {
            node_id,
            branch_id: None,
            state: &state,
            next: NextStep::Halt,
            status: ExecutionStatus::Failed,
            invocations,
        };
        if let Err(e) = self.writer.write(&execution_id, draft).await {
            error!(execution_id = %execution_id, error = %e, "Failed to record failure checkpoint");
            record.checkpoint_error = Some(e.to_string());
        }

        self.finish_failed(exec, state, record).await?;
        Ok(Flow::Stop)
    }

    async fn finish_failed(
        &self,
        exec: &mut WorkflowExecution,
        state: State,
        record: ExecutionError,
    ) -> Result<()> {
        if let Some(node_id) = &record.node_id {
            exec.current_node_id = node_id.clone();
        }
        exec.state = state;
        exec.error = Some(record);
        exec.transition(ExecutionStatus::Failed)?;
        self.executions.save_execution(exec).await?;
        self.event_bus.publish(EngineEvent::ExecutionFinished {
            execution_id: exec.execution_id.clone(),
            status: ExecutionStatus::Failed,
        });
        self.release(&exec.execution_id);
        Ok(())
    }

    async fn complete(&self, exec: &mut WorkflowExecution, end_id: &str, state: State) -> Result<()> {
        exec.current_node_id = end_id.to_string();
        exec.state = state;
        exec.transition(ExecutionStatus::Completed)?;
        self.executions.save_execution(exec).await?;
        info!(execution_id = %exec.execution_id, end = end_id, "Execution completed");
        self.event_bus.publish(EngineEvent::ExecutionFinished {
            execution_id: exec.execution_id.clone(),
            status: ExecutionStatus::Completed,
        });
        self.release(&exec.execution_id);
        Ok(())
    }

    async fn finish_cancelled(&self, exec: &mut WorkflowExecution) -> Result<()> {
        for mut request in self.executions.list_approvals(&exec.execution_id).await? {
            if request.is_pending() {
                request.decide(Decision::Rejected, CANCEL_REVIEWER);
                self.executions.save_approval(&request).await?;
                self.event_bus.publish(EngineEvent::ApprovalResolved {
                    request_id: request.request_id.clone(),
                    execution_id: exec.execution_id.clone(),
                    decision: Decision::Rejected,
                });
            }
        }
        exec.transition(ExecutionStatus::Cancelled)?;
        self.executions.save_execution(exec).await?;
        info!(execution_id = %exec.execution_id, node = %exec.current_node_id, "Execution cancelled");
        self.event_bus.publish(EngineEvent::ExecutionFinished {
            execution_id: exec.execution_id.clone(),
            status: ExecutionStatus::Cancelled,
        });
        self.release(&exec.execution_id);
        Ok(())
    }

    // ── Bookkeeping ────────────────────────────────────────────────

    async fn load(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution> {
        self.executions
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| WaylineError::ExecutionNotFound(execution_id.to_string()))
    }

    fn graph_for(&self, exec: &WorkflowExecution) -> Result<Arc<CompiledGraph>> {
        self.definitions
            .get(&exec.definition_id, &exec.definition_version)
    }

    fn lock_for(&self, execution_id: &ExecutionId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .drive_locks
            .lock()
            .map_err(|e| WaylineError::Database(format!("drive lock table poisoned: {}", e)))?;
        Ok(locks.entry(execution_id.clone()).or_default().clone())
    }

    fn token_for(&self, execution_id: &ExecutionId) -> Result<CancellationToken> {
        let mut tokens = self
            .tokens
            .lock()
            .map_err(|e| WaylineError::Database(format!("token table poisoned: {}", e)))?;
        Ok(tokens.entry(execution_id.clone()).or_default().clone())
    }

    /// Drop per-execution bookkeeping once an execution is terminal.
    fn release(&self, execution_id: &ExecutionId) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(execution_id);
        }
        if let Ok(mut locks) = self.drive_locks.lock() {
            locks.remove(execution_id);
        }
        self.writer.forget(execution_id);
    }
}

/// The latest main-path checkpoint in `history` and the cursor it leaves.
/// Branch checkpoints after a fanout checkpoint become branch progress.
fn resume_point(graph: &CompiledGraph, history: &[Checkpoint]) -> Option<(Checkpoint, Cursor)> {
    let at = history.iter().rposition(Checkpoint::is_root)?;
    let root = history[at].clone();
    let branches = match &root.next {
        NextStep::Branches(fanout_id) => branch_progress(graph, fanout_id, &history[at + 1..]),
        _ => Vec::new(),
    };
    let cursor = Cursor {
        next: root.next.clone(),
        state: root.state.clone(),
        branches,
    };
    Some((root, cursor))
}

/// Rebuild the error a failure checkpoint recorded under `_error`.
fn recorded_error(state: &State) -> ExecutionError {
    let error = state.get(ERROR_KEY).cloned().unwrap_or(Value::Null);
    let text = |key: &str| error.get(key).and_then(Value::as_str).map(String::from);
    ExecutionError {
        kind: text("kind").unwrap_or_else(|| "unknown".into()),
        message: text("message").unwrap_or_default(),
        node_id: text("node_id"),
        checkpoint_error: None,
    }
}

/// Resolve a handler's transition into the checkpoint's next step.
pub(crate) fn next_step(
    graph: &CompiledGraph,
    node_id: &str,
    output: &NodeOutput,
) -> Result<NextStep> {
    match &output.transition {
        Transition::FollowEdges => crate::graph::edge::select(graph.outgoing(node_id), &output.state)
            .map(|edge| NextStep::Node(edge.to.clone()))
            .ok_or_else(|| WaylineError::RoutingDeadEnd {
                node_id: node_id.to_string(),
                reason: "no outgoing edge matched".into(),
            }),
        Transition::Goto(target) => Ok(NextStep::Node(target.clone())),
        Transition::Suspend => output
            .approval
            .as_ref()
            .map(|r| NextStep::AwaitingApproval(r.request_id.clone()))
            .ok_or_else(|| WaylineError::RoutingDeadEnd {
                node_id: node_id.to_string(),
                reason: "suspended without an approval request".into(),
            }),
        Transition::Branches => Ok(NextStep::Branches(node_id.to_string())),
    }
}
