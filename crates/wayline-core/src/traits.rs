use futures::future::BoxFuture;

use crate::config::RetryConfig;
use crate::error::{Result, ToolInvocationError};
use crate::types::{ApprovalRequest, Checkpoint, ExecutionId, WorkflowExecution};

/// Tool: a named callable capability invoked by workflow nodes.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (referenced from node configs).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema for tool input. An empty object accepts anything.
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// JSON Schema for tool output. An empty object accepts anything.
    fn output_schema(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Invoke the tool.
    fn invoke(
        &self,
        input: serde_json::Value,
    ) -> BoxFuture<'_, std::result::Result<serde_json::Value, ToolInvocationError>>;

    /// Timeout in seconds; `None` uses the engine default.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }

    /// Whether repeating a call with the same input is safe.
    /// Non-idempotent tools are never retried automatically.
    fn idempotent(&self) -> bool {
        true
    }

    /// Per-tool retry policy; `None` uses the engine default.
    fn retry(&self) -> Option<RetryConfig> {
        None
    }
}

/// Checkpoint store: append-only, totally ordered per execution.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Append a checkpoint. Fails unless `sequence_number` is exactly one past the last.
    fn append(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>>;

    /// Latest checkpoint of an execution.
    fn latest(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// Checkpoint by sequence number.
    fn get(
        &self,
        execution_id: &ExecutionId,
        sequence_number: u64,
    ) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// Checkpoints with `sequence_number >= from`, in order.
    fn list(&self, execution_id: &ExecutionId, from: u64) -> BoxFuture<'_, Result<Vec<Checkpoint>>>;
}

/// Execution store: current execution records and approval requests.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Insert or replace an execution record.
    fn save_execution(&self, execution: &WorkflowExecution) -> BoxFuture<'_, Result<()>>;

    fn load_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Option<WorkflowExecution>>>;

    /// All executions, newest first.
    fn list_executions(&self) -> BoxFuture<'_, Result<Vec<WorkflowExecution>>>;

    /// Executions not yet in a terminal status.
    fn list_active(&self) -> BoxFuture<'_, Result<Vec<WorkflowExecution>>>;

    /// Insert or replace an approval request.
    fn save_approval(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>>;

    fn load_approval(&self, request_id: &str) -> BoxFuture<'_, Result<Option<ApprovalRequest>>>;

    /// All approval requests of an execution, oldest first.
    fn list_approvals(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Vec<ApprovalRequest>>>;

    /// Every request still awaiting a decision.
    fn list_pending_approvals(&self) -> BoxFuture<'_, Result<Vec<ApprovalRequest>>>;
}
