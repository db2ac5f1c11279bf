use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ExecutionStatus;

/// A workflow definition was rejected before any execution was created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompilationError {
    #[error("definition {field} must not be empty")]
    MissingField { field: &'static str },

    #[error("invalid node id '{0}'")]
    InvalidNodeId(String),

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("edge {source_node} -> {target} references unknown node '{missing}'")]
    DanglingEdge {
        source_node: String,
        target: String,
        missing: String,
    },

    #[error("definition has no start node")]
    NoStartNode,

    #[error("definition has {0} start nodes, expected exactly one")]
    MultipleStartNodes(usize),

    #[error("no end node is reachable from start")]
    NoReachableEnd,

    #[error("cycle through '{0}' is not guarded by a loop node")]
    UnboundedCycle(String),

    #[error("invalid config for node '{node_id}': {reason}")]
    InvalidConfig { node_id: String, reason: String },

    #[error("node '{node_id}' references unregistered tool '{tool}'")]
    UnknownTool { node_id: String, tool: String },

    #[error("invalid condition on edge {source_node} -> {target}: {reason}")]
    InvalidCondition {
        source_node: String,
        target: String,
        reason: String,
    },

    #[error("fallback edge from '{0}' must be declared last and only once")]
    MisplacedFallback(String),

    #[error("node '{0}' has no outgoing route")]
    NoOutgoingRoute(String),

    #[error("end node '{0}' must not have outgoing edges")]
    EndHasOutgoing(String),

    #[error("definition {id}@{version} is already registered with different content")]
    VersionConflict { id: String, version: String },
}

/// Classification of a tool failure, mirrored on the wire as `error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    NotFound,
    InvalidInput,
    InvalidOutput,
    Timeout,
    Transient,
    Failed,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::InvalidOutput => "invalid_output",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Error returned by a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("tool {tool_name} failed ({error_kind}): {message}")]
pub struct ToolInvocationError {
    pub tool_name: String,
    pub error_kind: ToolErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ToolInvocationError {
    pub fn new(
        tool_name: impl Into<String>,
        error_kind: ToolErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let retryable = matches!(error_kind, ToolErrorKind::Timeout | ToolErrorKind::Transient);
        Self {
            tool_name: tool_name.into(),
            error_kind,
            message: message.into(),
            retryable,
        }
    }

    /// A transient failure that may succeed when retried.
    pub fn transient(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(tool_name, ToolErrorKind::Transient, message)
    }

    /// A permanent failure.
    pub fn failed(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(tool_name, ToolErrorKind::Failed, message)
    }

    /// Force the retry flag off (non-idempotent tools).
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

#[derive(Debug, Error)]
pub enum WaylineError {
    // Definition errors
    #[error("compilation failed: {0}")]
    Compilation(#[from] CompilationError),

    #[error("definition not found: {id}@{version}")]
    DefinitionNotFound { id: String, version: String },

    // Runtime errors
    #[error("routing dead end at node '{node_id}': {reason}")]
    RoutingDeadEnd { node_id: String, reason: String },

    #[error(transparent)]
    ToolInvocation(#[from] ToolInvocationError),

    #[error("approval request {request_id} at node '{node_id}' timed out")]
    ApprovalTimeout { request_id: String, node_id: String },

    #[error("approval request {request_id} at node '{node_id}' rejected by {decided_by}")]
    ApprovalRejected {
        request_id: String,
        node_id: String,
        decided_by: String,
    },

    #[error("checkpoint write failed: {0}")]
    CheckpointWrite(String),

    // Caller errors
    #[error("cannot {action} execution {execution_id} in status {status}")]
    InvalidStateTransition {
        execution_id: String,
        status: ExecutionStatus,
        action: String,
    },

    #[error("invalid approval decision: {0}")]
    InvalidDecision(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("checkpoint {sequence_number} not found for execution {execution_id}")]
    CheckpointNotFound {
        execution_id: String,
        sequence_number: u64,
    },

    #[error("approval request not found: {0}")]
    ApprovalNotFound(String),

    #[error("execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WaylineError {
    /// Stable snake_case identifier, used in the `_error` state field and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Compilation(_) => "compilation_error",
            Self::DefinitionNotFound { .. } => "definition_not_found",
            Self::RoutingDeadEnd { .. } => "routing_dead_end",
            Self::ToolInvocation(_) => "tool_invocation_error",
            Self::ApprovalTimeout { .. } => "approval_timeout",
            Self::ApprovalRejected { .. } => "approval_rejected",
            Self::CheckpointWrite(_) => "checkpoint_write_error",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::InvalidDecision(_) => "invalid_decision",
            Self::ExecutionNotFound(_) => "execution_not_found",
            Self::CheckpointNotFound { .. } => "checkpoint_not_found",
            Self::ApprovalNotFound(_) => "approval_not_found",
            Self::Cancelled => "cancelled",
            Self::Config(_) | Self::ConfigNotFound(_) => "config_error",
            Self::Database(_) => "database_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// Whether the step that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ToolInvocation(e) => e.retryable,
            Self::CheckpointWrite(_) | Self::Database(_) => true,
            _ => false,
        }
    }

    /// Errors caused by the caller rather than by the execution itself.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidStateTransition { .. }
                | Self::InvalidDecision(_)
                | Self::ExecutionNotFound(_)
                | Self::CheckpointNotFound { .. }
                | Self::ApprovalNotFound(_)
                | Self::DefinitionNotFound { .. }
                | Self::Compilation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WaylineError>;
