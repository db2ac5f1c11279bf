use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::State;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Suspended | Completed | Failed | Cancelled) => true,
            (Suspended, Running) | (Suspended, Cancelled) | (Suspended, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Failure recorded on a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: String,
    pub message: String,
    pub node_id: Option<String>,
    /// Set when the failure checkpoint itself could not be written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_error: Option<String>,
}

/// Checkpoint an execution was forked from by replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkOrigin {
    pub execution_id: ExecutionId,
    pub sequence_number: u64,
}

/// One run of a compiled workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: ExecutionId,
    pub definition_id: String,
    pub definition_version: String,
    pub current_node_id: String,
    pub status: ExecutionStatus,
    pub state: State,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<ForkOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl WorkflowExecution {
    pub fn new(
        definition_id: impl Into<String>,
        definition_version: impl Into<String>,
        start_node: impl Into<String>,
        state: State,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: ExecutionId::new(),
            definition_id: definition_id.into(),
            definition_version: definition_version.into(),
            current_node_id: start_node.into(),
            status: ExecutionStatus::Pending,
            state,
            created_at: now,
            updated_at: now,
            forked_from: None,
            error: None,
        }
    }

    /// Move to `next`, refusing transitions the state machine does not allow.
    pub fn transition(&mut self, next: ExecutionStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::WaylineError::InvalidStateTransition {
                execution_id: self.execution_id.to_string(),
                status: self.status,
                action: format!("move to {}", next),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// What the engine does after a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum NextStep {
    /// Continue at the given node.
    Node(String),
    /// Run the branches of the given fanout node.
    Branches(String),
    /// Wait for a decision on the given approval request.
    AwaitingApproval(String),
    /// Nothing further; the execution is terminal.
    Halt,
}

/// Immutable snapshot taken after a node completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: ExecutionId,
    pub sequence_number: u64,
    pub node_id: String,
    /// Set when the node ran inside a fanout branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    pub state: State,
    pub next: NextStep,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub invocations: Vec<ToolInvocation>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Whether this checkpoint was taken on the main path rather than in a branch.
    pub fn is_root(&self) -> bool {
        self.branch_id.is_none()
    }
}

/// Approval tier, declared statically on each approval node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ApprovalTier {
    #[serde(rename = "tier1_automated", alias = "tier1")]
    Tier1Automated,
    #[serde(rename = "tier2_assisted", alias = "tier2")]
    Tier2Assisted,
    #[serde(rename = "tier3_clinical", alias = "tier3")]
    Tier3Clinical,
}

impl ApprovalTier {
    /// Tier1 is decided by policy and never suspends.
    pub fn suspends(self) -> bool {
        !matches!(self, Self::Tier1Automated)
    }

    /// Tier3 decisions must name a human reviewer.
    pub fn requires_identified_reviewer(self) -> bool {
        matches!(self, Self::Tier3Clinical)
    }
}

impl fmt::Display for ApprovalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tier1Automated => write!(f, "tier1_automated"),
            Self::Tier2Assisted => write!(f, "tier2_assisted"),
            Self::Tier3Clinical => write!(f, "tier3_clinical"),
        }
    }
}

/// Decision on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
    Edited,
}

impl Decision {
    /// Whether the gated step may proceed.
    pub fn allows_progress(self) -> bool {
        matches!(self, Self::Approved | Self::Edited)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Edited => "edited",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "edited" => Ok(Self::Edited),
            other => Err(format!("unknown decision: {}", other)),
        }
    }
}

/// A request for sign-off raised by an approval node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub tier: ApprovalTier,
    pub payload: serde_json::Value,
    pub decision: Decision,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Changes the reviewer merged into state with an `edited` decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_payload: Option<serde_json::Value>,
}

impl ApprovalRequest {
    pub fn new(
        execution_id: ExecutionId,
        node_id: impl Into<String>,
        tier: ApprovalTier,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            execution_id,
            node_id: node_id.into(),
            tier,
            payload,
            decision: Decision::Pending,
            decided_by: None,
            decided_at: None,
            created_at: Utc::now(),
            expires_at: None,
            edited_payload: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }

    pub fn decide(&mut self, decision: Decision, decided_by: impl Into<String>) {
        self.decision = decision;
        self.decided_by = Some(decided_by.into());
        self.decided_at = Some(Utc::now());
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A reviewer's answer to a pending approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approval_request_id: String,
    pub decision: Decision,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub edited_payload: Option<serde_json::Value>,
}

impl ApprovalResponse {
    pub fn new(request_id: impl Into<String>, decision: Decision) -> Self {
        Self {
            approval_request_id: request_id.into(),
            decision,
            decided_by: None,
            edited_payload: None,
        }
    }

    pub fn by(mut self, reviewer: impl Into<String>) -> Self {
        self.decided_by = Some(reviewer.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.edited_payload = Some(payload);
        self
    }
}

/// Record of one tool call made while executing a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::ToolInvocationError>,
    pub attempt_count: u32,
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Execution moved to Running.
    ExecutionStarted {
        execution_id: ExecutionId,
        definition_id: String,
    },
    /// A node handler finished successfully.
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: String,
        branch_id: Option<String>,
        elapsed_ms: u64,
    },
    /// A checkpoint was appended.
    CheckpointWritten {
        execution_id: ExecutionId,
        sequence_number: u64,
        node_id: String,
    },
    /// A tool call failed and will be retried.
    ToolRetry {
        execution_id: ExecutionId,
        tool_name: String,
        attempt: u32,
        error: String,
    },
    /// An approval node raised a request.
    ApprovalRequested { request: ApprovalRequest },
    /// An approval request was decided.
    ApprovalResolved {
        request_id: String,
        execution_id: ExecutionId,
        decision: Decision,
    },
    /// Execution is waiting for an external decision.
    ExecutionSuspended {
        execution_id: ExecutionId,
        request_id: String,
    },
    /// Execution reached a terminal status.
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
}
