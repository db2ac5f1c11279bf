//! Approval request construction and decision validation.

use chrono::{Duration, Utc};

use wayline_core::error::{Result, WaylineError};
use wayline_core::state::State;
use wayline_core::types::{ApprovalRequest, ApprovalResponse, Decision, ExecutionId};

use crate::graph::ApprovalConfig;

/// Reviewer recorded on Tier1 requests.
pub const POLICY_REVIEWER: &str = "policy";
/// Reviewer recorded when an expired request is decided by its timeout policy.
pub const TIMEOUT_REVIEWER: &str = "system:timeout";
/// Reviewer recorded when cancellation closes a pending request.
pub const CANCEL_REVIEWER: &str = "system:cancelled";
/// Reviewer recorded for Tier2 decisions that name nobody.
pub const ANONYMOUS_REVIEWER: &str = "anonymous";

/// Raise a request at `node_id`, showing the reviewer the configured payload keys.
pub fn build_request(
    execution_id: &ExecutionId,
    node_id: &str,
    config: &ApprovalConfig,
    state: &State,
    default_timeout_secs: u64,
) -> ApprovalRequest {
    let mut request = ApprovalRequest::new(
        execution_id.clone(),
        node_id,
        config.tier,
        state.project(&config.payload_keys),
    );
    let timeout = config.timeout_secs.unwrap_or(default_timeout_secs);
    if timeout > 0 {
        let secs = i64::try_from(timeout).unwrap_or(i64::MAX);
        request.expires_at = Duration::try_seconds(secs).map(|d| request.created_at + d);
    }
    request
}

/// Identities reserved for decisions the engine makes itself.
pub fn is_system_identity(name: &str) -> bool {
    name == "system" || name.starts_with("system:")
}

/// Check a response against its request, returning the reviewer to record.
pub fn validate_response(
    execution_id: &ExecutionId,
    request: &ApprovalRequest,
    response: &ApprovalResponse,
) -> Result<String> {
    if &request.execution_id != execution_id {
        return Err(WaylineError::InvalidDecision(format!(
            "request {} belongs to execution {}",
            request.request_id, request.execution_id
        )));
    }
    if !request.is_pending() {
        return Err(WaylineError::InvalidDecision(format!(
            "request {} was already decided ({})",
            request.request_id, request.decision
        )));
    }
    if request.is_expired(Utc::now()) {
        return Err(WaylineError::InvalidDecision(format!(
            "request {} has expired",
            request.request_id
        )));
    }

    match response.decision {
        Decision::Pending => {
            return Err(WaylineError::InvalidDecision(
                "decision must be approved, rejected or edited".into(),
            ))
        }
        Decision::Edited => match &response.edited_payload {
            Some(payload) if payload.is_object() => {}
            Some(_) => {
                return Err(WaylineError::InvalidDecision(
                    "edited_payload must be a JSON object".into(),
                ))
            }
            None => {
                return Err(WaylineError::InvalidDecision(
                    "an edited decision requires edited_payload".into(),
                ))
            }
        },
        Decision::Approved | Decision::Rejected => {}
    }

    let reviewer = response
        .decided_by
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    if request.tier.requires_identified_reviewer() {
        return match reviewer {
            Some(name) if !is_system_identity(name) => Ok(name.to_string()),
            _ => Err(WaylineError::InvalidDecision(format!(
                "{} approval requires an identified human reviewer",
                request.tier
            ))),
        };
    }

    match reviewer {
        Some(name) if is_system_identity(name) => Err(WaylineError::InvalidDecision(format!(
            "reviewer '{}' is reserved",
            name
        ))),
        Some(name) => Ok(name.to_string()),
        None => Ok(ANONYMOUS_REVIEWER.to_string()),
    }
}
