use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, warn};

use wayline_core::error::{Result, WaylineError};
use wayline_core::state::State;
use wayline_core::traits::CheckpointStore;
use wayline_core::types::{Checkpoint, ExecutionId, ExecutionStatus, NextStep, ToolInvocation};

type Slot = Arc<tokio::sync::Mutex<Option<u64>>>;

/// Assigns sequence numbers and appends checkpoints, retrying failed writes.
///
/// Writers for one execution serialize on that execution's slot, so concurrent
/// fanout branches still produce a gap-free, strictly increasing sequence.
pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    attempts: u32,
    slots: Mutex<HashMap<ExecutionId, Slot>>,
}

/// Contents of a checkpoint before a sequence number is assigned.
pub struct Draft<'a> {
    pub node_id: &'a str,
    pub branch_id: Option<&'a str>,
    pub state: &'a State,
    pub next: NextStep,
    pub status: ExecutionStatus,
    pub invocations: Vec<ToolInvocation>,
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn CheckpointStore>, attempts: u32) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, execution_id: &ExecutionId) -> Result<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|e| WaylineError::CheckpointWrite(format!("lock poisoned: {}", e)))?;
        Ok(slots.entry(execution_id.clone()).or_default().clone())
    }

    /// Append a new checkpoint built from `draft`.
    pub async fn write(&self, execution_id: &ExecutionId, draft: Draft<'_>) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            execution_id: execution_id.clone(),
            sequence_number: 0,
            node_id: draft.node_id.to_string(),
            branch_id: draft.branch_id.map(String::from),
            state: draft.state.clone(),
            next: draft.next,
            status: draft.status,
            invocations: draft.invocations,
            timestamp: Utc::now(),
        };
        self.append(checkpoint).await
    }

    /// Append `checkpoint` under the next sequence number of its execution.
    pub async fn append(&self, mut checkpoint: Checkpoint) -> Result<Checkpoint> {
        let slot = self.slot(&checkpoint.execution_id)?;
        let mut next = slot.lock().await;
        let sequence = match *next {
            Some(seq) => seq,
            None => self
                .store
                .latest(&checkpoint.execution_id)
                .await?
                .map_or(1, |cp| cp.sequence_number + 1),
        };
        checkpoint.sequence_number = sequence;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.append(&checkpoint).await {
                Ok(()) => {
                    *next = Some(sequence + 1);
                    return Ok(checkpoint);
                }
                Err(e) if attempt < self.attempts => {
                    warn!(
                        execution_id = %checkpoint.execution_id,
                        sequence,
                        attempt,
                        error = %e,
                        "Checkpoint write failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => {
                    error!(
                        execution_id = %checkpoint.execution_id,
                        sequence,
                        error = %e,
                        "Checkpoint write failed"
                    );
                    // Re-read the log on the next write.
                    *next = None;
                    return Err(match e {
                        WaylineError::CheckpointWrite(msg) => WaylineError::CheckpointWrite(msg),
                        other => WaylineError::CheckpointWrite(other.to_string()),
                    });
                }
            }
        }
    }

    /// Drop cached sequence state for an execution that reached a terminal status.
    pub fn forget(&self, execution_id: &ExecutionId) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(execution_id);
        }
    }
}
