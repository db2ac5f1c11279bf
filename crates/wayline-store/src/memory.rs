use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;

use wayline_core::error::{Result, WaylineError};
use wayline_core::traits::{CheckpointStore, ExecutionStore};
use wayline_core::types::{ApprovalRequest, Checkpoint, ExecutionId, WorkflowExecution};

type Log = Arc<Mutex<Vec<Checkpoint>>>;

/// Process-local store. Nothing survives a restart.
///
/// Each execution's checkpoint log has its own lock, so appends for
/// unrelated executions never contend.
#[derive(Default)]
pub struct MemoryStore {
    checkpoints: RwLock<HashMap<ExecutionId, Log>>,
    executions: RwLock<Vec<WorkflowExecution>>,
    approvals: RwLock<Vec<ApprovalRequest>>,
}

fn poisoned(e: impl std::fmt::Display) -> WaylineError {
    WaylineError::Database(format!("store lock poisoned: {}", e))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, execution_id: &ExecutionId) -> Result<Option<Log>> {
        let logs = self.checkpoints.read().map_err(poisoned)?;
        Ok(logs.get(execution_id).cloned())
    }

    fn log_or_create(&self, execution_id: &ExecutionId) -> Result<Log> {
        if let Some(log) = self.log(execution_id)? {
            return Ok(log);
        }
        let mut logs = self.checkpoints.write().map_err(poisoned)?;
        Ok(logs.entry(execution_id.clone()).or_default().clone())
    }
}

impl CheckpointStore for MemoryStore {
    fn append(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let cp = checkpoint.clone();

        Box::pin(async move {
            let log = self.log_or_create(&cp.execution_id)?;
            let mut log = log.lock().map_err(poisoned)?;
            let expected = log.len() as u64 + 1;
            if cp.sequence_number != expected {
                return Err(WaylineError::CheckpointWrite(format!(
                    "execution {}: expected sequence {}, got {}",
                    cp.execution_id, expected, cp.sequence_number
                )));
            }
            log.push(cp);
            Ok(())
        })
    }

    fn latest(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let eid = execution_id.clone();

        Box::pin(async move {
            let Some(log) = self.log(&eid)? else {
                return Ok(None);
            };
            let log = log.lock().map_err(poisoned)?;
            Ok(log.last().cloned())
        })
    }

    fn get(
        &self,
        execution_id: &ExecutionId,
        sequence_number: u64,
    ) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let eid = execution_id.clone();

        Box::pin(async move {
            let Some(log) = self.log(&eid)? else {
                return Ok(None);
            };
            let log = log.lock().map_err(poisoned)?;
            Ok(sequence_number
                .checked_sub(1)
                .and_then(|i| log.get(i as usize))
                .cloned())
        })
    }

    fn list(&self, execution_id: &ExecutionId, from: u64) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
        let eid = execution_id.clone();

        Box::pin(async move {
            let Some(log) = self.log(&eid)? else {
                return Ok(vec![]);
            };
            let log = log.lock().map_err(poisoned)?;
            Ok(log
                .iter()
                .filter(|cp| cp.sequence_number >= from)
                .cloned()
                .collect())
        })
    }
}

impl ExecutionStore for MemoryStore {
    fn save_execution(&self, execution: &WorkflowExecution) -> BoxFuture<'_, Result<()>> {
        let exec = execution.clone();

        Box::pin(async move {
            let mut executions = self.executions.write().map_err(poisoned)?;
            match executions
                .iter_mut()
                .find(|e| e.execution_id == exec.execution_id)
            {
                Some(existing) => *existing = exec,
                None => executions.push(exec),
            }
            Ok(())
        })
    }

    fn load_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Option<WorkflowExecution>>> {
        let eid = execution_id.clone();

        Box::pin(async move {
            let executions = self.executions.read().map_err(poisoned)?;
            Ok(executions.iter().find(|e| e.execution_id == eid).cloned())
        })
    }

    fn list_executions(&self) -> BoxFuture<'_, Result<Vec<WorkflowExecution>>> {
        Box::pin(async move {
            let executions = self.executions.read().map_err(poisoned)?;
            // Insertion order is creation order
            Ok(executions.iter().rev().cloned().collect())
        })
    }

    fn list_active(&self) -> BoxFuture<'_, Result<Vec<WorkflowExecution>>> {
        Box::pin(async move {
            let executions = self.executions.read().map_err(poisoned)?;
            Ok(executions
                .iter()
                .filter(|e| !e.status.is_terminal())
                .cloned()
                .collect())
        })
    }

    fn save_approval(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        let req = request.clone();

        Box::pin(async move {
            let mut approvals = self.approvals.write().map_err(poisoned)?;
            match approvals.iter_mut().find(|r| r.request_id == req.request_id) {
                Some(existing) => *existing = req,
                None => approvals.push(req),
            }
            Ok(())
        })
    }

    fn load_approval(&self, request_id: &str) -> BoxFuture<'_, Result<Option<ApprovalRequest>>> {
        let rid = request_id.to_string();

        Box::pin(async move {
            let approvals = self.approvals.read().map_err(poisoned)?;
            Ok(approvals.iter().find(|r| r.request_id == rid).cloned())
        })
    }

    fn list_approvals(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Vec<ApprovalRequest>>> {
        let eid = execution_id.clone();

        Box::pin(async move {
            let approvals = self.approvals.read().map_err(poisoned)?;
            Ok(approvals
                .iter()
                .filter(|r| r.execution_id == eid)
                .cloned()
                .collect())
        })
    }

    fn list_pending_approvals(&self) -> BoxFuture<'_, Result<Vec<ApprovalRequest>>> {
        Box::pin(async move {
            let approvals = self.approvals.read().map_err(poisoned)?;
            Ok(approvals.iter().filter(|r| r.is_pending()).cloned().collect())
        })
    }
}
