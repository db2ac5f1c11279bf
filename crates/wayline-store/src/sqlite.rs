use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use wayline_core::error::{Result, WaylineError};
use wayline_core::traits::{CheckpointStore, ExecutionStore};
use wayline_core::types::{ApprovalRequest, Checkpoint, ExecutionId, WorkflowExecution};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        definition_id TEXT NOT NULL,
        definition_version TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

    CREATE TABLE IF NOT EXISTS checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL,
        sequence_number INTEGER NOT NULL,
        node_id TEXT NOT NULL,
        branch_id TEXT,
        status TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        body TEXT NOT NULL,
        UNIQUE(execution_id, sequence_number)
    );

    CREATE TABLE IF NOT EXISTS approvals (
        request_id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        decision TEXT NOT NULL,
        created_at TEXT NOT NULL,
        expires_at TEXT,
        body TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_approvals_execution ON approvals(execution_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_approvals_decision ON approvals(decision);";

/// SQLite-backed store for executions, checkpoints and approval requests.
///
/// Records are stored as JSON bodies next to the columns used for lookups.
/// Checkpoint appends are compare-and-swap on the sequence number.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> WaylineError {
    WaylineError::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WaylineError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL mode
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_bodies<T: serde::de::DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<T>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut out = Vec::new();
        for body in rows {
            let body = body.map_err(db_err)?;
            out.push(serde_json::from_str(&body)?);
        }
        Ok(out)
    }

    fn query_body<T: serde::de::DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<T>> {
        let body: Option<String> = conn
            .query_row(sql, params, |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }
}

impl CheckpointStore for SqliteStore {
    fn append(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let cp = checkpoint.clone();

        Box::pin(async move {
            let body = serde_json::to_string(&cp)?;
            let conn = self.conn.lock().map_err(db_err)?;

            let last: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(sequence_number), 0) FROM checkpoints WHERE execution_id = ?1",
                    params![cp.execution_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(db_err)?;

            if cp.sequence_number as i64 != last + 1 {
                return Err(WaylineError::CheckpointWrite(format!(
                    "execution {}: expected sequence {}, got {}",
                    cp.execution_id,
                    last + 1,
                    cp.sequence_number
                )));
            }

            conn.execute(
                "INSERT INTO checkpoints (execution_id, sequence_number, node_id, branch_id, status, timestamp, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    cp.execution_id.as_str(),
                    cp.sequence_number as i64,
                    cp.node_id,
                    cp.branch_id,
                    cp.status.to_string(),
                    cp.timestamp.to_rfc3339(),
                    body,
                ],
            )
            .map_err(|e| WaylineError::CheckpointWrite(e.to_string()))?;

            Ok(())
        })
    }

    fn latest(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let eid = execution_id.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_body(
                &conn,
                "SELECT body FROM checkpoints WHERE execution_id = ?1
                 ORDER BY sequence_number DESC LIMIT 1",
                params![eid],
            )
        })
    }

    fn get(
        &self,
        execution_id: &ExecutionId,
        sequence_number: u64,
    ) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let eid = execution_id.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_body(
                &conn,
                "SELECT body FROM checkpoints WHERE execution_id = ?1 AND sequence_number = ?2",
                params![eid, sequence_number as i64],
            )
        })
    }

    fn list(&self, execution_id: &ExecutionId, from: u64) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
        let eid = execution_id.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_bodies(
                &conn,
                "SELECT body FROM checkpoints WHERE execution_id = ?1 AND sequence_number >= ?2
                 ORDER BY sequence_number ASC",
                params![eid, from as i64],
            )
        })
    }
}

impl ExecutionStore for SqliteStore {
    fn save_execution(&self, execution: &WorkflowExecution) -> BoxFuture<'_, Result<()>> {
        let exec = execution.clone();

        Box::pin(async move {
            let body = serde_json::to_string(&exec)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO executions (execution_id, definition_id, definition_version, status, created_at, updated_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(execution_id) DO UPDATE SET
                     status = excluded.status,
                     updated_at = excluded.updated_at,
                     body = excluded.body",
                params![
                    exec.execution_id.as_str(),
                    exec.definition_id,
                    exec.definition_version,
                    exec.status.to_string(),
                    exec.created_at.to_rfc3339(),
                    exec.updated_at.to_rfc3339(),
                    body,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Option<WorkflowExecution>>> {
        let eid = execution_id.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_body(
                &conn,
                "SELECT body FROM executions WHERE execution_id = ?1",
                params![eid],
            )
        })
    }

    fn list_executions(&self) -> BoxFuture<'_, Result<Vec<WorkflowExecution>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_bodies(
                &conn,
                "SELECT body FROM executions ORDER BY created_at DESC, rowid DESC",
                params![],
            )
        })
    }

    fn list_active(&self) -> BoxFuture<'_, Result<Vec<WorkflowExecution>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_bodies(
                &conn,
                "SELECT body FROM executions
                 WHERE status IN ('pending', 'running', 'suspended')
                 ORDER BY created_at ASC, rowid ASC",
                params![],
            )
        })
    }

    fn save_approval(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        let req = request.clone();

        Box::pin(async move {
            let body = serde_json::to_string(&req)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO approvals (request_id, execution_id, node_id, decision, created_at, expires_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(request_id) DO UPDATE SET
                     decision = excluded.decision,
                     expires_at = excluded.expires_at,
                     body = excluded.body",
                params![
                    req.request_id,
                    req.execution_id.as_str(),
                    req.node_id,
                    req.decision.to_string(),
                    req.created_at.to_rfc3339(),
                    req.expires_at.map(|t| t.to_rfc3339()),
                    body,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_approval(&self, request_id: &str) -> BoxFuture<'_, Result<Option<ApprovalRequest>>> {
        let rid = request_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_body(
                &conn,
                "SELECT body FROM approvals WHERE request_id = ?1",
                params![rid],
            )
        })
    }

    fn list_approvals(
        &self,
        execution_id: &ExecutionId,
    ) -> BoxFuture<'_, Result<Vec<ApprovalRequest>>> {
        let eid = execution_id.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_bodies(
                &conn,
                "SELECT body FROM approvals WHERE execution_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
                params![eid],
            )
        })
    }

    fn list_pending_approvals(&self) -> BoxFuture<'_, Result<Vec<ApprovalRequest>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            Self::query_bodies(
                &conn,
                "SELECT body FROM approvals WHERE decision = 'pending'
                 ORDER BY created_at ASC, rowid ASC",
                params![],
            )
        })
    }
}
