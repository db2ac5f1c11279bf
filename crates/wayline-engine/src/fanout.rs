//! Concurrent execution of fanout branches.

use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use wayline_core::error::WaylineError;
use wayline_core::state::State;
use wayline_core::types::{Checkpoint, EngineEvent, ExecutionId, ExecutionStatus, NextStep};

use crate::checkpoint::Draft;
use crate::engine::{next_step, ExecutionEngine};
use crate::graph::{CompiledGraph, FanoutConfig, NodeKind};
use crate::handlers::{FaninInput, NodeFailure};

/// A failed branch: the node it failed at and why.
pub(crate) type BranchFailure = (String, NodeFailure);

/// Identifier recorded on checkpoints taken inside a branch.
pub fn branch_id(fanout_id: &str, index: usize, entry: &str) -> String {
    format!("{}/{}:{}", fanout_id, index, entry)
}

/// How far one branch got before the fanout was interrupted.
#[derive(Debug, Clone)]
pub(crate) struct BranchProgress {
    pub index: usize,
    /// Node the branch continues at. Equal to the fanin once the branch finished.
    pub next: String,
    pub state: State,
}

/// Where each branch of `fanout_id` stood after the checkpoints in `after`.
pub(crate) fn branch_progress(
    graph: &CompiledGraph,
    fanout_id: &str,
    after: &[Checkpoint],
) -> Vec<BranchProgress> {
    let Some(NodeKind::Fanout(config)) = graph.node(fanout_id).map(|n| &n.kind) else {
        return Vec::new();
    };
    config
        .branches
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let id = branch_id(fanout_id, index, entry);
            let latest = after.iter().rev().find(|cp| {
                cp.branch_id.as_deref() == Some(id.as_str())
                    && graph.enclosing_fanout(&cp.node_id) == Some(fanout_id)
            })?;
            let NextStep::Node(next) = &latest.next else {
                return None;
            };
            Some(BranchProgress {
                index,
                next: next.clone(),
                state: latest.state.clone(),
            })
        })
        .collect()
}

impl ExecutionEngine {
    /// Run every branch of `fanout_id` from `base` up to its fanin.
    ///
    /// Branches listed in `progress` continue from where they stopped, and
    /// those that already reached the fanin are not run again. At most
    /// `max_concurrency` branches run at once. Unless the fanout is best
    /// effort, the first failure stops unstarted branches and cancels running
    /// ones at their next node boundary.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_branches(
        &self,
        execution_id: &ExecutionId,
        graph: &CompiledGraph,
        fanout_id: &str,
        config: &FanoutConfig,
        base: &State,
        progress: &[BranchProgress],
        token: &CancellationToken,
    ) -> Result<FaninInput, BranchFailure> {
        let total = config.branches.len();
        let limit = config
            .max_concurrency
            .or(Some(self.config.max_fanout_concurrency).filter(|n| *n > 0))
            .unwrap_or(total)
            .max(1);
        let branch_token = token.child_token();

        let mut outcomes: Vec<Option<State>> = vec![None; total];
        let mut pending = Vec::with_capacity(total);
        for (index, entry) in config.branches.iter().enumerate() {
            match progress.iter().find(|p| p.index == index) {
                Some(p) if p.next == config.fanin => outcomes[index] = Some(p.state.clone()),
                Some(p) => pending.push((index, entry, p.next.clone(), p.state.clone())),
                None => pending.push((index, entry, entry.clone(), base.clone())),
            }
        }
        debug!(
            execution_id = %execution_id,
            fanout = fanout_id,
            branches = total,
            finished = total - pending.len(),
            limit,
            "Fanout started"
        );

        let mut queued = pending.into_iter();
        let mut running = FuturesUnordered::new();
        let mut errors: Vec<(usize, Value)> = Vec::new();
        let mut first_failure: Option<BranchFailure> = None;

        loop {
            while running.len() < limit && !branch_token.is_cancelled() {
                let Some((index, entry, start, state)) = queued.next() else {
                    break;
                };
                let id = branch_id(fanout_id, index, entry);
                let branch = self.run_branch(
                    execution_id,
                    graph,
                    id,
                    start,
                    &config.fanin,
                    state,
                    &branch_token,
                );
                running.push(async move { (index, branch.await) });
            }

            let Some((index, result)) = running.next().await else {
                break;
            };
            match result {
                Ok(state) => outcomes[index] = Some(state),
                Err((node_id, failure)) => {
                    let cancelled = matches!(failure.error, WaylineError::Cancelled);
                    if !cancelled {
                        warn!(
                            execution_id = %execution_id,
                            fanout = fanout_id,
                            branch = index,
                            node = %node_id,
                            error = %failure.error,
                            "Branch failed"
                        );
                        errors.push((
                            index,
                            json!({
                                "branch_id": branch_id(fanout_id, index, &config.branches[index]),
                                "kind": failure.error.kind(),
                                "message": failure.error.to_string(),
                                "node_id": node_id,
                            }),
                        ));
                        if !config.best_effort {
                            branch_token.cancel();
                        }
                    }
                    if first_failure.is_none() && !cancelled {
                        first_failure = Some((node_id, failure));
                    }
                }
            }
        }

        if token.is_cancelled() {
            return Err((fanout_id.to_string(), WaylineError::Cancelled.into()));
        }
        if !config.best_effort {
            if let Some(failure) = first_failure {
                return Err(failure);
            }
        }

        let updates: Vec<State> = outcomes
            .into_iter()
            .flatten()
            .map(|state| state.changes_since(base))
            .collect();
        if updates.is_empty() {
            return Err(first_failure.unwrap_or_else(|| {
                (
                    fanout_id.to_string(),
                    WaylineError::RoutingDeadEnd {
                        node_id: fanout_id.to_string(),
                        reason: "no branch completed".into(),
                    }
                    .into(),
                )
            }));
        }

        errors.sort_by_key(|(index, _)| *index);
        Ok(FaninInput {
            base: base.clone(),
            updates,
            errors: errors.into_iter().map(|(_, e)| e).collect(),
        })
    }

    /// Drive one branch from `start` until control reaches `fanin`.
    #[allow(clippy::too_many_arguments)]
    async fn run_branch(
        &self,
        execution_id: &ExecutionId,
        graph: &CompiledGraph,
        branch_id: String,
        start: String,
        fanin: &str,
        mut state: State,
        token: &CancellationToken,
    ) -> Result<State, BranchFailure> {
        let mut current = start;

        while current != fanin {
            if token.is_cancelled() {
                return Err((current, WaylineError::Cancelled.into()));
            }
            let Some(node) = graph.node(&current) else {
                let error = WaylineError::RoutingDeadEnd {
                    node_id: current.clone(),
                    reason: "node does not exist".into(),
                };
                return Err((current, error.into()));
            };

            let started = Instant::now();
            let result = {
                let ctx = self.context(execution_id, &current, graph, token);
                node.kind.handler().execute(&ctx, state).await
            };
            let output = match result {
                Ok(output) => output,
                Err(failure) => return Err((current, failure)),
            };

            let next = match next_step(graph, &current, &output) {
                Ok(NextStep::Node(next)) => next,
                Ok(_) => {
                    let error = WaylineError::RoutingDeadEnd {
                        node_id: current.clone(),
                        reason: "branch nodes can only continue to another node".into(),
                    };
                    return Err((current, error.into()));
                }
                Err(error) => {
                    let failure = NodeFailure {
                        error,
                        invocations: output.invocations,
                    };
                    return Err((current, failure));
                }
            };

            if let Some(request) = &output.approval {
                if let Err(e) = self.executions.save_approval(request).await {
                    return Err((current, e.into()));
                }
                self.event_bus.publish(EngineEvent::ApprovalResolved {
                    request_id: request.request_id.clone(),
                    execution_id: execution_id.clone(),
                    decision: request.decision,
                });
            }
            let draft = Draft {
                node_id: &current,
                branch_id: Some(&branch_id),
                state: &output.state,
                next: NextStep::Node(next.clone()),
                status: ExecutionStatus::Running,
                invocations: output.invocations,
            };
            let checkpoint = match self.writer.write(execution_id, draft).await {
                Ok(cp) => cp,
                Err(e) => return Err((current, e.into())),
            };
            self.event_bus.publish(EngineEvent::NodeCompleted {
                execution_id: execution_id.clone(),
                node_id: current.clone(),
                branch_id: Some(branch_id.clone()),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            self.event_bus.publish(EngineEvent::CheckpointWritten {
                execution_id: execution_id.clone(),
                sequence_number: checkpoint.sequence_number,
                node_id: current.clone(),
            });

            state = output.state;
            current = next;
        }

        debug!(execution_id = %execution_id, branch = %branch_id, "Branch reached fanin");
        Ok(state)
    }
}
