use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use wayline_core::config::RetryConfig;
use wayline_core::error::ToolInvocationError;
use wayline_core::event::EventBus;
use wayline_core::types::{EngineEvent, ExecutionId, ToolInvocation};
use wayline_tools::ToolRegistry;

/// Exponential backoff with 0.8x-1.2x jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Calls tools through the registry, retrying retryable failures of idempotent tools.
pub struct ToolInvoker {
    tools: Arc<ToolRegistry>,
    retry: RetryConfig,
    event_bus: Arc<EventBus>,
}

impl ToolInvoker {
    pub fn new(tools: Arc<ToolRegistry>, retry: RetryConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            tools,
            retry,
            event_bus,
        }
    }

    /// Invoke `tool`, returning the invocation record alongside the result.
    ///
    /// Attempts stop early once `cancel` fires; the last error is returned.
    pub async fn call(
        &self,
        execution_id: &ExecutionId,
        tool: &str,
        input: Value,
        max_retries: Option<u32>,
        cancel: &CancellationToken,
    ) -> (ToolInvocation, Result<Value, ToolInvocationError>) {
        let policy = self.tools.retry_policy(tool).unwrap_or_else(|| self.retry.clone());
        let idempotent = self.tools.is_idempotent(tool);
        let max_retries = if idempotent {
            max_retries.unwrap_or(policy.max_retries)
        } else {
            0
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.tools.invoke(tool, input.clone()).await {
                Ok(output) => {
                    debug!(execution_id = %execution_id, tool, attempt, "Tool call succeeded");
                    let record = ToolInvocation {
                        tool_name: tool.to_string(),
                        input,
                        output: Some(output.clone()),
                        error: None,
                        attempt_count: attempt,
                    };
                    return (record, Ok(output));
                }
                Err(mut e) => {
                    if !idempotent {
                        e = e.non_retryable();
                    }
                    if e.retryable && attempt <= max_retries && !cancel.is_cancelled() {
                        let backoff = calculate_backoff(attempt - 1, &policy);
                        warn!(
                            execution_id = %execution_id,
                            tool,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Tool call failed, retrying"
                        );
                        self.event_bus.publish(EngineEvent::ToolRetry {
                            execution_id: execution_id.clone(),
                            tool_name: tool.to_string(),
                            attempt,
                            error: e.message.clone(),
                        });
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    let record = ToolInvocation {
                        tool_name: tool.to_string(),
                        input,
                        output: None,
                        error: Some(e.clone()),
                        attempt_count: attempt,
                    };
                    return (record, Err(e));
                }
            }
        }
    }
}
