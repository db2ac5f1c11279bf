use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use wayline_core::config::{ClassifierConfig, RetryConfig};
use wayline_core::error::{Result, ToolErrorKind, ToolInvocationError};
use wayline_core::traits::Tool;

use crate::builtin::echo::EchoTool;
use crate::builtin::rules::RuleClassifier;
use crate::schema;

/// Declarative description of a tool registered from a plain handler.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub idempotent: bool,
    pub timeout_secs: Option<u64>,
    pub retry: Option<RetryConfig>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: serde_json::json!({}),
            output_schema: serde_json::json!({}),
            idempotent: true,
            timeout_secs: None,
            retry: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

type Handler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, ToolInvocationError>> + Send + Sync>;

/// Adapts a `ToolSpec` plus closure to the `Tool` trait.
struct FnTool {
    spec: ToolSpec,
    handler: Handler,
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.spec.name
    }
    fn description(&self) -> &str {
        &self.spec.description
    }
    fn input_schema(&self) -> Value {
        self.spec.input_schema.clone()
    }
    fn output_schema(&self) -> Value {
        self.spec.output_schema.clone()
    }
    fn timeout_secs(&self) -> Option<u64> {
        self.spec.timeout_secs
    }
    fn idempotent(&self) -> bool {
        self.spec.idempotent
    }
    fn retry(&self) -> Option<RetryConfig> {
        self.spec.retry.clone()
    }
    fn invoke(&self, input: Value) -> BoxFuture<'_, std::result::Result<Value, ToolInvocationError>> {
        (self.handler)(input)
    }
}

/// Public description of a registered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub idempotent: bool,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    default_timeout_secs: u64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            default_timeout_secs: 30,
        }
    }

    /// Timeout applied to tools that do not declare one.
    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    /// Register a tool implementation.
    pub fn register_tool(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            tracing::warn!(tool = %name, "Replacing previously registered tool");
        }
    }

    /// Register a tool from a spec and an async handler.
    pub fn register<F, Fut>(&mut self, spec: ToolSpec, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ToolInvocationError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |input| -> BoxFuture<'static, _> {
            Box::pin(handler(input))
        });
        self.register_tool(FnTool { spec, handler });
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Descriptors of every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDescriptor> {
        let mut defs: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
                output_schema: t.output_schema(),
                idempotent: t.idempotent(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Whether the named tool may be retried automatically. Unknown tools are not.
    pub fn is_idempotent(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.idempotent())
    }

    /// Per-tool retry override, if the tool declares one.
    pub fn retry_policy(&self, name: &str) -> Option<RetryConfig> {
        self.tools.get(name).and_then(|t| t.retry())
    }

    /// Invoke a tool: validate input, run under the timeout, validate output.
    pub async fn invoke(
        &self,
        name: &str,
        input: Value,
    ) -> std::result::Result<Value, ToolInvocationError> {
        let tool = self.get(name).ok_or_else(|| {
            ToolInvocationError::new(name, ToolErrorKind::NotFound, "tool is not registered")
        })?;

        schema::validate(&tool.input_schema(), &input)
            .map_err(|e| ToolInvocationError::new(name, ToolErrorKind::InvalidInput, e))?;

        let timeout_secs = tool.timeout_secs().unwrap_or(self.default_timeout_secs);
        let timeout = Duration::from_secs(timeout_secs);

        let output = match tokio::time::timeout(timeout, tool.invoke(input)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ToolInvocationError::new(
                    name,
                    ToolErrorKind::Timeout,
                    format!("no result within {}s", timeout_secs),
                ))
            }
        };

        schema::validate(&tool.output_schema(), &output)
            .map_err(|e| ToolInvocationError::new(name, ToolErrorKind::InvalidOutput, e))?;

        Ok(output)
    }

    /// Register one `RuleClassifier` per configured classifier table.
    pub fn register_classifiers(&mut self, classifiers: &[ClassifierConfig]) -> Result<()> {
        for config in classifiers {
            self.register_tool(RuleClassifier::from_config(config)?);
        }
        Ok(())
    }

    /// Create a registry with the built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_tool(EchoTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
