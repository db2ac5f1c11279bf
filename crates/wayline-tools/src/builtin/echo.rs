use futures::future::BoxFuture;
use serde_json::Value;

use wayline_core::error::ToolInvocationError;
use wayline_core::traits::Tool;

/// Returns its input unchanged.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Return the input unchanged."
    }
    fn invoke(&self, input: Value) -> BoxFuture<'_, Result<Value, ToolInvocationError>> {
        Box::pin(async move { Ok(input) })
    }
}
