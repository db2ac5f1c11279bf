pub mod builtin;
pub mod registry;
pub mod schema;

pub use builtin::echo::EchoTool;
pub use builtin::rules::RuleClassifier;
pub use registry::{ToolDescriptor, ToolRegistry, ToolSpec};
