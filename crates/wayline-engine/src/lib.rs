pub mod approval;
pub mod checkpoint;
pub mod engine;
pub mod fanout;
pub mod graph;
pub mod handlers;
pub mod registry;
pub mod retry;

pub use checkpoint::CheckpointWriter;
pub use engine::ExecutionEngine;
pub use graph::{compile, CompiledGraph, Node, NodeKind};
pub use handlers::{NodeContext, NodeHandler, NodeOutput, Transition};
pub use registry::DefinitionRegistry;
pub use retry::{calculate_backoff, ToolInvoker};
