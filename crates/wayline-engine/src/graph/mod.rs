//! Workflow graphs: typed nodes, conditional edges and the compiler that
//! validates a definition into an executable `CompiledGraph`.

pub mod compiler;
pub mod edge;
pub mod node;

pub use compiler::{compile, CompiledGraph};
pub use edge::Edge;
pub use node::{
    ApprovalConfig, FaninConfig, FanoutConfig, LoopNode, MergeStrategy, Node, NodeKind,
    RejectPolicy, RouterConfig, TimeoutPolicy, ToolConfig,
};
