pub mod condition;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use condition::Condition;
pub use config::AppConfig;
pub use definition::{EdgeSpec, NodeSpec, NodeType, WorkflowDefinition};
pub use error::{CompilationError, Result, ToolErrorKind, ToolInvocationError, WaylineError};
pub use event::EventBus;
pub use state::State;
pub use types::*;
