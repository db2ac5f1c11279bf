use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use wayline_core::condition::Condition;
use wayline_core::definition::{NodeSpec, NodeType};
use wayline_core::error::CompilationError;
use wayline_core::types::{ApprovalTier, Decision};

/// A compiled node: its id plus the typed config for its type.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

/// Closed set of node types, each carrying its parsed config.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Start,
    End,
    Tool(ToolConfig),
    Router(RouterConfig),
    Approval(ApprovalConfig),
    Fanout(FanoutConfig),
    Fanin(FaninConfig),
    Loop(LoopNode),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Start => NodeType::Start,
            Self::End => NodeType::End,
            Self::Tool(_) => NodeType::Tool,
            Self::Router(_) => NodeType::Router,
            Self::Approval(_) => NodeType::Approval,
            Self::Fanout(_) => NodeType::Fanout,
            Self::Fanin(_) => NodeType::Fanin,
            Self::Loop(_) => NodeType::Loop,
        }
    }

    /// Tools the node calls, for compile-time registration checks.
    pub fn referenced_tools(&self) -> Vec<&str> {
        match self {
            Self::Tool(c) => vec![c.tool.as_str()],
            Self::Router(c) => vec![c.classifier.as_str()],
            Self::Fanin(FaninConfig {
                merge: MergeStrategy::Tool(tool),
            }) => vec![tool.as_str()],
            _ => vec![],
        }
    }
}

/// Calls one tool and writes its output into state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    pub tool: String,
    /// Static input fields.
    #[serde(default)]
    pub input: Map<String, Value>,
    /// State keys copied into the input. With no static input and no keys, the
    /// whole state is passed.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Where to store the output. Without it, object outputs are merged into
    /// state and anything else is stored under the tool name.
    #[serde(default)]
    pub output_key: Option<String>,
    /// Overrides the retry count of the tool's policy.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Chooses one worker from a candidate set by calling a classifier tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    pub classifier: String,
    pub candidates: Vec<String>,
    /// Worker id to node id. Unmapped workers go to the node of the same name,
    /// or else through the router's edges.
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    /// State keys passed to the classifier (empty = whole state).
    #[serde(default)]
    pub input_keys: Vec<String>,
}

/// What happens when an approval request expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    #[default]
    Fail,
    /// Apply a fallback decision attributed to the system.
    Decide(Decision),
}

/// What happens when a reviewer rejects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectPolicy {
    #[default]
    Fail,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovalConfig {
    pub tier: ApprovalTier,
    /// State keys shown to the reviewer (empty = whole state).
    #[serde(default)]
    pub payload_keys: Vec<String>,
    /// Overrides `engine.approval_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    #[serde(default)]
    pub on_reject: RejectPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FanoutConfig {
    /// Entry node of each branch, in declared order.
    pub branches: Vec<String>,
    /// The fanin node every branch runs up to.
    pub fanin: String,
    #[serde(default)]
    pub best_effort: bool,
    /// Overrides `engine.max_fanout_concurrency`.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

/// How a fanin combines the state updates of its branches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Later branches (in declared order) overwrite earlier ones per key.
    #[default]
    LastWriterWins,
    /// Every changed key becomes an array of the branch values, in branch order.
    Collect,
    /// Delegate to a tool receiving `{base, branches: [updates]}` and returning
    /// the object to merge.
    Tool(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaninConfig {
    #[serde(default)]
    pub merge: MergeStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// First node of the loop body.
    pub body: String,
    /// Exit early once this condition holds.
    #[serde(default)]
    pub until: Option<String>,
}

/// A loop node with its exit condition parsed.
#[derive(Debug, Clone)]
pub struct LoopNode {
    pub max_iterations: u32,
    pub body: String,
    pub until: Option<Condition>,
}

fn typed<T: DeserializeOwned>(spec: &NodeSpec) -> Result<T, CompilationError> {
    serde_json::from_value(spec.config.clone()).map_err(|e| CompilationError::InvalidConfig {
        node_id: spec.node_id.clone(),
        reason: e.to_string(),
    })
}

fn invalid(spec: &NodeSpec, reason: impl Into<String>) -> CompilationError {
    CompilationError::InvalidConfig {
        node_id: spec.node_id.clone(),
        reason: reason.into(),
    }
}

impl Node {
    /// Parse a node spec into its typed form. Cross-node checks live in the compiler.
    pub fn from_spec(spec: &NodeSpec) -> Result<Self, CompilationError> {
        let kind = match spec.node_type {
            NodeType::Start => NodeKind::Start,
            NodeType::End => NodeKind::End,
            NodeType::Tool => {
                let config: ToolConfig = typed(spec)?;
                if config.tool.trim().is_empty() {
                    return Err(invalid(spec, "tool name must not be empty"));
                }
                NodeKind::Tool(config)
            }
            NodeType::Router => {
                let config: RouterConfig = typed(spec)?;
                if config.candidates.is_empty() {
                    return Err(invalid(spec, "router needs at least one candidate"));
                }
                if let Some(worker) = config
                    .routes
                    .keys()
                    .find(|w| !config.candidates.contains(w))
                {
                    return Err(invalid(
                        spec,
                        format!("route for '{}' which is not a candidate", worker),
                    ));
                }
                NodeKind::Router(config)
            }
            NodeType::Approval => {
                let config: ApprovalConfig = typed(spec)?;
                match config.on_timeout {
                    TimeoutPolicy::Decide(Decision::Pending) => {
                        return Err(invalid(spec, "timeout fallback decision cannot be pending"));
                    }
                    TimeoutPolicy::Decide(Decision::Edited) => {
                        return Err(invalid(spec, "timeout fallback decision cannot be edited"));
                    }
                    TimeoutPolicy::Decide(Decision::Approved)
                        if config.tier.requires_identified_reviewer() =>
                    {
                        return Err(invalid(
                            spec,
                            "tier3 approvals cannot be auto-approved on timeout",
                        ));
                    }
                    _ => {}
                }
                if config.timeout_secs == Some(0) {
                    return Err(invalid(spec, "timeout_secs must be positive"));
                }
                NodeKind::Approval(config)
            }
            NodeType::Fanout => {
                let config: FanoutConfig = typed(spec)?;
                if config.branches.is_empty() {
                    return Err(invalid(spec, "fanout needs at least one branch"));
                }
                if config.max_concurrency == Some(0) {
                    return Err(invalid(spec, "max_concurrency must be positive"));
                }
                NodeKind::Fanout(config)
            }
            NodeType::Fanin => NodeKind::Fanin(typed(spec)?),
            NodeType::Loop => {
                let config: LoopConfig = typed(spec)?;
                if config.max_iterations == 0 {
                    return Err(invalid(spec, "max_iterations must be at least 1"));
                }
                let until = match &config.until {
                    Some(expr) => Some(
                        expr.parse::<Condition>()
                            .map_err(|e| invalid(spec, format!("until: {}", e)))?,
                    ),
                    None => None,
                };
                NodeKind::Loop(LoopNode {
                    max_iterations: config.max_iterations,
                    body: config.body,
                    until,
                })
            }
        };

        Ok(Self {
            id: spec.node_id.clone(),
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(node_type: NodeType, config: Value) -> Result<Node, CompilationError> {
        Node::from_spec(&NodeSpec::new("n", node_type).with_config(config))
    }

    #[test]
    fn tool_config_defaults() {
        let node = parse(NodeType::Tool, json!({"tool": "fetch_patient"})).unwrap();
        assert_eq!(node.kind.node_type(), NodeType::Tool);
        assert_eq!(node.kind.referenced_tools(), vec!["fetch_patient"]);
        let NodeKind::Tool(config) = node.kind else {
            panic!("expected tool");
        };
        assert!(config.input.is_empty());
        assert!(config.output_key.is_none());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = parse(NodeType::Tool, json!({"tool": "t", "tol": 1})).unwrap_err();
        assert!(matches!(err, CompilationError::InvalidConfig { .. }));
    }

    #[test]
    fn approval_policies_parse() {
        let node = parse(
            NodeType::Approval,
            json!({"tier": "tier2", "on_timeout": {"decide": "rejected"}, "on_reject": "continue"}),
        )
        .unwrap();
        let NodeKind::Approval(config) = node.kind else {
            panic!("expected approval");
        };
        assert_eq!(config.on_timeout, TimeoutPolicy::Decide(Decision::Rejected));
        assert_eq!(config.on_reject, RejectPolicy::Continue);

        let node = parse(NodeType::Approval, json!({"tier": "tier1_automated"})).unwrap();
        let NodeKind::Approval(config) = node.kind else {
            panic!("expected approval");
        };
        assert_eq!(config.on_timeout, TimeoutPolicy::Fail);
    }

    #[test]
    fn tier3_cannot_auto_approve() {
        let err = parse(
            NodeType::Approval,
            json!({"tier": "tier3_clinical", "on_timeout": {"decide": "approved"}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("tier3"));
    }

    #[test]
    fn router_routes_must_name_candidates() {
        let err = parse(
            NodeType::Router,
            json!({"classifier": "c", "candidates": ["a"], "routes": {"b": "x"}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn loop_requires_positive_bound_and_valid_until() {
        assert!(parse(NodeType::Loop, json!({"max_iterations": 0, "body": "b"})).is_err());
        assert!(parse(NodeType::Loop, json!({"max_iterations": 2, "body": "b", "until": "??"})).is_err());
        let node = parse(
            NodeType::Loop,
            json!({"max_iterations": 3, "body": "b", "until": "verdict == \"ok\""}),
        )
        .unwrap();
        assert!(matches!(node.kind, NodeKind::Loop(LoopNode { until: Some(_), .. })));
    }

    #[test]
    fn merge_strategy_forms() {
        let c: FaninConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(c.merge, MergeStrategy::LastWriterWins);
        let c: FaninConfig = serde_json::from_value(json!({"merge": "collect"})).unwrap();
        assert_eq!(c.merge, MergeStrategy::Collect);
        let c: FaninConfig = serde_json::from_value(json!({"merge": {"tool": "m"}})).unwrap();
        assert_eq!(c.merge, MergeStrategy::Tool("m".into()));
    }
}
