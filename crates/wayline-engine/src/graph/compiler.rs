use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use wayline_core::condition::Condition;
use wayline_core::definition::WorkflowDefinition;
use wayline_core::error::CompilationError;
use wayline_tools::ToolRegistry;

use super::edge::Edge;
use super::node::{Node, NodeKind};

/// A validated workflow, ready to execute.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub id: String,
    pub version: String,
    pub start: String,
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    edges: HashMap<String, Vec<Edge>>,
    /// Nodes that run inside a fanout branch, mapped to that fanout.
    branch_scope: HashMap<String, String>,
    definition: WorkflowDefinition,
}

impl CompiledGraph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in declared order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Outgoing edges of a node, in declared order.
    pub fn outgoing(&self, id: &str) -> &[Edge] {
        self.edges.get(id).map(|e| e.as_slice()).unwrap_or(&[])
    }

    pub fn is_end(&self, id: &str) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|n| matches!(n.kind, NodeKind::End))
    }

    /// The fanout whose branches contain `node_id`, if any.
    pub fn enclosing_fanout(&self, node_id: &str) -> Option<&str> {
        self.branch_scope.get(node_id).map(|s| s.as_str())
    }

    /// The definition this graph was compiled from.
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    /// Every node control can move to from `id`: edges plus implicit routes.
    fn successors(&self, id: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self.outgoing(id).iter().map(|e| e.to.as_str()).collect();
        if let Some(node) = self.nodes.get(id) {
            match &node.kind {
                NodeKind::Router(c) => {
                    out.extend(c.routes.values().map(|s| s.as_str()));
                    out.extend(
                        c.candidates
                            .iter()
                            .filter(|w| self.nodes.contains_key(*w))
                            .map(|s| s.as_str()),
                    );
                }
                NodeKind::Loop(l) => out.push(l.body.as_str()),
                NodeKind::Fanout(c) => {
                    out.extend(c.branches.iter().map(|s| s.as_str()));
                    out.push(c.fanin.as_str());
                }
                _ => {}
            }
        }
        out
    }
}

fn invalid(node_id: &str, reason: impl Into<String>) -> CompilationError {
    CompilationError::InvalidConfig {
        node_id: node_id.to_string(),
        reason: reason.into(),
    }
}

/// Validate a definition against the tool registry and build its graph.
pub fn compile(
    definition: &WorkflowDefinition,
    tools: &ToolRegistry,
) -> Result<CompiledGraph, CompilationError> {
    if definition.id.trim().is_empty() {
        return Err(CompilationError::MissingField { field: "id" });
    }
    if definition.version.trim().is_empty() {
        return Err(CompilationError::MissingField { field: "version" });
    }

    // Node ids
    let mut seen = HashSet::new();
    for spec in &definition.nodes {
        let id = spec.node_id.as_str();
        if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(CompilationError::InvalidNodeId(id.to_string()));
        }
        if !seen.insert(id) {
            return Err(CompilationError::DuplicateNode(id.to_string()));
        }
    }

    // Edge endpoints
    for edge in &definition.edges {
        for endpoint in [&edge.source_node_id, &edge.target_node_id] {
            if !seen.contains(endpoint.as_str()) {
                return Err(CompilationError::DanglingEdge {
                    source_node: edge.source_node_id.clone(),
                    target: edge.target_node_id.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }

    // Typed configs
    let mut nodes = HashMap::new();
    let mut order = Vec::new();
    for spec in &definition.nodes {
        let node = Node::from_spec(spec)?;
        order.push(node.id.clone());
        nodes.insert(node.id.clone(), node);
    }

    let starts: Vec<&str> = order
        .iter()
        .filter(|id| matches!(nodes[id.as_str()].kind, NodeKind::Start))
        .map(|s| s.as_str())
        .collect();
    let start = match starts.as_slice() {
        [] => return Err(CompilationError::NoStartNode),
        [one] => one.to_string(),
        many => return Err(CompilationError::MultipleStartNodes(many.len())),
    };

    // Tools
    for id in &order {
        for tool in nodes[id].kind.referenced_tools() {
            if !tools.contains(tool) {
                return Err(CompilationError::UnknownTool {
                    node_id: id.clone(),
                    tool: tool.to_string(),
                });
            }
        }
    }

    check_references(&order, &nodes)?;

    // Edge conditions, fallback placement
    let mut edges: HashMap<String, Vec<Edge>> = HashMap::new();
    for spec in &definition.edges {
        let condition = match &spec.condition {
            Some(expr) => Some(expr.parse::<Condition>().map_err(|reason| {
                CompilationError::InvalidCondition {
                    source_node: spec.source_node_id.clone(),
                    target: spec.target_node_id.clone(),
                    reason,
                }
            })?),
            None => None,
        };
        let out = edges.entry(spec.source_node_id.clone()).or_default();
        if out.last().is_some_and(|e| e.condition.is_none()) {
            return Err(CompilationError::MisplacedFallback(
                spec.source_node_id.clone(),
            ));
        }
        out.push(Edge {
            from: spec.source_node_id.clone(),
            to: spec.target_node_id.clone(),
            condition,
        });
    }

    // Ways out
    for id in &order {
        let has_edges = edges.get(id).is_some_and(|e| !e.is_empty());
        let ok = match &nodes[id].kind {
            NodeKind::End => {
                if has_edges {
                    return Err(CompilationError::EndHasOutgoing(id.clone()));
                }
                true
            }
            NodeKind::Fanout(c) => {
                if has_edges {
                    return Err(invalid(
                        id,
                        format!("fanout continues at fanin '{}' and takes no edges", c.fanin),
                    ));
                }
                true
            }
            NodeKind::Router(c) => {
                has_edges
                    || c.candidates
                        .iter()
                        .all(|w| c.routes.contains_key(w) || nodes.contains_key(w))
            }
            _ => has_edges,
        };
        if !ok {
            return Err(CompilationError::NoOutgoingRoute(id.clone()));
        }
    }

    let mut graph = CompiledGraph {
        id: definition.id.clone(),
        version: definition.version.clone(),
        start,
        nodes,
        order,
        edges,
        branch_scope: HashMap::new(),
        definition: definition.clone(),
    };

    check_reachable_end(&graph)?;
    check_cycles(&graph)?;
    graph.branch_scope = check_branches(&graph)?;

    debug!(
        definition_id = %graph.id,
        version = %graph.version,
        nodes = graph.order.len(),
        "Workflow compiled"
    );
    Ok(graph)
}

/// Router routes, loop bodies and fanout/fanin pairings point at suitable nodes.
fn check_references(order: &[String], nodes: &HashMap<String, Node>) -> Result<(), CompilationError> {
    let kind_of = |id: &str| nodes.get(id).map(|n| &n.kind);
    let mut paired_fanins: HashMap<&str, &str> = HashMap::new();

    for id in order {
        match &nodes[id].kind {
            NodeKind::Router(c) => {
                for (worker, target) in &c.routes {
                    if kind_of(target).is_none() {
                        return Err(invalid(
                            id,
                            format!("route '{}' targets unknown node '{}'", worker, target),
                        ));
                    }
                }
            }
            NodeKind::Loop(l) => match kind_of(&l.body) {
                None => return Err(invalid(id, format!("unknown body node '{}'", l.body))),
                Some(NodeKind::Start | NodeKind::End) => {
                    return Err(invalid(id, "loop body must not be a start or end node"))
                }
                Some(_) if l.body == *id => {
                    return Err(invalid(id, "loop body must not be the loop itself"))
                }
                Some(_) => {}
            },
            NodeKind::Fanout(c) => {
                if !matches!(kind_of(&c.fanin), Some(NodeKind::Fanin(_))) {
                    return Err(invalid(id, format!("'{}' is not a fanin node", c.fanin)));
                }
                if let Some(other) = paired_fanins.insert(c.fanin.as_str(), id.as_str()) {
                    return Err(invalid(
                        id,
                        format!("fanin '{}' is already paired with fanout '{}'", c.fanin, other),
                    ));
                }
                for entry in &c.branches {
                    match kind_of(entry) {
                        None => {
                            return Err(invalid(id, format!("unknown branch node '{}'", entry)))
                        }
                        Some(NodeKind::Start | NodeKind::End | NodeKind::Fanin(_)) => {
                            return Err(invalid(
                                id,
                                format!("branch entry '{}' must be a working node", entry),
                            ))
                        }
                        Some(_) => {}
                    }
                }
            }
            _ => {}
        }
    }

    for id in order {
        if matches!(nodes[id].kind, NodeKind::Fanin(_)) && !paired_fanins.contains_key(id.as_str()) {
            return Err(invalid(id, "fanin is not paired with any fanout"));
        }
    }
    Ok(())
}

fn check_reachable_end(graph: &CompiledGraph) -> Result<(), CompilationError> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([graph.start.as_str()]);
    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        if graph.is_end(id) {
            return Ok(());
        }
        queue.extend(graph.successors(id));
    }
    Err(CompilationError::NoReachableEnd)
}

/// Every cycle must pass through a loop node: with loop nodes' exits cut,
/// the graph has to be acyclic.
fn check_cycles(graph: &CompiledGraph) -> Result<(), CompilationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Open,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for root in &graph.order {
        if marks.contains_key(root.as_str()) {
            continue;
        }
        // Iterative DFS: (node, successors, next index)
        let mut stack: Vec<(&str, Vec<&str>, usize)> = Vec::new();
        marks.insert(root.as_str(), Mark::Open);
        stack.push((root.as_str(), guarded_successors(graph, root), 0));

        while let Some((id, succ, idx)) = stack.last_mut() {
            if *idx < succ.len() {
                let next = succ[*idx];
                *idx += 1;
                match marks.get(next) {
                    Some(Mark::Open) => {
                        return Err(CompilationError::UnboundedCycle(next.to_string()))
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::Open);
                        let next_succ = guarded_successors(graph, next);
                        stack.push((next, next_succ, 0));
                    }
                }
            } else {
                marks.insert(*id, Mark::Done);
                stack.pop();
            }
        }
    }
    Ok(())
}

fn guarded_successors<'a>(graph: &'a CompiledGraph, id: &str) -> Vec<&'a str> {
    match graph.node(id).map(|n| &n.kind) {
        Some(NodeKind::Loop(_)) => vec![],
        _ => graph.successors(id),
    }
}

/// Walk each branch up to its fanin and reject what cannot run inside one.
fn check_branches(graph: &CompiledGraph) -> Result<HashMap<String, String>, CompilationError> {
    let mut scope = HashMap::new();

    for fanout in graph.nodes() {
        let NodeKind::Fanout(config) = &fanout.kind else {
            continue;
        };

        for entry in &config.branches {
            let mut reached_fanin = false;
            let mut visited = HashSet::new();
            let mut queue = VecDeque::from([entry.as_str()]);

            while let Some(id) = queue.pop_front() {
                if id == config.fanin {
                    reached_fanin = true;
                    continue;
                }
                if !visited.insert(id) {
                    continue;
                }
                let Some(node) = graph.node(id) else { continue };
                match &node.kind {
                    NodeKind::Approval(a) if a.tier.suspends() => {
                        return Err(invalid(
                            id,
                            format!(
                                "{} approval cannot run inside a branch of fanout '{}'",
                                a.tier, fanout.id
                            ),
                        ));
                    }
                    NodeKind::Fanout(_) => {
                        return Err(invalid(
                            id,
                            format!("nested fanout inside a branch of fanout '{}'", fanout.id),
                        ));
                    }
                    NodeKind::End | NodeKind::Start => {
                        return Err(invalid(
                            &fanout.id,
                            format!("branch '{}' reaches '{}' before its fanin", entry, id),
                        ));
                    }
                    NodeKind::Fanin(_) => {
                        return Err(invalid(
                            &fanout.id,
                            format!("branch '{}' reaches foreign fanin '{}'", entry, id),
                        ));
                    }
                    _ => {}
                }
                if let Some(owner) = scope.insert(id.to_string(), fanout.id.clone()) {
                    if owner != fanout.id {
                        return Err(invalid(
                            id,
                            format!("node is shared by fanouts '{}' and '{}'", owner, fanout.id),
                        ));
                    }
                }
                queue.extend(graph.successors(id));
            }

            if !reached_fanin {
                return Err(invalid(
                    &fanout.id,
                    format!("branch '{}' never reaches fanin '{}'", entry, config.fanin),
                ));
            }
        }
    }

    Ok(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wayline_core::definition::{EdgeSpec, NodeSpec, NodeType};
    use wayline_tools::ToolSpec;

    fn registry() -> ToolRegistry {
        let mut tools = ToolRegistry::with_builtins();
        for name in ["fetch_patient", "triage_classifier"] {
            tools.register(ToolSpec::new(name), |input| async move { Ok(input) });
        }
        tools
    }

    fn tool(id: &str, name: &str) -> NodeSpec {
        NodeSpec::new(id, NodeType::Tool).with_config(json!({ "tool": name }))
    }

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("triage", "1")
            .node(NodeSpec::new("start", NodeType::Start))
            .node(tool("fetch", "fetch_patient"))
            .node(NodeSpec::new("router", NodeType::Router).with_config(json!({
                "classifier": "triage_classifier",
                "candidates": ["specialist_a", "specialist_b"]
            })))
            .node(NodeSpec::new("end", NodeType::End))
            .edge(EdgeSpec::always("start", "fetch"))
            .edge(EdgeSpec::always("fetch", "router"))
            .edge(EdgeSpec::always("router", "end"))
    }

    #[test]
    fn compiles_well_formed_definition() {
        let graph = compile(&linear(), &registry()).unwrap();
        assert_eq!(graph.start, "start");
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.outgoing("fetch")[0].to, "router");
        assert!(graph.is_end("end"));
    }

    #[test]
    fn rejects_dangling_edge() {
        let def = linear().edge(EdgeSpec::always("fetch", "ghost"));
        let err = compile(&def, &registry()).unwrap_err();
        assert_eq!(
            err,
            CompilationError::DanglingEdge {
                source_node: "fetch".into(),
                target: "ghost".into(),
                missing: "ghost".into(),
            }
        );
    }

    #[test]
    fn rejects_unregistered_tool() {
        let mut def = linear();
        def.nodes[1] = tool("fetch", "fetch_patinet");
        let err = compile(&def, &registry()).unwrap_err();
        assert!(matches!(err, CompilationError::UnknownTool { ref tool, .. } if tool == "fetch_patinet"));
    }

    #[test]
    fn rejects_start_count_and_duplicates() {
        let mut def = linear();
        def.nodes.retain(|n| n.node_type != NodeType::Start);
        def.edges.retain(|e| e.source_node_id != "start");
        assert_eq!(compile(&def, &registry()).unwrap_err(), CompilationError::NoStartNode);

        let def = linear().node(NodeSpec::new("start", NodeType::Start));
        assert_eq!(
            compile(&def, &registry()).unwrap_err(),
            CompilationError::DuplicateNode("start".into())
        );

        let def = linear().node(NodeSpec::new("start2", NodeType::Start));
        assert_eq!(
            compile(&def, &registry()).unwrap_err(),
            CompilationError::MultipleStartNodes(2)
        );
    }

    #[test]
    fn rejects_unreachable_end() {
        let def = WorkflowDefinition::new("wf", "1")
            .node(NodeSpec::new("start", NodeType::Start))
            .node(tool("a", "echo"))
            .node(NodeSpec::new("end", NodeType::End))
            .edge(EdgeSpec::always("start", "a"))
            .edge(EdgeSpec::when("a", "start", "exists never"))
            .edge(EdgeSpec::always("a", "a"));
        // a -> a is an unguarded cycle, but reachability is checked first
        assert_eq!(compile(&def, &registry()).unwrap_err(), CompilationError::NoReachableEnd);
    }

    #[test]
    fn rejects_unguarded_cycle_but_accepts_loop() {
        let def = WorkflowDefinition::new("wf", "1")
            .node(NodeSpec::new("start", NodeType::Start))
            .node(tool("write", "echo"))
            .node(tool("review", "echo"))
            .node(NodeSpec::new("end", NodeType::End))
            .edge(EdgeSpec::always("start", "write"))
            .edge(EdgeSpec::always("write", "review"))
            .edge(EdgeSpec::when("review", "end", r#"verdict == "ok""#))
            .edge(EdgeSpec::always("review", "write"));
        assert!(matches!(
            compile(&def, &registry()).unwrap_err(),
            CompilationError::UnboundedCycle(_)
        ));

        let def = WorkflowDefinition::new("wf", "1")
            .node(NodeSpec::new("start", NodeType::Start))
            .node(NodeSpec::new("revise", NodeType::Loop).with_config(json!({
                "max_iterations": 3, "body": "write", "until": "verdict == \"ok\""
            })))
            .node(tool("write", "echo"))
            .node(tool("review", "echo"))
            .node(NodeSpec::new("end", NodeType::End))
            .edge(EdgeSpec::always("start", "revise"))
            .edge(EdgeSpec::always("write", "review"))
            .edge(EdgeSpec::always("review", "revise"))
            .edge(EdgeSpec::always("revise", "end"));
        compile(&def, &registry()).unwrap();
    }

    #[test]
    fn rejects_bad_condition_and_misplaced_fallback() {
        let def = linear().edge(EdgeSpec::when("router", "end", "severity ~ high"));
        assert!(matches!(
            compile(&def, &registry()).unwrap_err(),
            CompilationError::InvalidCondition { .. }
        ));

        let def = linear().edge(EdgeSpec::when("router", "fetch", "exists x"));
        assert_eq!(
            compile(&def, &registry()).unwrap_err(),
            CompilationError::MisplacedFallback("router".into())
        );
    }

    #[test]
    fn end_nodes_have_no_exits() {
        let def = linear().edge(EdgeSpec::always("end", "fetch"));
        assert_eq!(
            compile(&def, &registry()).unwrap_err(),
            CompilationError::EndHasOutgoing("end".into())
        );
    }

    fn fanout_def(branch_node: NodeSpec) -> WorkflowDefinition {
        WorkflowDefinition::new("fan", "1")
            .node(NodeSpec::new("start", NodeType::Start))
            .node(NodeSpec::new("split", NodeType::Fanout).with_config(json!({
                "branches": ["a", "b"], "fanin": "join"
            })))
            .node(tool("a", "echo"))
            .node(branch_node)
            .node(NodeSpec::new("join", NodeType::Fanin))
            .node(NodeSpec::new("end", NodeType::End))
            .edge(EdgeSpec::always("start", "split"))
            .edge(EdgeSpec::always("a", "join"))
            .edge(EdgeSpec::always("b", "join"))
            .edge(EdgeSpec::always("join", "end"))
    }

    #[test]
    fn fanout_branches_are_scoped() {
        let graph = compile(&fanout_def(tool("b", "echo")), &registry()).unwrap();
        assert_eq!(graph.enclosing_fanout("a"), Some("split"));
        assert_eq!(graph.enclosing_fanout("b"), Some("split"));
        assert_eq!(graph.enclosing_fanout("join"), None);
    }

    #[test]
    fn suspending_approval_rejected_inside_branch() {
        let gate = NodeSpec::new("b", NodeType::Approval).with_config(json!({"tier": "tier2"}));
        let err = compile(&fanout_def(gate), &registry()).unwrap_err();
        assert!(matches!(err, CompilationError::InvalidConfig { ref node_id, .. } if node_id == "b"));

        let gate = NodeSpec::new("b", NodeType::Approval).with_config(json!({"tier": "tier1"}));
        compile(&fanout_def(gate), &registry()).unwrap();
    }
}
