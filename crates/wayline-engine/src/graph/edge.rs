use wayline_core::condition::Condition;
use wayline_core::state::State;

/// An outgoing edge with its condition parsed.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// `None` marks the unconditioned fallback, always declared last.
    pub condition: Option<Condition>,
}

impl Edge {
    pub fn matches(&self, state: &State) -> bool {
        self.condition.as_ref().map_or(true, |c| c.evaluate(state))
    }
}

/// First edge (in declared order) whose condition holds, or the fallback.
pub fn select<'a>(edges: &'a [Edge], state: &State) -> Option<&'a Edge> {
    edges.iter().find(|e| e.matches(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edge(to: &str, expr: Option<&str>) -> Edge {
        Edge {
            from: "src".into(),
            to: to.into(),
            condition: expr.map(|e| e.parse().unwrap()),
        }
    }

    #[test]
    fn first_match_in_declared_order() {
        let edges = vec![
            edge("a", Some(r#"kind == "x""#)),
            edge("b", Some(r#"kind contains "x""#)),
            edge("fallback", None),
        ];
        let state = State::from_value(json!({"kind": "x"}));
        assert_eq!(select(&edges, &state).unwrap().to, "a");

        let state = State::from_value(json!({"kind": "xy"}));
        assert_eq!(select(&edges, &state).unwrap().to, "b");

        let state = State::from_value(json!({"kind": "z"}));
        assert_eq!(select(&edges, &state).unwrap().to, "fallback");
    }

    #[test]
    fn no_match_without_fallback() {
        let edges = vec![edge("a", Some("exists flag"))];
        assert!(select(&edges, &State::new()).is_none());
    }
}
