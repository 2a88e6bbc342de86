use crate::condition::ConditionEvaluator;
use crate::error::{EngineError, EngineResult};
use crate::types::{Edge, GatewayKind, Variables};

/// Outcome of resolving a gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<'g> {
    /// Follow these edges now.
    Take(Vec<&'g Edge>),
    /// Nothing is taken yet: the targets of these edges race and the first
    /// trigger to fire decides the branch.
    Race(Vec<&'g Edge>),
}

impl<'g> Resolution<'g> {
    /// Edges selected for immediate traversal.
    pub fn selected(&self) -> &[&'g Edge] {
        match self {
            Resolution::Take(edges) => edges,
            Resolution::Race(_) => &[],
        }
    }
}

/// Decides which outgoing edges of a gateway become active.
#[derive(Debug, Clone, Default)]
pub struct GatewayResolver {
    conditions: ConditionEvaluator,
}

impl GatewayResolver {
    pub fn new(conditions: ConditionEvaluator) -> Self {
        Self { conditions }
    }

    pub fn resolve<'g>(
        &self,
        gateway_id: &str,
        kind: GatewayKind,
        outgoing: &[&'g Edge],
        variables: &Variables,
    ) -> EngineResult<Resolution<'g>> {
        match kind {
            GatewayKind::Parallel => Ok(Resolution::Take(outgoing.to_vec())),
            GatewayKind::EventBased => Ok(Resolution::Race(outgoing.to_vec())),
            GatewayKind::Exclusive => self.exclusive(gateway_id, outgoing, variables),
            GatewayKind::Inclusive => self.inclusive(gateway_id, outgoing, variables),
        }
    }

    fn exclusive<'g>(
        &self,
        gateway_id: &str,
        outgoing: &[&'g Edge],
        variables: &Variables,
    ) -> EngineResult<Resolution<'g>> {
        let default = default_edge(outgoing);
        let first_match = outgoing
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != default)
            .find(|(_, edge)| self.holds(gateway_id, edge, variables))
            .map(|(_, edge)| *edge);

        match first_match.or_else(|| default.map(|i| outgoing[i])) {
            Some(edge) => Ok(Resolution::Take(vec![edge])),
            None => Err(no_viable_branch(gateway_id)),
        }
    }

    fn inclusive<'g>(
        &self,
        gateway_id: &str,
        outgoing: &[&'g Edge],
        variables: &Variables,
    ) -> EngineResult<Resolution<'g>> {
        let default = default_edge(outgoing);
        let selected: Vec<&'g Edge> = outgoing
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != default)
            .filter(|(_, edge)| self.holds(gateway_id, edge, variables))
            .map(|(_, edge)| *edge)
            .collect();

        if !selected.is_empty() {
            return Ok(Resolution::Take(selected));
        }
        match default {
            Some(i) => Ok(Resolution::Take(vec![outgoing[i]])),
            None => Err(no_viable_branch(gateway_id)),
        }
    }

    /// Unconditioned non-default edges always hold. Evaluation errors do not.
    fn holds(&self, gateway_id: &str, edge: &Edge, variables: &Variables) -> bool {
        match self
            .conditions
            .try_evaluate(edge.condition.as_deref(), variables)
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    gateway_id,
                    edge_id = %edge.id,
                    condition = edge.condition.as_deref().unwrap_or_default(),
                    error = %e,
                    "edge condition could not be evaluated; treating as false"
                );
                false
            }
        }
    }
}

/// Index of the first unconditioned edge.
fn default_edge(outgoing: &[&Edge]) -> Option<usize> {
    outgoing.iter().position(|e| !e.is_conditioned())
}

fn no_viable_branch(gateway_id: &str) -> EngineError {
    EngineError::NoViableBranch {
        gateway_id: gateway_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn vars(v: serde_json::Value) -> Variables {
        serde_json::from_value(v).unwrap()
    }

    fn ids(resolution: &Resolution<'_>) -> Vec<String> {
        resolution.selected().iter().map(|e| e.id.clone()).collect()
    }

    fn resolve<'a>(
        kind: GatewayKind,
        edges: &'a [Edge],
        v: &Variables,
    ) -> EngineResult<Resolution<'a>> {
        let refs: Vec<&Edge> = edges.iter().collect();
        GatewayResolver::default().resolve("gw", kind, &refs, v)
    }

    #[test]
    fn test_exclusive_first_match_beats_default_anywhere() {
        let v = vars(json!({"x": 5}));
        let layouts = [
            vec![
                Edge::new("c1", "gw", "a").when("x > 10"),
                Edge::new("c2", "gw", "b").when("x > 1"),
                Edge::new("d", "gw", "c"),
            ],
            vec![
                Edge::new("d", "gw", "c"),
                Edge::new("c1", "gw", "a").when("x > 10"),
                Edge::new("c2", "gw", "b").when("x > 1"),
            ],
            vec![
                Edge::new("c1", "gw", "a").when("x > 10"),
                Edge::new("d", "gw", "c"),
                Edge::new("c2", "gw", "b").when("x > 1"),
            ],
        ];
        for edges in layouts {
            let r = resolve(GatewayKind::Exclusive, &edges, &v).unwrap();
            assert_eq!(ids(&r), vec!["c2"]);
        }
    }

    #[test]
    fn test_exclusive_falls_back_to_default() {
        let edges = vec![
            Edge::new("hi", "gw", "a").when("amount > 100"),
            Edge::new("lo", "gw", "b"),
        ];
        let r = resolve(GatewayKind::Exclusive, &edges, &vars(json!({"amount": 50}))).unwrap();
        assert_eq!(ids(&r), vec!["lo"]);
        let r = resolve(GatewayKind::Exclusive, &edges, &vars(json!({"amount": 200}))).unwrap();
        assert_eq!(ids(&r), vec!["hi"]);
    }

    #[test]
    fn test_exclusive_without_match_or_default_fails() {
        let edges = vec![
            Edge::new("a", "gw", "a").when("x == 1"),
            Edge::new("b", "gw", "b").when("missing > 0"),
        ];
        let err = resolve(GatewayKind::Exclusive, &edges, &vars(json!({"x": 2}))).unwrap_err();
        assert!(matches!(err, EngineError::NoViableBranch { gateway_id } if gateway_id == "gw"));
    }

    #[test]
    fn test_exclusive_extra_unconditioned_edge_is_always_true() {
        let edges = vec![
            Edge::new("d", "gw", "a"),
            Edge::new("c", "gw", "b").when("false"),
            Edge::new("u", "gw", "c"),
        ];
        let r = resolve(GatewayKind::Exclusive, &edges, &Variables::new()).unwrap();
        assert_eq!(ids(&r), vec!["u"]);
    }

    #[test]
    fn test_event_based_selects_nothing() {
        let edges = vec![Edge::new("a", "gw", "t1"), Edge::new("b", "gw", "m1")];
        let r = resolve(GatewayKind::EventBased, &edges, &Variables::new()).unwrap();
        assert!(r.selected().is_empty());
        assert!(matches!(r, Resolution::Race(arms) if arms.len() == 2));
    }

    #[test]
    fn test_parallel_ignores_conditions() {
        let edges = vec![
            Edge::new("a", "gw", "a").when("false"),
            Edge::new("b", "gw", "b").when("not even parseable ((("),
        ];
        let r = resolve(GatewayKind::Parallel, &edges, &Variables::new()).unwrap();
        assert_eq!(ids(&r), vec!["a", "b"]);
    }

    fn flagged_edges(flags: &[bool], default_at: Option<usize>) -> Vec<Edge> {
        let mut edges: Vec<Edge> = flags
            .iter()
            .enumerate()
            .map(|(i, f)| Edge::new(format!("e{i}"), "gw", format!("t{i}")).when(f.to_string()))
            .collect();
        if let Some(pos) = default_at {
            edges.insert(pos.min(edges.len()), Edge::new("default", "gw", "fallback"));
        }
        edges
    }

    proptest! {
        #[test]
        fn prop_inclusive_is_exactly_the_true_edges(
            flags in prop::collection::vec(any::<bool>(), 0..8),
            default_at in prop::option::of(0usize..9),
        ) {
            let edges = flagged_edges(&flags, default_at);
            let expected: Vec<String> = flags
                .iter()
                .enumerate()
                .filter(|(_, f)| **f)
                .map(|(i, _)| format!("e{i}"))
                .collect();
            match resolve(GatewayKind::Inclusive, &edges, &Variables::new()) {
                Ok(r) if !expected.is_empty() => {
                    prop_assert_eq!(ids(&r), expected);
                }
                Ok(r) => {
                    prop_assert!(default_at.is_some());
                    prop_assert_eq!(ids(&r), vec!["default".to_string()]);
                }
                Err(_) => {
                    prop_assert!(expected.is_empty() && default_at.is_none());
                }
            }
        }

        #[test]
        fn prop_exclusive_takes_first_true_edge(
            flags in prop::collection::vec(any::<bool>(), 0..8),
            default_at in prop::option::of(0usize..9),
        ) {
            let edges = flagged_edges(&flags, default_at);
            let first_true = flags.iter().position(|f| *f).map(|i| format!("e{i}"));
            match (resolve(GatewayKind::Exclusive, &edges, &Variables::new()), first_true) {
                (Ok(r), Some(id)) => {
                    prop_assert_eq!(ids(&r), vec![id]);
                }
                (Ok(r), None) => {
                    prop_assert_eq!(ids(&r), vec!["default".to_string()]);
                }
                (Err(_), first) => {
                    prop_assert!(first.is_none() && default_at.is_none());
                }
            }
        }

        #[test]
        fn prop_parallel_takes_everything(n in 0usize..8) {
            let edges: Vec<Edge> = (0..n)
                .map(|i| Edge::new(format!("e{i}"), "gw", format!("t{i}")).when("false"))
                .collect();
            let r = resolve(GatewayKind::Parallel, &edges, &Variables::new()).unwrap();
            prop_assert_eq!(r.selected().len(), n);
        }
    }
}
