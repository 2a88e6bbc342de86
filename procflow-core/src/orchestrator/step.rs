//! One advancement step over an in-memory copy of an instance.
//!
//! Tokens move through the graph until each one rests at a task, a wait
//! event or an event race. Nothing here touches the store or the trigger
//! registry: the step collects execution records and registry [`Effect`]s,
//! and the orchestrator applies them only once the new snapshot has committed.

use crate::condition::ConditionEvaluator;
use crate::error::{EngineError, EngineResult};
use crate::gateway::{GatewayResolver, Resolution};
use crate::graph::ProcessGraph;
use crate::types::*;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Registry work produced by a step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    RegisterTimer {
        node_id: String,
        fire_at: DateTime<Utc>,
        race: Option<String>,
    },
    SubscribeMessage {
        node_id: String,
        name: String,
        race: Option<String>,
    },
    SubscribeSignal {
        node_id: String,
        name: String,
        race: Option<String>,
    },
    CancelRace {
        race: String,
    },
    /// Triggers a wait node armed for a token that has now left it.
    CancelNode {
        node_id: String,
    },
    CancelAll,
    // Published after the instance lock is released.
    PublishSignal {
        name: String,
    },
    PublishMessage {
        name: String,
    },
}

/// Result of a finished step, ready to commit.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub(crate) instance: ProcessInstance,
    pub(crate) records: Vec<ExecutionRecord>,
    pub(crate) effects: Vec<Effect>,
}

impl Outcome {
    pub(crate) fn new(instance: ProcessInstance, effects: Vec<Effect>) -> Self {
        Self {
            instance,
            records: Vec::new(),
            effects,
        }
    }
}

#[derive(Debug)]
struct Arrival {
    node_id: String,
    via: Option<String>,
}

pub(crate) struct Step<'a> {
    graph: &'a ProcessGraph,
    resolver: &'a GatewayResolver,
    conditions: ConditionEvaluator,
    actor: &'a str,
    max_steps: usize,
    visited: usize,
    queue: VecDeque<Arrival>,
    pub(crate) instance: ProcessInstance,
    records: Vec<ExecutionRecord>,
    effects: Vec<Effect>,
}

impl<'a> Step<'a> {
    pub(crate) fn new(
        graph: &'a ProcessGraph,
        resolver: &'a GatewayResolver,
        conditions: ConditionEvaluator,
        actor: &'a str,
        max_steps: usize,
        instance: ProcessInstance,
    ) -> Self {
        Self {
            graph,
            resolver,
            conditions,
            actor,
            max_steps,
            visited: 0,
            queue: VecDeque::new(),
            instance,
            records: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> Outcome {
        Outcome {
            instance: self.instance,
            records: self.records,
            effects: self.effects,
        }
    }

    pub(crate) fn push_record(&mut self, record: ExecutionRecord) {
        self.records.push(record);
    }

    fn record(&mut self, node: &Node, status: ExecutionStatus, result: impl Into<String>) {
        let record = ExecutionRecord::new(self.instance.id, node, status, self.actor, result);
        self.records.push(record);
    }

    // ── Entry points ──

    /// Place the first token on the start node, arming it when it waits for a trigger.
    pub(crate) fn enter(&mut self, start: &'a Node) -> EngineResult<()> {
        self.park(start);
        if start.is_wait_event() {
            self.arm(start, None)?;
        }
        Ok(())
    }

    /// Consume the token at `node` and advance from it.
    pub(crate) fn advance_from(&mut self, node: &'a Node) -> EngineResult<()> {
        self.consume(&node.id)?;
        if node.is_wait_event() && !self.instance.is_at(&node.id) {
            self.effects.push(Effect::CancelNode {
                node_id: node.id.clone(),
            });
        }
        self.leave(&node.id)?;
        self.run()
    }

    /// `winner` fired first among the arms of the event-based `gateway`.
    pub(crate) fn win_race(&mut self, gateway: &'a Node, winner: &'a Node) -> EngineResult<()> {
        let graph = self.graph;
        self.consume(&gateway.id)?;
        self.record(
            gateway,
            ExecutionStatus::Completed,
            format!("race won by {}", winner.id),
        );
        for arm in graph.outgoing(&gateway.id) {
            if arm.target != winner.id {
                let loser = graph.require(&arm.target)?;
                self.record(
                    loser,
                    ExecutionStatus::Skipped,
                    format!("race lost to {}", winner.id),
                );
            }
        }
        self.effects.push(Effect::CancelRace {
            race: gateway.id.clone(),
        });
        self.leave(&winner.id)?;
        self.run()
    }

    /// Re-register waits whose trigger is gone, e.g. a timer spent while suspended.
    pub(crate) fn rearm(&mut self, armed: &HashSet<String>) -> EngineResult<()> {
        let graph = self.graph;
        let tokens = self.instance.current_nodes.clone();
        for node_id in &tokens {
            let node = graph.require(node_id)?;
            if node.gateway_kind() == Some(GatewayKind::EventBased) {
                for arm in graph.outgoing(&node.id) {
                    if !armed.contains(&arm.target) {
                        self.arm(graph.require(&arm.target)?, Some(node.id.clone()))?;
                    }
                }
            } else if node.is_wait_event() && !armed.contains(&node.id) {
                self.arm(node, None)?;
            }
        }
        Ok(())
    }

    // ── Token movement ──

    fn consume(&mut self, node_id: &str) -> EngineResult<()> {
        if self.instance.take_token(node_id) {
            Ok(())
        } else {
            Err(EngineError::NotCurrentNode {
                instance_id: self.instance.id,
                node_id: node_id.to_string(),
            })
        }
    }

    fn park(&mut self, node: &Node) {
        tracing::trace!(instance_id = %self.instance.id, node_id = %node.id, "token parked");
        self.instance.current_nodes.push(node.id.clone());
    }

    fn push(&mut self, edge: &Edge) {
        self.queue.push_back(Arrival {
            node_id: edge.target.clone(),
            via: Some(edge.id.clone()),
        });
    }

    /// Send the token that just left `node_id` along its outgoing edges.
    ///
    /// Several edges out of a non-gateway node go through the first gateway
    /// among their targets, or else the first edge.
    fn leave(&mut self, node_id: &str) -> EngineResult<()> {
        let graph = self.graph;
        let outgoing = graph.outgoing(node_id);
        let next = match outgoing.as_slice() {
            [] => return self.end_branch(node_id),
            [only] => *only,
            many => {
                let via_gateway = many.iter().copied().find(|e| {
                    graph
                        .node(&e.target)
                        .is_some_and(|n| n.gateway_kind().is_some())
                });
                via_gateway.unwrap_or_else(|| {
                    tracing::debug!(
                        instance_id = %self.instance.id,
                        node_id,
                        edges = many.len(),
                        "several outgoing edges and no gateway; taking the first"
                    );
                    many[0]
                })
            }
        };
        self.push(next);
        Ok(())
    }

    fn run(&mut self) -> EngineResult<()> {
        loop {
            while let Some(arrival) = self.queue.pop_front() {
                if !self.instance.is_active() {
                    self.queue.clear();
                    break;
                }
                self.visited += 1;
                if self.visited > self.max_steps {
                    return Err(EngineError::StepLimitExceeded {
                        instance_id: self.instance.id,
                        limit: self.max_steps,
                    });
                }
                self.arrive(arrival)?;
            }
            if !self.instance.is_active() || !self.release_inclusive_join()? {
                break;
            }
        }
        self.complete_if_done();
        Ok(())
    }

    fn arrive(&mut self, arrival: Arrival) -> EngineResult<()> {
        let graph = self.graph;
        let node = graph.require(&arrival.node_id)?;
        match &node.kind {
            NodeKind::Gateway(kind) => self.arrive_at_gateway(node, *kind, arrival.via),
            NodeKind::Task(_) => {
                self.park(node);
                Ok(())
            }
            NodeKind::SubProcessEntry => match graph.sub_process_start(&node.id) {
                Some(start) => {
                    self.record(node, ExecutionStatus::Completed, "sub-process entered");
                    self.queue.push_back(Arrival {
                        node_id: start.id.clone(),
                        via: None,
                    });
                    Ok(())
                }
                None => {
                    self.park(node);
                    Ok(())
                }
            },
            NodeKind::Event { kind, trigger } => self.arrive_at_event(node, *kind, trigger),
        }
    }

    fn arrive_at_event(
        &mut self,
        node: &'a Node,
        kind: EventKind,
        trigger: &Trigger,
    ) -> EngineResult<()> {
        match kind {
            EventKind::End => {
                if *trigger == Trigger::Terminate {
                    self.terminate(node);
                    return Ok(());
                }
                self.throw(trigger);
                self.record(node, ExecutionStatus::Completed, "end reached");
                self.end_branch(&node.id)
            }
            EventKind::IntermediateThrow => {
                self.throw(trigger);
                self.record(node, ExecutionStatus::Completed, "event thrown");
                self.leave(&node.id)
            }
            EventKind::Start | EventKind::IntermediateCatch | EventKind::Boundary => {
                if node.is_wait_event() {
                    self.park(node);
                    return self.arm(node, None);
                }
                if let Trigger::Conditional { expression } = trigger {
                    if !self.conditions.evaluate(Some(expression), &self.instance.variables) {
                        self.park(node);
                        return Ok(());
                    }
                }
                self.record(node, ExecutionStatus::Completed, "event passed");
                self.leave(&node.id)
            }
        }
    }

    fn throw(&mut self, trigger: &Trigger) {
        match trigger {
            Trigger::Signal { name } => {
                self.effects.push(Effect::PublishSignal { name: name.clone() })
            }
            Trigger::Message { name } => {
                self.effects.push(Effect::PublishMessage { name: name.clone() })
            }
            _ => {}
        }
    }

    fn terminate(&mut self, node: &Node) {
        self.record(node, ExecutionStatus::Completed, "terminated");
        self.queue.clear();
        self.instance.close(InstanceStatus::Terminated, Utc::now());
        self.effects.push(Effect::CancelAll);
    }

    /// Register the trigger a waiting node needs. `race` ties it to an event-based gateway.
    fn arm(&mut self, node: &Node, race: Option<String>) -> EngineResult<()> {
        let node_id = node.id.clone();
        match node.trigger() {
            Some(Trigger::Timer(spec)) => {
                // Cyclic or out-of-range timers fail here, before anything commits.
                let fire_at = spec.fire_at(Utc::now())?;
                self.effects.push(Effect::RegisterTimer {
                    node_id,
                    fire_at,
                    race,
                });
            }
            Some(Trigger::Message { name }) => self.effects.push(Effect::SubscribeMessage {
                node_id,
                name: name.clone(),
                race,
            }),
            Some(Trigger::Signal { name }) => self.effects.push(Effect::SubscribeSignal {
                node_id,
                name: name.clone(),
                race,
            }),
            // Receive tasks and untriggered nodes wait for an explicit trigger_event.
            _ => {}
        }
        Ok(())
    }

    // ── Gateways ──

    fn arrive_at_gateway(
        &mut self,
        node: &'a Node,
        kind: GatewayKind,
        via: Option<String>,
    ) -> EngineResult<()> {
        if self.graph.is_join(node) {
            if let Some(edge_id) = via {
                self.instance
                    .join_arrivals
                    .entry(node.id.clone())
                    .or_default()
                    .insert(edge_id);
            }
            if !self.join_ready(node, kind) {
                tracing::debug!(
                    instance_id = %self.instance.id,
                    gateway_id = %node.id,
                    "join waiting"
                );
                return Ok(());
            }
            self.instance.join_arrivals.remove(&node.id);
        }
        self.fire_gateway(node, kind)
    }

    /// Parallel joins need every incoming edge. Inclusive joins also fire once
    /// no live token can still reach them.
    fn join_ready(&self, node: &Node, kind: GatewayKind) -> bool {
        let arrived = self
            .instance
            .join_arrivals
            .get(&node.id)
            .map_or(0, BTreeSet::len);
        if arrived >= self.graph.incoming(&node.id).len() {
            return true;
        }
        kind == GatewayKind::Inclusive && arrived > 0 && !self.token_can_reach(&node.id)
    }

    fn token_can_reach(&self, target: &str) -> bool {
        self.instance
            .current_nodes
            .iter()
            .chain(self.queue.iter().map(|a| &a.node_id))
            .any(|n| self.graph.can_reach(n, target))
    }

    fn release_inclusive_join(&mut self) -> EngineResult<bool> {
        let graph = self.graph;
        let ready = self
            .instance
            .join_arrivals
            .keys()
            .filter_map(|id| graph.node(id))
            .find(|n| {
                n.gateway_kind() == Some(GatewayKind::Inclusive)
                    && self.join_ready(n, GatewayKind::Inclusive)
            });
        let Some(node) = ready else {
            return Ok(false);
        };
        self.instance.join_arrivals.remove(&node.id);
        self.fire_gateway(node, GatewayKind::Inclusive)?;
        Ok(true)
    }

    fn fire_gateway(&mut self, node: &'a Node, kind: GatewayKind) -> EngineResult<()> {
        let graph = self.graph;
        let outgoing = graph.outgoing(&node.id);
        if outgoing.is_empty() {
            self.record(node, ExecutionStatus::Completed, "gateway passed");
            return self.end_branch(&node.id);
        }

        let resolution = self
            .resolver
            .resolve(&node.id, kind, &outgoing, &self.instance.variables)?;
        match resolution {
            Resolution::Take(edges) => {
                let taken: Vec<&str> = edges.iter().map(|e| e.id.as_str()).collect();
                self.record(
                    node,
                    ExecutionStatus::Completed,
                    format!("took {}", taken.join(", ")),
                );
                for edge in edges {
                    self.push(edge);
                }
            }
            Resolution::Race(arms) => {
                self.park(node);
                for arm in &arms {
                    self.arm(graph.require(&arm.target)?, Some(node.id.clone()))?;
                }
                tracing::debug!(
                    instance_id = %self.instance.id,
                    gateway_id = %node.id,
                    arms = arms.len(),
                    "event race armed"
                );
            }
        }
        Ok(())
    }

    // ── Completion ──

    /// A token ended at `node_id`. The enclosing sub-process completes with its last token.
    fn end_branch(&mut self, node_id: &str) -> EngineResult<()> {
        let graph = self.graph;
        let Some(entry_id) = graph
            .node(node_id)
            .and_then(|n| n.owner_sub_process.as_deref())
        else {
            return Ok(());
        };
        let still_inside = self
            .instance
            .current_nodes
            .iter()
            .chain(self.queue.iter().map(|a| &a.node_id))
            .any(|n| graph.is_inside(n, entry_id));
        if still_inside {
            return Ok(());
        }
        let entry = graph.require(entry_id)?;
        self.record(entry, ExecutionStatus::Completed, "sub-process completed");
        self.leave(&entry.id)
    }

    fn complete_if_done(&mut self) {
        if !self.instance.is_active() || !self.instance.current_nodes.is_empty() {
            return;
        }
        if !self.instance.join_arrivals.is_empty() {
            tracing::warn!(
                instance_id = %self.instance.id,
                joins = ?self.instance.join_arrivals.keys().collect::<Vec<_>>(),
                "no tokens left; dropping unsatisfied joins"
            );
        }
        self.instance.close(InstanceStatus::Completed, Utc::now());
        self.effects.push(Effect::CancelAll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerSpec;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn instance(graph: &ProcessGraph, at: &[&str], variables: Variables) -> ProcessInstance {
        let now = Utc::now();
        ProcessInstance {
            id: Uuid::now_v7(),
            definition_id: graph.id().to_string(),
            graph_fingerprint: graph.fingerprint(),
            business_key: Some("order-1".into()),
            initiator: "tester".into(),
            status: InstanceStatus::Active,
            current_nodes: at.iter().map(|s| s.to_string()).collect(),
            join_arrivals: BTreeMap::new(),
            variables,
            version: 1,
            created_at: now,
            updated_at: now,
            started_at: now,
            ended_at: None,
        }
    }

    fn advance(
        graph: &ProcessGraph,
        at: &[&str],
        from: &str,
        variables: Variables,
    ) -> EngineResult<Outcome> {
        let resolver = GatewayResolver::default();
        let mut step = Step::new(
            graph,
            &resolver,
            ConditionEvaluator::new(),
            "tester",
            100,
            instance(graph, at, variables),
        );
        step.advance_from(graph.node(from).unwrap())?;
        Ok(step.finish())
    }

    fn vars(v: serde_json::Value) -> Variables {
        serde_json::from_value(v).unwrap()
    }

    fn parallel_graph() -> ProcessGraph {
        ProcessGraph::new(
            "par",
            None,
            vec![
                Node::task("a", TaskKind::User),
                Node::gateway("fork", GatewayKind::Parallel),
                Node::task("left", TaskKind::User),
                Node::task("right", TaskKind::User),
                Node::gateway("join", GatewayKind::Parallel),
                Node::task("after", TaskKind::User),
            ],
            vec![
                Edge::new("e1", "a", "fork"),
                Edge::new("e2", "fork", "left"),
                Edge::new("e3", "fork", "right"),
                Edge::new("e4", "left", "join"),
                Edge::new("e5", "right", "join"),
                Edge::new("e6", "join", "after"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parallel_fork_and_join() {
        let graph = parallel_graph();
        let forked = advance(&graph, &["a"], "a", Variables::new()).unwrap();
        assert_eq!(forked.instance.current_nodes, vec!["left", "right"]);

        let resolver = GatewayResolver::default();
        let mut step = Step::new(
            &graph,
            &resolver,
            ConditionEvaluator::new(),
            "t",
            100,
            forked.instance,
        );
        step.advance_from(graph.node("left").unwrap()).unwrap();
        assert_eq!(step.instance.current_nodes, vec!["right"]);
        assert!(step.instance.join_arrivals["join"].contains("e4"));

        step.advance_from(graph.node("right").unwrap()).unwrap();
        assert_eq!(step.instance.current_nodes, vec!["after"]);
        assert!(step.instance.join_arrivals.is_empty());
    }

    #[test]
    fn test_inclusive_join_waits_only_for_live_branches() {
        let graph = ProcessGraph::new(
            "incl",
            None,
            vec![
                Node::task("a", TaskKind::User),
                Node::gateway("split", GatewayKind::Inclusive),
                Node::task("x", TaskKind::User),
                Node::task("y", TaskKind::User),
                Node::gateway("merge", GatewayKind::Inclusive),
                Node::task("done", TaskKind::User),
            ],
            vec![
                Edge::new("s1", "a", "split"),
                Edge::new("s2", "split", "x").when("wantX == true"),
                Edge::new("s3", "split", "y").when("wantY == true"),
                Edge::new("s4", "x", "merge"),
                Edge::new("s5", "y", "merge"),
                Edge::new("s6", "merge", "done"),
            ],
        )
        .unwrap();

        let only_x = vars(json!({"wantX": true, "wantY": false}));
        let one = advance(&graph, &["a"], "a", only_x).unwrap();
        assert_eq!(one.instance.current_nodes, vec!["x"]);
        let merged = advance(&graph, &["x"], "x", Variables::new()).unwrap();
        assert_eq!(merged.instance.current_nodes, vec!["done"]);

        let resolver = GatewayResolver::default();
        let x_and_y = vars(json!({"wantX": true, "wantY": true}));
        let both = advance(&graph, &["a"], "a", x_and_y).unwrap();
        let mut step = Step::new(
            &graph,
            &resolver,
            ConditionEvaluator::new(),
            "t",
            100,
            both.instance,
        );
        step.advance_from(graph.node("x").unwrap()).unwrap();
        assert_eq!(step.instance.current_nodes, vec!["y"]);
        step.advance_from(graph.node("y").unwrap()).unwrap();
        assert_eq!(step.instance.current_nodes, vec!["done"]);
    }

    #[test]
    fn test_terminate_end_closes_instance() {
        let graph = ProcessGraph::new(
            "term",
            None,
            vec![
                Node::task("a", TaskKind::User),
                Node::task("other", TaskKind::User),
                Node::event("kill", EventKind::End, Trigger::Terminate),
            ],
            vec![Edge::new("e1", "a", "kill")],
        )
        .unwrap();
        let out = advance(&graph, &["a", "other"], "a", Variables::new()).unwrap();
        assert_eq!(out.instance.status, InstanceStatus::Terminated);
        assert!(out.instance.current_nodes.is_empty());
        assert!(out.instance.ended_at.is_some());
        assert_eq!(out.effects, vec![Effect::CancelAll]);
    }

    #[test]
    fn test_wait_event_parks_and_throw_publishes() {
        let graph = ProcessGraph::new(
            "wait",
            None,
            vec![
                Node::task("a", TaskKind::User),
                Node::event(
                    "announce",
                    EventKind::IntermediateThrow,
                    Trigger::Signal {
                        name: "ready".into(),
                    },
                ),
                Node::event(
                    "pause",
                    EventKind::IntermediateCatch,
                    Trigger::Timer(TimerSpec::Duration(Duration::from_secs(5))),
                ),
                Node::task("b", TaskKind::User),
            ],
            vec![
                Edge::new("e1", "a", "announce"),
                Edge::new("e2", "announce", "pause"),
                Edge::new("e3", "pause", "b"),
            ],
        )
        .unwrap();
        let before = Utc::now();
        let out = advance(&graph, &["a"], "a", Variables::new()).unwrap();
        assert_eq!(out.instance.current_nodes, vec!["pause"]);
        assert_eq!(out.effects.len(), 2);
        assert_eq!(
            out.effects[0],
            Effect::PublishSignal {
                name: "ready".into()
            }
        );
        match &out.effects[1] {
            Effect::RegisterTimer {
                node_id,
                fire_at,
                race: None,
            } => {
                assert_eq!(node_id, "pause");
                assert!(*fire_at >= before + chrono::Duration::seconds(5));
                assert!(*fire_at <= Utc::now() + chrono::Duration::seconds(5));
            }
            other => panic!("expected a timer registration, got {other:?}"),
        }
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].node_id, "announce");
    }

    #[test]
    fn test_cyclic_timer_fails_before_commit() {
        let graph = ProcessGraph::new(
            "cycle",
            None,
            vec![
                Node::task("a", TaskKind::User),
                Node::event(
                    "tick",
                    EventKind::IntermediateCatch,
                    Trigger::Timer(TimerSpec::Cycle("R3/PT1M".into())),
                ),
            ],
            vec![Edge::new("e1", "a", "tick")],
        )
        .unwrap();
        assert!(matches!(
            advance(&graph, &["a"], "a", Variables::new()),
            Err(EngineError::UnsupportedTrigger(_))
        ));
    }

    #[test]
    fn test_sub_process_runs_nested_flow_then_continues() {
        let graph = ProcessGraph::new(
            "sub",
            None,
            vec![
                Node::task("a", TaskKind::User),
                Node::sub_process("review"),
                Node::event("r_start", EventKind::Start, Trigger::None).inside("review"),
                Node::task("r_check", TaskKind::User).inside("review"),
                Node::event("r_end", EventKind::End, Trigger::None).inside("review"),
                Node::task("after", TaskKind::User),
            ],
            vec![
                Edge::new("e1", "a", "review"),
                Edge::new("e2", "r_start", "r_check"),
                Edge::new("e3", "r_check", "r_end"),
                Edge::new("e4", "review", "after"),
            ],
        )
        .unwrap();
        let entered = advance(&graph, &["a"], "a", Variables::new()).unwrap();
        assert_eq!(entered.instance.current_nodes, vec!["r_check"]);

        let left = advance(&graph, &["r_check"], "r_check", Variables::new()).unwrap();
        assert_eq!(left.instance.current_nodes, vec!["after"]);
        let results: Vec<&str> = left.records.iter().map(|r| r.result.as_str()).collect();
        assert_eq!(results, vec!["end reached", "sub-process completed"]);
    }

    #[test]
    fn test_step_limit_on_pass_through_cycle() {
        let graph = ProcessGraph::new(
            "spin",
            None,
            vec![
                Node::task("a", TaskKind::User),
                Node::gateway("g1", GatewayKind::Exclusive),
                Node::gateway("g2", GatewayKind::Exclusive),
            ],
            vec![
                Edge::new("e1", "a", "g1"),
                Edge::new("e2", "g1", "g2"),
                Edge::new("e3", "g2", "g1"),
            ],
        )
        .unwrap();
        assert!(matches!(
            advance(&graph, &["a"], "a", Variables::new()),
            Err(EngineError::StepLimitExceeded { limit: 100, .. })
        ));
    }

    #[test]
    fn test_event_race_arms_every_branch() {
        let graph = ProcessGraph::new(
            "race",
            None,
            vec![
                Node::task("a", TaskKind::User),
                Node::gateway("race", GatewayKind::EventBased),
                Node::event(
                    "paid",
                    EventKind::IntermediateCatch,
                    Trigger::Message {
                        name: "paid".into(),
                    },
                ),
                Node::event(
                    "timeout",
                    EventKind::IntermediateCatch,
                    Trigger::Timer(TimerSpec::Duration(Duration::from_secs(60))),
                ),
                Node::task("ship", TaskKind::User),
                Node::task("cancel", TaskKind::User),
            ],
            vec![
                Edge::new("e1", "a", "race"),
                Edge::new("e2", "race", "paid"),
                Edge::new("e3", "race", "timeout"),
                Edge::new("e4", "paid", "ship"),
                Edge::new("e5", "timeout", "cancel"),
            ],
        )
        .unwrap();
        let armed = advance(&graph, &["a"], "a", Variables::new()).unwrap();
        assert_eq!(armed.instance.current_nodes, vec!["race"]);
        assert_eq!(armed.effects.len(), 2);
        assert!(armed.effects.iter().all(|e| matches!(
            e,
            Effect::SubscribeMessage { race: Some(r), .. }
                | Effect::RegisterTimer { race: Some(r), .. } if r == "race"
        )));

        let resolver = GatewayResolver::default();
        let mut step = Step::new(
            &graph,
            &resolver,
            ConditionEvaluator::new(),
            "t",
            100,
            armed.instance,
        );
        step.win_race(graph.node("race").unwrap(), graph.node("paid").unwrap())
            .unwrap();
        let won = step.finish();
        assert_eq!(won.instance.current_nodes, vec!["ship"]);
        assert_eq!(won.effects, vec![Effect::CancelRace { race: "race".into() }]);
        let skipped: Vec<&str> = won
            .records
            .iter()
            .filter(|r| r.status == ExecutionStatus::Skipped)
            .map(|r| r.node_id.as_str())
            .collect();
        assert_eq!(skipped, vec!["timeout"]);
    }

    fn looping_wait_graph() -> ProcessGraph {
        ProcessGraph::new(
            "loop",
            None,
            vec![
                Node::task("a", TaskKind::User),
                Node::event(
                    "wait",
                    EventKind::IntermediateCatch,
                    Trigger::Timer(TimerSpec::Duration(Duration::from_secs(3600))),
                ),
                Node::gateway("again", GatewayKind::Exclusive),
                Node::task("b", TaskKind::User),
            ],
            vec![
                Edge::new("e1", "a", "wait"),
                Edge::new("e2", "wait", "again"),
                Edge::new("e3", "again", "wait").when("repeat == true"),
                Edge::new("e4", "again", "b"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_leaving_wait_event_cancels_its_trigger() {
        let graph = looping_wait_graph();
        let out = advance(&graph, &["wait"], "wait", Variables::new()).unwrap();
        assert_eq!(out.instance.current_nodes, vec!["b"]);
        assert_eq!(
            out.effects,
            vec![Effect::CancelNode {
                node_id: "wait".into()
            }]
        );

        // Re-entering the same wait cancels the old trigger before arming a new one.
        let again = advance(&graph, &["wait"], "wait", vars(json!({"repeat": true}))).unwrap();
        assert_eq!(again.instance.current_nodes, vec!["wait"]);
        assert_eq!(again.effects.len(), 2);
        assert_eq!(
            again.effects[0],
            Effect::CancelNode {
                node_id: "wait".into()
            }
        );
        assert!(matches!(
            &again.effects[1],
            Effect::RegisterTimer { node_id, race: None, .. } if node_id == "wait"
        ));
    }

    #[test]
    fn test_wait_keeps_trigger_while_a_token_remains() {
        let graph = looping_wait_graph();
        let out = advance(&graph, &["wait", "wait"], "wait", Variables::new()).unwrap();
        assert_eq!(out.instance.current_nodes, vec!["wait", "b"]);
        assert!(out.effects.is_empty());
    }

    #[test]
    fn test_out_of_range_timer_fails_before_commit() {
        let graph = ProcessGraph::new(
            "far",
            None,
            vec![
                Node::task("a", TaskKind::User),
                Node::event(
                    "never",
                    EventKind::IntermediateCatch,
                    Trigger::Timer(TimerSpec::duration("P100000000D").unwrap()),
                ),
            ],
            vec![Edge::new("e1", "a", "never")],
        )
        .unwrap();
        assert!(matches!(
            advance(&graph, &["a"], "a", Variables::new()),
            Err(EngineError::MalformedTriggerSpec { .. })
        ));
    }
}
