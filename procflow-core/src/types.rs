use crate::timer::TimerSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Process variables. Flat name → JSON value map, merged last-write-wins.
pub type Variables = BTreeMap<String, serde_json::Value>;

// ─── Node kinds ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    None,
    User,
    Service,
    Script,
    BusinessRule,
    Send,
    Receive,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Start,
    End,
    IntermediateCatch,
    IntermediateThrow,
    Boundary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayKind {
    Exclusive,
    Inclusive,
    Parallel,
    EventBased,
}

/// Flat classification of an event trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    None,
    Message,
    Signal,
    Timer,
    Conditional,
    Error,
    Escalation,
    Compensation,
    Link,
    Terminate,
}

/// Event trigger with its parsed payload. Resolved once when the graph is loaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Trigger {
    None,
    Message { name: String },
    Signal { name: String },
    Timer(TimerSpec),
    Conditional { expression: String },
    Error { code: Option<String> },
    Escalation { code: Option<String> },
    Compensation,
    Link { name: Option<String> },
    Terminate,
}

impl Trigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Trigger::None => TriggerType::None,
            Trigger::Message { .. } => TriggerType::Message,
            Trigger::Signal { .. } => TriggerType::Signal,
            Trigger::Timer(_) => TriggerType::Timer,
            Trigger::Conditional { .. } => TriggerType::Conditional,
            Trigger::Error { .. } => TriggerType::Error,
            Trigger::Escalation { .. } => TriggerType::Escalation,
            Trigger::Compensation => TriggerType::Compensation,
            Trigger::Link { .. } => TriggerType::Link,
            Trigger::Terminate => TriggerType::Terminate,
        }
    }

    /// Timer, message and signal triggers need an external occurrence.
    pub fn is_waitable(&self) -> bool {
        matches!(
            self,
            Trigger::Timer(_) | Trigger::Message { .. } | Trigger::Signal { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Task(TaskKind),
    Event { kind: EventKind, trigger: Trigger },
    Gateway(GatewayKind),
    SubProcessEntry,
}

// ─── Graph elements ───────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: NodeKind,
    /// Id of the enclosing sub-process entry, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_sub_process: Option<String>,
}

impl Node {
    pub fn task(id: impl Into<String>, kind: TaskKind) -> Self {
        Self::new(id, NodeKind::Task(kind))
    }

    pub fn event(id: impl Into<String>, kind: EventKind, trigger: Trigger) -> Self {
        Self::new(id, NodeKind::Event { kind, trigger })
    }

    pub fn gateway(id: impl Into<String>, kind: GatewayKind) -> Self {
        Self::new(id, NodeKind::Gateway(kind))
    }

    pub fn sub_process(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::SubProcessEntry)
    }

    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            owner_sub_process: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn inside(mut self, sub_process: impl Into<String>) -> Self {
        self.owner_sub_process = Some(sub_process.into());
        self
    }

    pub fn is_task(&self) -> bool {
        matches!(self.kind, NodeKind::Task(_))
    }

    pub fn gateway_kind(&self) -> Option<GatewayKind> {
        match self.kind {
            NodeKind::Gateway(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        match self.kind {
            NodeKind::Event { kind, .. } => Some(kind),
            _ => None,
        }
    }

    pub fn trigger(&self) -> Option<&Trigger> {
        match &self.kind {
            NodeKind::Event { trigger, .. } => Some(trigger),
            _ => None,
        }
    }

    /// A catching event (start, intermediate catch, boundary) with a timer,
    /// message or signal trigger.
    pub fn is_wait_event(&self) -> bool {
        match &self.kind {
            NodeKind::Event { kind, trigger } => {
                !matches!(kind, EventKind::End | EventKind::IntermediateThrow)
                    && trigger.is_waitable()
            }
            _ => false,
        }
    }

    /// Nodes a caller may complete: tasks, bare sub-process entries and
    /// untriggered events such as a plain start. Gateways and triggered events
    /// only advance through their trigger.
    pub fn is_completable(&self) -> bool {
        match &self.kind {
            NodeKind::Task(_) | NodeKind::SubProcessEntry => true,
            NodeKind::Event { trigger, .. } => *trigger == Trigger::None,
            NodeKind::Gateway(_) => false,
        }
    }

    /// Wait events and receive tasks may be armed behind an event-based gateway.
    pub fn can_arm_race(&self) -> bool {
        self.is_wait_event() || matches!(self.kind, NodeKind::Task(TaskKind::Receive))
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A sequence flow. Declaration order within the graph is significant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Blank conditions count as absent.
    pub fn is_conditioned(&self) -> bool {
        self.condition
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}

// ─── Instance ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Active,
    Suspended,
    Completed,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Terminated)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_id: String,
    pub graph_fingerprint: [u8; 32],
    pub business_key: Option<String>,
    pub initiator: String,
    pub status: InstanceStatus,
    /// One entry per live token, in arrival order.
    pub current_nodes: Vec<String>,
    /// Join gateway id → ids of incoming edges that have delivered a token.
    #[serde(default)]
    pub join_arrivals: BTreeMap<String, BTreeSet<String>>,
    pub variables: Variables,
    /// Optimistic version, bumped by every commit.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    /// First live token, if any.
    pub fn current_node_id(&self) -> Option<&str> {
        self.current_nodes.first().map(String::as_str)
    }

    pub fn is_at(&self, node_id: &str) -> bool {
        self.current_nodes.iter().any(|n| n == node_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    pub fn merge_variables(&mut self, incoming: &Variables) {
        for (k, v) in incoming {
            self.variables.insert(k.clone(), v.clone());
        }
    }

    /// Enter a terminal status: tokens and pending joins are dropped.
    pub(crate) fn close(&mut self, status: InstanceStatus, at: DateTime<Utc>) {
        self.status = status;
        self.current_nodes.clear();
        self.join_arrivals.clear();
        self.ended_at = Some(at);
    }

    /// Remove one token at `node_id`. Returns false when no token sits there.
    pub(crate) fn take_token(&mut self, node_id: &str) -> bool {
        match self.current_nodes.iter().position(|n| n == node_id) {
            Some(pos) => {
                self.current_nodes.remove(pos);
                true
            }
            None => false,
        }
    }
}

// ─── Execution records ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Skipped,
}

/// Append-only audit entry, one per advancement step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub node_name: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub actor: String,
    pub result: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_variables: Variables,
}

impl ExecutionRecord {
    pub fn new(
        instance_id: Uuid,
        node: &Node,
        status: ExecutionStatus,
        actor: &str,
        result: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            instance_id,
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            status,
            started_at: now,
            ended_at: now,
            actor: actor.to_string(),
            result: result.into(),
            input_variables: Variables::new(),
        }
    }

    pub fn with_input(mut self, variables: &Variables) -> Self {
        self.input_variables = variables.clone();
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = at;
        self
    }
}

// ─── Actors ───────────────────────────────────────────────────

/// Caller identity presented to the authorization check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wait_event_classification() {
        let timer = Node::event(
            "t",
            EventKind::IntermediateCatch,
            Trigger::Timer(TimerSpec::Duration(Duration::from_secs(1))),
        );
        assert!(timer.is_wait_event());

        let throw = Node::event(
            "s",
            EventKind::IntermediateThrow,
            Trigger::Signal { name: "go".into() },
        );
        assert!(!throw.is_wait_event());

        let start = Node::event("start", EventKind::Start, Trigger::None);
        assert!(!start.is_wait_event());

        assert!(Node::task("r", TaskKind::Receive).can_arm_race());
        assert!(!Node::task("u", TaskKind::User).can_arm_race());
    }

    #[test]
    fn test_blank_condition_is_unconditioned() {
        assert!(!Edge::new("e", "a", "b").is_conditioned());
        assert!(!Edge::new("e", "a", "b").when("   ").is_conditioned());
        assert!(Edge::new("e", "a", "b").when("x > 1").is_conditioned());
    }

    #[test]
    fn test_take_token_removes_single_entry() {
        let now = Utc::now();
        let mut instance = ProcessInstance {
            id: Uuid::now_v7(),
            definition_id: "d".into(),
            graph_fingerprint: [0u8; 32],
            business_key: None,
            initiator: "u".into(),
            status: InstanceStatus::Active,
            current_nodes: vec!["a".into(), "b".into(), "a".into()],
            join_arrivals: BTreeMap::new(),
            variables: Variables::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: now,
            ended_at: None,
        };
        assert!(instance.take_token("a"));
        assert_eq!(instance.current_nodes, vec!["b", "a"]);
        assert!(!instance.take_token("zzz"));
        assert_eq!(instance.current_node_id(), Some("b"));
    }
}
