use serde::{Deserialize, Serialize};

// ── Top-level DTO ──

/// Authoring form of a process definition, as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinitionDto {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeDto>,
    #[serde(default)]
    pub edges: Vec<EdgeDto>,
}

// ── Edge ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDto {
    /// Generated as `flow_<n>` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

// ── Node ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKindDto {
    Task,
    UserTask,
    ServiceTask,
    ScriptTask,
    BusinessRuleTask,
    SendTask,
    ReceiveTask,
    ManualTask,
    StartEvent,
    EndEvent,
    IntermediateCatchEvent,
    IntermediateThrowEvent,
    BoundaryEvent,
    ExclusiveGateway,
    InclusiveGateway,
    ParallelGateway,
    EventBasedGateway,
    SubProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDto {
    pub id: String,
    pub kind: NodeKindDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Id of the enclosing `SubProcess` node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_process: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerDto>,
    /// Event definition string, e.g. `TimerEventDefinition: Duration=PT1H`
    /// or `MessageEventDefinition: order-paid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

// ── Trigger ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDto {
    None,
    Message {
        name: String,
    },
    Signal {
        name: String,
    },
    /// Exactly one of the three must be set.
    Timer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cycle: Option<String>,
    },
    Conditional {
        condition: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Escalation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Compensation,
    Link {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Terminate,
}
