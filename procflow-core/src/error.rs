use crate::types::InstanceStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by orchestrator operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("process instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("node '{node_id}' is not current for instance {instance_id}")]
    NotCurrentNode { instance_id: Uuid, node_id: String },

    #[error("node '{node_id}' waits for a trigger and cannot be completed as a task")]
    NotCompletable { node_id: String },

    #[error("actor '{actor}' is not authorized for node '{node_id}'")]
    Unauthorized { node_id: String, actor: String },

    #[error("cannot {operation} an instance in status {from:?}")]
    InvalidTransition {
        from: InstanceStatus,
        operation: &'static str,
    },

    #[error("gateway '{gateway_id}' has no satisfied condition and no default edge")]
    NoViableBranch { gateway_id: String },

    #[error("unsupported trigger: {0}")]
    UnsupportedTrigger(String),

    #[error("malformed trigger spec '{spec}': {reason}")]
    MalformedTriggerSpec { spec: String, reason: String },

    #[error("invalid process graph: {0}")]
    InvalidGraph(String),

    #[error("advance of instance {instance_id} exceeded {limit} steps")]
    StepLimitExceeded { instance_id: Uuid, limit: usize },

    #[error("instance {0} was modified concurrently")]
    ConcurrentModification(Uuid),

    #[error("store: {0}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn malformed(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::MalformedTriggerSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
