use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Returned (inside `anyhow::Error`) when a commit's expected version is stale.
#[derive(Debug, Clone, Error)]
#[error("instance {instance_id}: expected version {expected}, found {found}")]
pub struct VersionConflict {
    pub instance_id: Uuid,
    pub expected: u64,
    pub found: u64,
}

/// Persistence for instances and their execution history.
///
/// The orchestrator only talks to storage through this trait. `commit` is the
/// single write path for advancement: the instance snapshot and the records of
/// the step land together or not at all.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Instance ──

    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>>;

    /// Persist `instance` and append `records` atomically.
    ///
    /// `instance.version` is the version the caller loaded (0 for a new
    /// instance). A mismatch fails with [`VersionConflict`]. Returns the new
    /// version.
    async fn commit(&self, instance: &ProcessInstance, records: &[ExecutionRecord]) -> Result<u64>;

    // ── Execution records ──

    /// Append a record outside of a commit (failure records).
    async fn append_execution(&self, record: &ExecutionRecord) -> Result<()>;
    async fn load_executions(&self, instance_id: Uuid) -> Result<Vec<ExecutionRecord>>;

    // ── Queries ──

    /// Active instances, optionally restricted to one definition.
    async fn find_active_instances(
        &self,
        definition_id: Option<&str>,
    ) -> Result<Vec<ProcessInstance>>;

    /// Active instances holding a token at any of `node_ids`.
    async fn find_active_at_nodes(&self, node_ids: &[String]) -> Result<Vec<ProcessInstance>>;
}
