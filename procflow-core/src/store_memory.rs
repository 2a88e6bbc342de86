use crate::store::{ProcessStore, VersionConflict};
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    instances: HashMap<Uuid, ProcessInstance>,
    executions: HashMap<Uuid, Vec<ExecutionRecord>>,
}

/// In-memory store. Both tables sit behind one lock so a commit is atomic.
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        let tables = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(tables.instances.get(&id).cloned())
    }

    async fn commit(&self, instance: &ProcessInstance, records: &[ExecutionRecord]) -> Result<u64> {
        let mut tables = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let found = tables
            .instances
            .get(&instance.id)
            .map(|stored| stored.version)
            .unwrap_or(0);
        if found != instance.version {
            return Err(VersionConflict {
                instance_id: instance.id,
                expected: instance.version,
                found,
            }
            .into());
        }

        let mut stored = instance.clone();
        stored.version = found + 1;
        tables.instances.insert(stored.id, stored);
        tables
            .executions
            .entry(instance.id)
            .or_default()
            .extend(records.iter().cloned());
        Ok(found + 1)
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let mut tables = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        tables
            .executions
            .entry(record.instance_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn load_executions(&self, instance_id: Uuid) -> Result<Vec<ExecutionRecord>> {
        let tables = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(tables
            .executions
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_active_instances(
        &self,
        definition_id: Option<&str>,
    ) -> Result<Vec<ProcessInstance>> {
        let tables = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut found: Vec<ProcessInstance> = tables
            .instances
            .values()
            .filter(|i| i.is_active())
            .filter(|i| definition_id.map_or(true, |d| i.definition_id == d))
            .cloned()
            .collect();
        found.sort_by_key(|i| i.id);
        Ok(found)
    }

    async fn find_active_at_nodes(&self, node_ids: &[String]) -> Result<Vec<ProcessInstance>> {
        let tables = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut found: Vec<ProcessInstance> = tables
            .instances
            .values()
            .filter(|i| i.is_active())
            .filter(|i| i.current_nodes.iter().any(|n| node_ids.contains(n)))
            .cloned()
            .collect();
        found.sort_by_key(|i| i.id);
        Ok(found)
    }
}
