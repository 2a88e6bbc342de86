use crate::definition::load_graph_yaml;
use crate::graph::ProcessGraph;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Source of process graphs by definition id.
#[async_trait]
pub trait GraphProvider: Send + Sync {
    async fn load_graph(&self, definition_id: &str) -> Result<Option<Arc<ProcessGraph>>>;
}

/// Graphs registered in code.
#[derive(Default)]
pub struct MemoryGraphProvider {
    graphs: RwLock<HashMap<String, Arc<ProcessGraph>>>,
}

impl MemoryGraphProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a graph under its own id.
    pub fn register(&self, graph: ProcessGraph) -> Result<Arc<ProcessGraph>> {
        let graph = Arc::new(graph);
        self.graphs
            .write()
            .map_err(|e| anyhow!("Lock: {}", e))?
            .insert(graph.id().to_string(), graph.clone());
        Ok(graph)
    }
}

#[async_trait]
impl GraphProvider for MemoryGraphProvider {
    async fn load_graph(&self, definition_id: &str) -> Result<Option<Arc<ProcessGraph>>> {
        let graphs = self.graphs.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(graphs.get(definition_id).cloned())
    }
}

/// Reads `<dir>/<definition_id>.yaml` on first use and caches the result.
pub struct DirectoryGraphProvider {
    dir: PathBuf,
    cache: MemoryGraphProvider,
}

impl DirectoryGraphProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: MemoryGraphProvider::new(),
        }
    }
}

#[async_trait]
impl GraphProvider for DirectoryGraphProvider {
    async fn load_graph(&self, definition_id: &str) -> Result<Option<Arc<ProcessGraph>>> {
        if let Some(graph) = self.cache.load_graph(definition_id).await? {
            return Ok(Some(graph));
        }
        // Ids map straight to file names.
        if definition_id.contains(['/', '\\']) || definition_id.starts_with('.') {
            return Ok(None);
        }

        let path = self.dir.join(format!("{definition_id}.yaml"));
        let yaml = match tokio::fs::read_to_string(&path).await {
            Ok(yaml) => yaml,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let graph = load_graph_yaml(&yaml)
            .with_context(|| format!("Invalid definition {}", path.display()))?;
        if graph.id() != definition_id {
            return Err(anyhow!(
                "{} declares id '{}', expected '{}'",
                path.display(),
                graph.id(),
                definition_id
            ));
        }
        tracing::info!(definition_id, path = %path.display(), "Loaded process definition");
        self.cache.register(graph).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Node, TaskKind};

    #[tokio::test]
    async fn test_memory_provider_register_and_load() {
        let provider = MemoryGraphProvider::new();
        let graph =
            ProcessGraph::new("p", None, vec![Node::task("t", TaskKind::User)], vec![]).unwrap();
        provider.register(graph).unwrap();
        assert!(provider.load_graph("p").await.unwrap().is_some());
        assert!(provider.load_graph("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_provider_reads_yaml() {
        let dir = std::env::temp_dir().join(format!("procflow-defs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("simple.yaml"),
            "id: simple\nnodes:\n  - kind: UserTask\n    id: only\n",
        )
        .unwrap();
        std::fs::write(dir.join("renamed.yaml"), "id: other\nnodes: []\n").unwrap();

        let provider = DirectoryGraphProvider::new(&dir);
        let graph = provider.load_graph("simple").await.unwrap().unwrap();
        assert_eq!(graph.nodes().len(), 1);
        assert!(provider.load_graph("absent").await.unwrap().is_none());
        assert!(provider.load_graph("../simple").await.unwrap().is_none());
        assert!(provider.load_graph("renamed").await.is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
