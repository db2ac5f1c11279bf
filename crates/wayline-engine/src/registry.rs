use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use wayline_core::error::{CompilationError, Result, WaylineError};

use crate::graph::CompiledGraph;

/// Compiled workflows keyed by `(id, version)`.
///
/// A version is immutable once registered: re-registering identical content is
/// a no-op, different content under the same version is rejected.
#[derive(Default)]
pub struct DefinitionRegistry {
    graphs: RwLock<BTreeMap<(String, String), Arc<CompiledGraph>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, graph: CompiledGraph) -> Result<Arc<CompiledGraph>> {
        let key = (graph.id.clone(), graph.version.clone());
        let mut graphs = self
            .graphs
            .write()
            .map_err(|e| WaylineError::Config(format!("definition registry poisoned: {}", e)))?;

        if let Some(existing) = graphs.get(&key) {
            if existing.definition() == graph.definition() {
                return Ok(existing.clone());
            }
            return Err(CompilationError::VersionConflict {
                id: key.0,
                version: key.1,
            }
            .into());
        }

        info!(definition = %key.0, version = %key.1, nodes = graph.node_count(), "Registered workflow");
        let graph = Arc::new(graph);
        graphs.insert(key, graph.clone());
        Ok(graph)
    }

    pub fn get(&self, id: &str, version: &str) -> Result<Arc<CompiledGraph>> {
        self.graphs
            .read()
            .ok()
            .and_then(|g| g.get(&(id.to_string(), version.to_string())).cloned())
            .ok_or_else(|| WaylineError::DefinitionNotFound {
                id: id.to_string(),
                version: version.to_string(),
            })
    }

    /// All registered graphs, ordered by id then version.
    pub fn list(&self) -> Vec<Arc<CompiledGraph>> {
        self.graphs
            .read()
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.graphs.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
