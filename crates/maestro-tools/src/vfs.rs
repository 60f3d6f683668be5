// Virtual Filesystem
// Sandboxed per-session file snapshot shared between tools and the session

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfsFileInfo {
    pub name: String,
    pub size: usize,
}

/// In-memory filename -> content map. Cloning shares the underlying store.
#[derive(Clone, Default)]
pub struct VirtualFs {
    files: Arc<RwLock<HashMap<String, String>>>,
}

impl VirtualFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(files: HashMap<String, String>) -> Self {
        Self {
            files: Arc::new(RwLock::new(files)),
        }
    }

    pub async fn write(&self, name: &str, content: &str) {
        self.files
            .write()
            .await
            .insert(name.to_string(), content.to_string());
    }

    pub async fn read(&self, name: &str) -> Option<String> {
        self.files.read().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.files.write().await.remove(name).is_some()
    }

    /// Names and sizes, sorted by name — the inventory handed to sub-agents.
    pub async fn inventory(&self) -> Vec<VfsFileInfo> {
        let mut entries = self
            .files
            .read()
            .await
            .iter()
            .map(|(name, content)| VfsFileInfo {
                name: name.clone(),
                size: content.len(),
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.files.read().await.clone()
    }
}
