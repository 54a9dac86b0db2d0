//! Monitor groups
//!
//! Named sets of monitors used by the web layer to arrange live views.
//! One JSON file per group under `<configDir>/groups/`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// One group definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConfig {
    pub id: String,
    pub name: String,
    /// Member monitor ids.
    #[serde(default)]
    pub monitors: Vec<String>,
}

/// File-backed group store.
pub struct GroupManager {
    dir: PathBuf,
    groups: RwLock<HashMap<String, GroupConfig>>,
}

impl GroupManager {
    /// Load every group config from `dir`.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let mut groups = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read(&path)?;
            let config: GroupConfig = serde_json::from_slice(&raw)
                .map_err(|e| Error::Fatal(format!("corrupt group config {}: {e}", path.display())))?;
            groups.insert(config.id.clone(), config);
        }
        Ok(Self {
            dir,
            groups: RwLock::new(groups),
        })
    }

    pub async fn configs(&self) -> Vec<GroupConfig> {
        let mut out: Vec<GroupConfig> = self.groups.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn set(&self, config: GroupConfig) -> Result<()> {
        if config.id.is_empty() || !config.id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Validation(format!("invalid group id: {}", config.id)));
        }
        let path = self.dir.join(format!("{}.json", config.id));
        let tmp = self.dir.join(format!("{}.json.tmp", config.id));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&config)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        self.groups.write().await.insert(config.id.clone(), config);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.groups.write().await.remove(id).is_none() {
            return Err(Error::NotFound(format!("group: {id}")));
        }
        tokio::fs::remove_file(self.dir.join(format!("{id}.json"))).await?;
        Ok(())
    }
}
