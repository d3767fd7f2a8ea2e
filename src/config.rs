use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use streambed_core::{NodeId, StreamId};
use streambed_replication::ReplicationConfig;
use streambed_storage::LogConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node ID.
    pub node_id: NodeId,

    /// Root of this node's stream data directories.
    pub data_dir: PathBuf,

    /// Commit log settings.
    pub log: LogConfig,

    /// Replication engine settings.
    pub replication: ReplicationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            data_dir: PathBuf::from("./data"),
            log: LogConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// On-disk directory for one stream replica.
    pub fn stream_dir(&self, id: &StreamId) -> PathBuf {
        self.data_dir
            .join("streams")
            .join(&id.subject)
            .join(&id.name)
    }
}
