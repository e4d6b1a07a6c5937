use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::paths::ProjectPaths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Directory of condition files (default: <data_dir>/conditions/<agent>)
    #[serde(default)]
    pub conditions_dir: Option<PathBuf>,

    /// Party leader, when known ahead of the first packets
    #[serde(default)]
    pub leader_id: Option<i64>,

    /// Party within the group this agent belongs to, starting at 1
    #[serde(default)]
    pub subgroup_index: Option<i64>,
}

impl AgentConfig {
    pub fn conditions_dir(&self, agent: &str) -> PathBuf {
        self.conditions_dir.clone().unwrap_or_else(|| {
            ProjectPaths::new("marionette")
                .map(|p| p.conditions_dir(agent))
                .unwrap_or_else(|| PathBuf::from(".conditions").join(agent))
        })
    }
}
