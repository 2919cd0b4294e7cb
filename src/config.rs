use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Commit `lorebook create` proposals as soon as they arrive instead of
    /// staging them for review. Later entry proposals in the same turn
    /// usually target the new lorebook.
    pub auto_approve_lorebooks: bool,
    /// How long intake waits on an event channel before re-checking its
    /// abort signal.
    pub intake_poll_ms: u64,
    /// Drop approved and rejected changes from the live list after
    /// `approve_all`. They stay resolvable by id.
    pub clear_settled_after_approve_all: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_approve_lorebooks: true,
            intake_poll_ms: 50,
            clear_settled_after_approve_all: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn intake_poll_interval(&self) -> Duration {
        Duration::from_millis(self.intake_poll_ms.max(1))
    }
}
