//! Engine statistics and the persisted `engine_state.json`

use crate::config::EvolutionConfig;
use crate::error::AppResult;
use crate::evolution::task::EvolutionTask;
use crate::snapshot::store::{read_json, write_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENGINE_STATE_FILE: &str = "engine_state.json";

/// Terminal task records kept in memory and in the state file
pub const TASK_HISTORY_LIMIT: usize = 100;

/// Running counters over the engine's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_rolled_back: u64,
    pub tasks_cancelled: u64,
    pub tasks_rejected: u64,
    pub files_generated: u64,
    pub changes_processed: u64,
}

/// Snapshot of engine state written on stop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    pub last_run: DateTime<Utc>,
    pub config: EvolutionConfig,
    pub stats: EngineStats,
    #[serde(default)]
    pub task_history: Vec<EvolutionTask>,
}

impl EngineState {
    pub async fn load(dir: &Path) -> AppResult<Option<Self>> {
        read_json(&dir.join(ENGINE_STATE_FILE)).await
    }

    pub async fn save(&self, dir: &Path) -> AppResult<()> {
        write_json(&dir.join(ENGINE_STATE_FILE), self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EngineState::load(dir.path()).await.unwrap().is_none());

        let state = EngineState {
            last_run: Utc::now(),
            config: EvolutionConfig::default(),
            stats: EngineStats {
                tasks_created: 3,
                tasks_completed: 2,
                tasks_failed: 1,
                ..EngineStats::default()
            },
            task_history: vec![EvolutionTask::new(vec![])],
        };
        state.save(dir.path()).await.unwrap();

        let loaded = EngineState::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.stats, state.stats);
        assert_eq!(loaded.task_history.len(), 1);
        assert_eq!(loaded.config.max_concurrent_evolutions, 1);
    }
}
