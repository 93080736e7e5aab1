//! C9: snapshots the full `Loop` after every state-changing step. Built on
//! `ralph_store`, whose SQLite index plus append-only JSONL shards give us
//! "load returns every non-deleted loop's most recent snapshot" for free
//! via `Store::query`.

use std::path::Path;
use std::sync::Arc;

use ralph_store::{IndexValue, Record, Store, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{Loop, LoopConfig, LoopState};
use crate::state_machine::LoopStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSnapshot {
    pub config: LoopConfig,
    pub state: LoopState,
}

impl From<&Loop> for LoopSnapshot {
    fn from(value: &Loop) -> Self {
        Self { config: value.config.clone(), state: value.state.clone() }
    }
}

impl From<LoopSnapshot> for Loop {
    fn from(mut value: LoopSnapshot) -> Self {
        value.state.restore_bounded_caps();
        Self { config: value.config, state: value.state }
    }
}

impl Record for LoopSnapshot {
    fn kind() -> &'static str {
        "loop_snapshot"
    }

    fn id(&self) -> String {
        self.config.id.clone()
    }

    fn index_fields(&self) -> Vec<(&'static str, IndexValue)> {
        vec![
            ("status", IndexValue::Text(self.state.status.as_str().to_string())),
            ("workspace_id", IndexValue::Text(self.config.workspace_id.clone())),
        ]
    }
}

/// Thin wrapper so the engine/manager never import `ralph_store` directly —
/// the concrete store is an implementation detail of this module.
pub struct Persistence {
    store: Arc<Store>,
}

impl Persistence {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        debug!(root = %root.display(), "Persistence::open: called");
        let store = Store::open(root)?;
        store.rebuild_indexes::<LoopSnapshot>()?;
        Ok(Self { store: Arc::new(store) })
    }

    /// Logged and swallowed by the engine's caller, never propagated into
    /// an iteration — a failed snapshot write must not fail the loop.
    pub fn save_loop_state(&self, snapshot: &LoopSnapshot) {
        if let Err(error) = self.store.put(snapshot) {
            warn!(loop_id = %snapshot.config.id, %error, "save_loop_state: failed to persist snapshot");
        }
    }

    pub fn delete(&self, loop_id: &str) {
        if let Err(error) = self.store.delete::<LoopSnapshot>(loop_id) {
            warn!(loop_id, %error, "delete: failed to mark snapshot deleted");
        }
    }

    pub fn load(&self, loop_id: &str) -> Result<Option<LoopSnapshot>, StoreError> {
        self.store.get::<LoopSnapshot>(loop_id)
    }

    /// Every non-deleted loop's most recent snapshot, regardless of status.
    pub fn load_all(&self) -> Result<Vec<LoopSnapshot>, StoreError> {
        self.store.query::<LoopSnapshot>(&[])
    }

    pub fn load_active(&self) -> Result<Vec<LoopSnapshot>, StoreError> {
        Ok(self.load_all()?.into_iter().filter(|s| active_status(&s.state.status)).collect())
    }
}

fn active_status(status: &LoopStatus) -> bool {
    status.is_active()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GitConfig, Mode, ModelConfig};
    use std::path::PathBuf;

    fn sample_config(id: &str) -> LoopConfig {
        LoopConfig {
            id: id.to_string(),
            name: "demo".to_string(),
            workspace_id: "ws-1".to_string(),
            directory: PathBuf::from("/tmp/repo"),
            prompt: "do the thing".to_string(),
            model: ModelConfig { provider_id: "anthropic".to_string(), model_id: "claude".to_string(), variant: None },
            stop_pattern: crate::domain::DEFAULT_STOP_PATTERN.to_string(),
            git: GitConfig::default(),
            max_iterations: Some(5),
            max_consecutive_errors: Some(3),
            activity_timeout_seconds: 120,
            clear_planning_folder: false,
            plan_mode: false,
            mode: Mode::Loop,
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::open(dir.path()).unwrap();
        let loop_value = Loop::new(sample_config("loop-1"));
        let snapshot = LoopSnapshot::from(&loop_value);
        persistence.save_loop_state(&snapshot);

        let loaded = persistence.load("loop-1").unwrap().unwrap();
        assert_eq!(loaded.config.id, "loop-1");
        assert_eq!(loaded.state.status, LoopStatus::Idle);
    }

    #[test]
    fn delete_hides_from_load_all() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::open(dir.path()).unwrap();
        persistence.save_loop_state(&LoopSnapshot::from(&Loop::new(sample_config("loop-1"))));
        persistence.delete("loop-1");
        assert!(persistence.load_all().unwrap().is_empty());
    }

    #[test]
    fn load_active_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::open(dir.path()).unwrap();
        let mut running = Loop::new(sample_config("loop-running"));
        running.state.status = LoopStatus::Running;
        persistence.save_loop_state(&LoopSnapshot::from(&running));
        persistence.save_loop_state(&LoopSnapshot::from(&Loop::new(sample_config("loop-idle"))));

        let active = persistence.load_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].config.id, "loop-running");
    }
}
