//! C8: owns the set of live `LoopEngine`s and the persistence boundary.
//! Creates/restores loops, routes every control command the CLI exposes,
//! and runs the base-branch-sync-before-push flow (§4.7) that the engine
//! itself has no opinion about — pushing is a cross-loop, repo-wide
//! concern, not something a single iteration driver should own.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};

use crate::agent::AgentBackend;
use crate::command::CommandExecutor;
use crate::domain::{GitState, Loop, LoopConfig, ModelConfig};
use crate::events::EventBus;
use crate::git::{GitError, GitService};
use crate::persistence::{LoopSnapshot, Persistence};
use crate::state_machine::LoopStatus;

use super::engine::{LoopEngine, LoopEngineError};

const REMOTE: &str = "origin";
const CONFLICT_RESOLUTION_PROMPT: &str =
    "Resolve the merge conflicts left in the working tree from the base-branch merge, then stage the resolution \
     and finish the work. When the conflicts are fully resolved, end your response with <promise>COMPLETE</promise>";

#[derive(Debug, Error)]
pub enum LoopManagerError {
    #[error("loop {0} not found")]
    NotFound(String),
    #[error("max concurrent loops ({0}) reached")]
    ConcurrencyLimitReached(usize),
    #[error("push requires status completed or max_iterations, got {0}")]
    NotReadyToPush(LoopStatus),
    #[error("loop {0} has no git state to push")]
    NoGitState(String),
    #[error(transparent)]
    Engine(#[from] LoopEngineError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Store(#[from] ralph_store::StoreError),
}

#[derive(Debug, Clone)]
pub struct LoopManagerConfig {
    pub max_concurrent_loops: usize,
}

impl Default for LoopManagerConfig {
    fn default() -> Self {
        Self { max_concurrent_loops: 10 }
    }
}

pub struct LoopManager {
    config: LoopManagerConfig,
    git: Arc<GitService>,
    executor: Arc<dyn CommandExecutor>,
    backend: Arc<dyn AgentBackend>,
    bus: Arc<EventBus>,
    persistence: Arc<Persistence>,
    engines: AsyncMutex<HashMap<String, LoopEngine>>,
}

impl LoopManager {
    pub fn new(
        config: LoopManagerConfig,
        git: Arc<GitService>,
        executor: Arc<dyn CommandExecutor>,
        backend: Arc<dyn AgentBackend>,
        bus: Arc<EventBus>,
        persistence: Arc<Persistence>,
    ) -> Self {
        Self { config, git, executor, backend, bus, persistence, engines: AsyncMutex::new(HashMap::new()) }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn build_engine(&self, data: Loop) -> LoopEngine {
        let persistence = self.persistence.clone();
        LoopEngine::new(data, self.git.clone(), self.executor.clone(), self.backend.clone(), self.bus.clone())
            .with_persist_callback(Arc::new(move |loop_data: &Loop| {
                persistence.save_loop_state(&LoopSnapshot::from(loop_data));
            }))
    }

    /// Rehydrates every non-`deleted` loop's most recent snapshot into a
    /// live (but not started) engine, so `list`/`show`/control commands work
    /// immediately after a process restart. Does not resume execution —
    /// a loop left `running` when the process died comes back exactly as
    /// it was snapshotted; the user re-issues `start` to resume it.
    pub async fn restore(&self) -> Result<usize, LoopManagerError> {
        let snapshots = self.persistence.load_all()?;
        let mut engines = self.engines.lock().await;
        let mut restored = 0;
        for snapshot in snapshots {
            if engines.contains_key(&snapshot.config.id) {
                continue;
            }
            let loop_id = snapshot.config.id.clone();
            let engine = self.build_engine(Loop::from(snapshot));
            engines.insert(loop_id, engine);
            restored += 1;
        }
        info!(restored, "restore: rehydrated loops from persistence");
        Ok(restored)
    }

    pub async fn create_loop(&self, config: LoopConfig) -> String {
        let loop_id = config.id.clone();
        let data = Loop::new(config);
        self.persistence.save_loop_state(&LoopSnapshot::from(&data));
        let engine = self.build_engine(data);
        self.engines.lock().await.insert(loop_id.clone(), engine);
        loop_id
    }

    async fn engine(&self, loop_id: &str) -> Result<LoopEngine, LoopManagerError> {
        self.engines.lock().await.get(loop_id).cloned().ok_or_else(|| LoopManagerError::NotFound(loop_id.to_string()))
    }

    async fn active_count(&self) -> usize {
        let engines = self.engines.lock().await;
        let mut count = 0;
        for engine in engines.values() {
            if engine.snapshot().await.state.status.is_active() {
                count += 1;
            }
        }
        count
    }

    /// Spawns the engine's `start()` as a background task — `start()` does
    /// not return until the loop goes inactive, so the caller (the CLI
    /// command handler) must not await it directly.
    pub async fn start(&self, loop_id: &str) -> Result<(), LoopManagerError> {
        let engine = self.engine(loop_id).await?;
        if self.active_count().await >= self.config.max_concurrent_loops {
            return Err(LoopManagerError::ConcurrencyLimitReached(self.config.max_concurrent_loops));
        }
        let loop_id = loop_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = engine.start().await {
                error!(loop_id = %loop_id, %error, "start: loop exited with error");
            }
        });
        Ok(())
    }

    pub async fn stop(&self, loop_id: &str, reason: impl Into<String>) -> Result<(), LoopManagerError> {
        let engine = self.engine(loop_id).await?;
        engine.stop(reason).await?;
        Ok(())
    }

    pub async fn inject(&self, loop_id: &str, message: Option<String>, model: Option<ModelConfig>) -> Result<(), LoopManagerError> {
        let engine = self.engine(loop_id).await?;
        engine.inject_pending_now(message, model).await?;
        Ok(())
    }

    /// Promotes a `draft`/`planning` loop out of plan mode: sets up the git
    /// branch the way `start()` would have, then resumes iterating in the
    /// background with `planMode.active` cleared.
    pub async fn accept_plan(&self, loop_id: &str) -> Result<(), LoopManagerError> {
        let engine = self.engine(loop_id).await?;
        engine.setup_git_branch_for_plan_acceptance().await?;
        tokio::spawn(async move {
            engine.continue_execution().await;
        });
        Ok(())
    }

    pub async fn delete(&self, loop_id: &str) -> Result<(), LoopManagerError> {
        let engine = self.engine(loop_id).await?;
        engine.mark_deleted().await?;
        self.engines.lock().await.remove(loop_id);
        self.persistence.delete(loop_id);
        Ok(())
    }

    pub async fn list(&self) -> Vec<Loop> {
        let engines = self.engines.lock().await;
        let mut out = Vec::with_capacity(engines.len());
        for engine in engines.values() {
            out.push(engine.snapshot().await);
        }
        out
    }

    pub async fn show(&self, loop_id: &str) -> Result<Loop, LoopManagerError> {
        let engine = self.engine(loop_id).await?;
        Ok(engine.snapshot().await)
    }

    /// Triggered by a user's "push" request once a loop is `completed` or
    /// `max_iterations` (§4.7's base-branch-sync-before-push flow). Runs in
    /// the background: the caller only learns about preflight rejections
    /// (wrong status, no git state yet) synchronously, everything else is
    /// reported over the event bus.
    pub async fn push(&self, loop_id: &str) -> Result<(), LoopManagerError> {
        let engine = self.engine(loop_id).await?;
        let data = engine.snapshot().await;
        if !matches!(data.state.status, LoopStatus::Completed | LoopStatus::MaxIterations) {
            return Err(LoopManagerError::NotReadyToPush(data.state.status));
        }
        let git_state = data.state.git.clone().ok_or_else(|| LoopManagerError::NoGitState(loop_id.to_string()))?;
        let base_branch = data.config.git.base_branch.clone().unwrap_or_else(|| git_state.original_branch.clone());
        let git = self.git.clone();
        let loop_id_owned = loop_id.to_string();

        tokio::spawn(async move {
            if let Err(error) = run_push_sync(&engine, &git, &git_state, &base_branch).await {
                error!(loop_id = %loop_id_owned, %error, "push: sync failed");
            }
        });
        Ok(())
    }
}

async fn run_push_sync(
    engine: &LoopEngine,
    git: &GitService,
    git_state: &GitState,
    base_branch: &str,
) -> Result<(), LoopManagerError> {
    let worktree_path = git_state.worktree_path.as_path();
    let branch = git_state.working_branch.as_str();

    engine.emit_sync_started();
    git.fetch(worktree_path, REMOTE).await?;
    let remote_base = format!("{REMOTE}/{base_branch}");

    let already_contains = git.is_ancestor(worktree_path, &remote_base, "HEAD").await.unwrap_or(false);
    if !already_contains {
        let outcome = git
            .merge_with_conflict_detection(worktree_path, &remote_base, Some(&format!("Merge {remote_base} into {branch}")))
            .await?;
        if outcome.has_conflicts {
            return resolve_push_conflicts(engine, git, worktree_path, branch, outcome.conflicted_files.unwrap_or_default()).await;
        }
    }

    engine.emit_sync_clean();
    let remote_ref = git.push_branch(worktree_path, branch, REMOTE).await?;
    engine.mark_pushed(remote_ref).await?;
    Ok(())
}

async fn resolve_push_conflicts(
    engine: &LoopEngine,
    git: &GitService,
    worktree_path: &Path,
    branch: &str,
    conflicted_files: Vec<String>,
) -> Result<(), LoopManagerError> {
    engine.transition_to_resolving_conflicts().await?;
    engine.emit_sync_conflicts(conflicted_files);

    // `inject_pending_now` calls `start()` under the hood since no
    // iteration is in flight, and `start()` doesn't return until the
    // sub-engine run settles — so the status read right after is final.
    engine.inject_pending_now(Some(CONFLICT_RESOLUTION_PROMPT.to_string()), None).await?;
    engine.wait_for_loop_idle(Duration::from_secs(1)).await;

    match engine.snapshot().await.state.status {
        LoopStatus::Completed | LoopStatus::MaxIterations => {
            let remote_ref = git.push_branch(worktree_path, branch, REMOTE).await?;
            engine.mark_pushed(remote_ref).await?;
        }
        _ => engine.clear_auto_push_on_complete().await,
    }
    Ok(())
}
