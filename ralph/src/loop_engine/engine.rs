//! C7: the per-loop iteration driver. One `LoopEngine` owns exactly one
//! `Loop` and is the sole writer of its `state` — everything else (the
//! manager, the CLI, the SSE projection) only ever reads a snapshot or sends
//! it a control command. Interior mutability (`Mutex<Loop>` plus a few
//! atomics) rather than `&mut self` lets the manager hold a plain `Arc` to
//! each engine and call control operations while `run_loop` is mid-flight.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentBackend, AgentBackendError, AgentEvent, ConnectionConfig, PermissionDecision};
use crate::command::CommandExecutor;
use crate::domain::{
    ConsecutiveErrors, ErrorState, GitCommit, GitState, IterationOutcome, IterationSummary, Loop, LogEntry,
    LogEntryKind, MessageEntry, MessageRole, Mode, PlanModeState, SessionState, SyncState, ToolCallEntry,
    ToolCallStatus,
};
use crate::events::{EventBus, LoopEventKind};
use crate::git::{generate_branch_name, GitError, GitService};
use crate::state_machine::{self, LoopStatus, StateMachineError};
use crate::stop_pattern::{StopPatternDetector, PLAN_READY_PATTERN};

use super::prompt::{build_chat_prompt, build_execution_prompt, build_plan_prompt, resolve_model};

#[derive(Debug, Error)]
pub enum LoopEngineError {
    #[error("loop in status {0} cannot be started")]
    InvalidEntryStatus(LoopStatus),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    AgentBackend(#[from] AgentBackendError),
    #[error("loop is not in planning status")]
    NotInPlanningStatus,
}

type PersistCallback = Arc<dyn Fn(&Loop) + Send + Sync>;

/// `Clone`able handle: every field is an `Arc` or a plain `String`, so the
/// manager can freely hand copies to background tasks.
#[derive(Clone)]
pub struct LoopEngine {
    loop_id: String,
    git: Arc<GitService>,
    executor: Arc<dyn CommandExecutor>,
    backend: Arc<dyn AgentBackend>,
    bus: Arc<EventBus>,
    inner: Arc<AsyncMutex<Loop>>,
    on_persist: Arc<StdMutex<Option<PersistCallback>>>,
    is_loop_running: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
    injection_pending: Arc<AtomicBool>,
}

impl LoopEngine {
    pub fn new(
        data: Loop,
        git: Arc<GitService>,
        executor: Arc<dyn CommandExecutor>,
        backend: Arc<dyn AgentBackend>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            loop_id: data.config.id.clone(),
            git,
            executor,
            backend,
            bus,
            inner: Arc::new(AsyncMutex::new(data)),
            on_persist: Arc::new(StdMutex::new(None)),
            is_loop_running: Arc::new(AtomicBool::new(false)),
            aborted: Arc::new(AtomicBool::new(false)),
            injection_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_persist_callback(self, callback: PersistCallback) -> Self {
        *self.on_persist.lock().unwrap() = Some(callback);
        self
    }

    pub fn loop_id(&self) -> &str {
        &self.loop_id
    }

    pub async fn snapshot(&self) -> Loop {
        self.inner.lock().await.clone()
    }

    fn emit(&self, kind: LoopEventKind) {
        self.bus.emitter_for(self.loop_id.clone()).emit(kind);
    }

    fn transition(&self, data: &mut Loop, target: LoopStatus) -> Result<(), LoopEngineError> {
        let from = data.state.status;
        state_machine::assert_valid_transition(from, target)?;
        info!(loop_id = %self.loop_id, %from, to = %target, "transition: called");
        data.state.status = target;
        Ok(())
    }

    async fn persist(&self, data: &Loop) {
        let callback = self.on_persist.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(data);
        }
    }

    async fn persist_current(&self) {
        let data = self.inner.lock().await;
        self.persist(&data).await;
    }

    // --- start / run loop ---

    pub async fn start(&self) -> Result<(), LoopEngineError> {
        debug!(loop_id = %self.loop_id, "start: called");
        {
            let mut data = self.inner.lock().await;
            let entry_status = data.state.status;
            if !matches!(
                entry_status,
                LoopStatus::Idle | LoopStatus::Draft | LoopStatus::Stopped | LoopStatus::Planning | LoopStatus::ResolvingConflicts
            ) {
                return Err(LoopEngineError::InvalidEntryStatus(entry_status));
            }

            self.aborted.store(false, Ordering::SeqCst);
            data.state.current_iteration = 0;
            data.state.recent_iterations = crate::domain::BoundedLog::new(crate::domain::RECENT_ITERATIONS_CAP);
            if data.state.started_at.is_none() {
                data.state.started_at = Some(Utc::now());
            }
            if data.config.plan_mode && data.state.plan_mode.is_none() {
                data.state.plan_mode = Some(PlanModeState::default());
            }

            if entry_status != LoopStatus::Planning {
                let target = if data.config.plan_mode { LoopStatus::Planning } else { LoopStatus::Starting };
                self.transition(&mut data, target)?;
            }
        }

        // Plan mode defers worktree creation until the plan is accepted
        // (`setup_git_branch_for_plan_acceptance`) — a fresh plan-mode start
        // has no git state yet, so skip straight to session setup in the
        // main directory. A loop re-entering `planning` with git state
        // already present (e.g. `completed -> planning`) keeps its worktree.
        let skip_git_setup = {
            let data = self.inner.lock().await;
            data.config.plan_mode && data.state.git.is_none()
        };
        if !skip_git_setup {
            self.setup_git_branch().await?;
        }

        {
            let mut data = self.inner.lock().await;
            if data.config.clear_planning_folder {
                let already_cleared = data.state.plan_mode.as_ref().is_some_and(|p| p.planning_folder_cleared);
                if !already_cleared {
                    if let Some(git) = data.state.git.clone() {
                        drop(data);
                        self.clear_planning_folder(&git.worktree_path).await;
                        data = self.inner.lock().await;
                    }
                    if let Some(plan) = &mut data.state.plan_mode {
                        plan.planning_folder_cleared = true;
                    }
                }
            }
        }

        self.setup_session().await?;

        {
            let data = self.inner.lock().await;
            if !data.config.plan_mode {
                self.emit(LoopEventKind::Started);
            }
            self.persist(&data).await;
        }

        self.run_loop().await;
        Ok(())
    }

    async fn setup_git_branch(&self) -> Result<(), LoopEngineError> {
        let (directory, started_at, existing_branch, existing_original, branch_prefix, name, base_branch) = {
            let data = self.inner.lock().await;
            (
                data.config.directory.clone(),
                data.state.started_at.unwrap_or_else(Utc::now),
                data.state.git.as_ref().map(|g| g.working_branch.clone()),
                data.state.git.as_ref().map(|g| g.original_branch.clone()),
                data.config.git.branch_prefix.clone(),
                data.config.name.clone(),
                data.config.git.base_branch.clone(),
            )
        };

        let branch_name = existing_branch.unwrap_or_else(|| generate_branch_name(&branch_prefix, &name, started_at));
        let original_branch = match existing_original {
            Some(existing) => existing,
            None => match base_branch {
                Some(base) => base,
                None => self.git.get_current_branch(&directory).await?,
            },
        };

        let _ = self.git.pull(&directory, Some(&original_branch), "origin").await;

        let worktree_path = directory.join(".ralph-worktrees").join(&self.loop_id);
        if !self.git.worktree_exists(&directory, &worktree_path).await {
            if self.git.branch_exists(&directory, &branch_name).await? {
                self.git.add_worktree_for_existing_branch(&directory, &worktree_path, &branch_name).await?;
            } else {
                self.git.create_worktree(&directory, &worktree_path, &branch_name, Some(&original_branch)).await?;
            }
        }

        let mut data = self.inner.lock().await;
        let commits = data.state.git.as_ref().map(|g| g.commits.clone()).unwrap_or_default();
        data.state.git = Some(GitState { original_branch, working_branch: branch_name, worktree_path, commits });
        Ok(())
    }

    /// Removes every tracked file under `.planning/` except `.gitkeep`
    /// (which keeps the otherwise-empty directory tracked), then commits the
    /// deletion if anything was actually removed.
    async fn clear_planning_folder(&self, worktree_path: &Path) {
        let planning_dir = worktree_path.join(".planning");
        if !self.executor.directory_exists(&planning_dir).await {
            return;
        }
        let entries = match self.executor.list_directory(&planning_dir).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(loop_id = %self.loop_id, %error, "clear_planning_folder: failed to list directory");
                return;
            }
        };

        let mut removed_any = false;
        for name in entries {
            if name == ".gitkeep" {
                continue;
            }
            let path = planning_dir.join(&name);
            if self.executor.directory_exists(&path).await {
                continue;
            }
            match self.executor.remove_file(&path).await {
                Ok(()) => removed_any = true,
                Err(error) => warn!(loop_id = %self.loop_id, %error, path = %path.display(), "clear_planning_folder: failed to remove file"),
            }
        }

        if !removed_any {
            return;
        }
        if !matches!(self.git.has_uncommitted_changes(worktree_path).await, Ok(true)) {
            return;
        }
        if self.git.stage_all(worktree_path).await.is_err() {
            return;
        }
        if let Err(error) = self.git.commit(worktree_path, "Clear planning folder", None).await {
            warn!(loop_id = %self.loop_id, %error, "clear_planning_folder: failed to commit deletion");
        }
    }

    async fn setup_session(&self) -> Result<(), LoopEngineError> {
        if !self.backend.is_connected().await {
            self.backend.connect(ConnectionConfig { base_url: String::new(), api_key: String::new() }).await?;
        }
        let (has_session, title, directory) = {
            let data = self.inner.lock().await;
            (
                data.state.session.is_some(),
                format!("Ralph Loop: {}", data.config.name),
                data.state.git.as_ref().map(|g| g.worktree_path.clone()).unwrap_or_else(|| data.config.directory.clone()),
            )
        };
        if has_session {
            return Ok(());
        }
        let session = self.backend.create_session(&title, &directory).await?;
        let mut data = self.inner.lock().await;
        data.state.session = Some(SessionState { id: session.id, server_url: None });
        Ok(())
    }

    async fn run_loop(&self) {
        if self.is_loop_running.swap(true, Ordering::SeqCst) {
            warn!(loop_id = %self.loop_id, "run_loop: already running, ignoring re-entrant call");
            return;
        }
        if let Err(error) = self.run_loop_inner().await {
            error!(loop_id = %self.loop_id, %error, "run_loop: exited with error");
        }
        self.is_loop_running.store(false, Ordering::SeqCst);
    }

    async fn run_loop_inner(&self) -> Result<(), LoopEngineError> {
        loop {
            let active = {
                let data = self.inner.lock().await;
                data.state.status.is_active()
            };
            if !active || self.aborted.load(Ordering::SeqCst) {
                break;
            }

            let outcome = self.run_iteration().await;
            self.handle_outcome(outcome).await?;

            let hit_cap = {
                let data = self.inner.lock().await;
                data.config.max_iterations_bound().is_some_and(|max| data.state.current_iteration >= max)
            };
            if hit_cap {
                let mut data = self.inner.lock().await;
                if data.state.status.is_active() {
                    self.transition(&mut data, LoopStatus::MaxIterations)?;
                    let max_iterations = data.config.max_iterations.unwrap_or(0);
                    self.emit(LoopEventKind::Stopped { reason: format!("Reached maximum iterations: {max_iterations}") });
                    self.persist(&data).await;
                }
                break;
            }

            if self.aborted.load(Ordering::SeqCst) {
                if self.injection_pending.swap(false, Ordering::SeqCst) {
                    self.aborted.store(false, Ordering::SeqCst);
                    continue;
                }
                break;
            }
        }
        Ok(())
    }

    // --- one iteration ---

    async fn record_error(&self, iteration: u32, message: String) -> IterationOutcome {
        let mut data = self.inner.lock().await;
        data.state.error = Some(ErrorState { message, iteration, timestamp: Utc::now() });
        IterationOutcome::Error
    }

    async fn run_iteration(&self) -> IterationOutcome {
        let iteration = {
            let mut data = self.inner.lock().await;
            data.state.current_iteration += 1;
            let iteration = data.state.current_iteration;
            if data.state.status != LoopStatus::Planning {
                let _ = self.transition(&mut data, LoopStatus::Running);
            }
            self.emit(LoopEventKind::IterationStart { iteration });
            iteration
        };

        let (prompt, mode) = {
            let mut data = self.inner.lock().await;
            resolve_model(&mut data.config, &mut data.state);
            let plan_active = data.state.plan_mode.as_ref().is_some_and(|p| p.active || data.config.plan_mode);
            let mode = data.config.mode;
            let config = data.config.clone();
            let prompt = if plan_active {
                build_plan_prompt(&config, &mut data.state)
            } else if mode == Mode::Chat {
                build_chat_prompt(&config, &mut data.state)
            } else {
                build_execution_prompt(&config, &mut data.state)
            };
            (prompt, mode)
        };

        let session_id = {
            let data = self.inner.lock().await;
            match &data.state.session {
                Some(session) => session.id.clone(),
                None => return self.record_error(iteration, "no active agent session".to_string()).await,
            }
        };

        let mut stream = match self.backend.subscribe_to_events(&session_id).await {
            Ok(stream) => stream,
            Err(error) => return self.record_error(iteration, error.to_string()).await,
        };
        if let Err(error) = self.backend.send_prompt_async(&session_id, &prompt).await {
            return self.record_error(iteration, error.to_string()).await;
        }

        let timeout_secs = self.inner.lock().await.config.activity_timeout_seconds.max(1);
        let mut response_buffer = String::new();
        let mut message_count = 0u32;
        let mut tool_call_count = 0u32;
        let mut current_message_id: Option<String> = None;
        let mut current_reasoning_id: Option<String> = None;
        let mut tool_ids: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        let mut outcome = IterationOutcome::Continue;
        let mut error_message: Option<String> = None;

        loop {
            if self.aborted.load(Ordering::SeqCst) {
                break;
            }
            let event = match tokio::time::timeout(Duration::from_secs(timeout_secs), stream.next()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => {
                    error_message = Some(format!("No activity for {timeout_secs} seconds"));
                    outcome = IterationOutcome::Error;
                    break;
                }
            };

            match event {
                AgentEvent::MessageStart { message_id } => {
                    message_count += 1;
                    let mut data = self.inner.lock().await;
                    data.state.logs.push(LogEntry {
                        id: message_id.clone(),
                        kind: LogEntryKind::Agent,
                        content: String::new(),
                        timestamp: Utc::now(),
                    });
                    current_message_id = Some(message_id);
                    current_reasoning_id = None;
                }
                AgentEvent::MessageDelta { content } => {
                    response_buffer.push_str(&content);
                    if let Some(id) = current_message_id.clone() {
                        let mut data = self.inner.lock().await;
                        if let Some(entry) = data.state.logs.iter_mut().rev().find(|entry| entry.id == id) {
                            entry.content.push_str(&content);
                        }
                        self.emit(LoopEventKind::Progress { log_id: id, kind: LogEntryKind::Response, content });
                    }
                }
                AgentEvent::ReasoningDelta { content } => {
                    let mut data = self.inner.lock().await;
                    let id = match &current_reasoning_id {
                        Some(id) => id.clone(),
                        None => {
                            let id = format!("reasoning-{iteration}-{}", data.state.logs.len());
                            data.state.logs.push(LogEntry {
                                id: id.clone(),
                                kind: LogEntryKind::Reasoning,
                                content: String::new(),
                                timestamp: Utc::now(),
                            });
                            current_reasoning_id = Some(id.clone());
                            id
                        }
                    };
                    if let Some(entry) = data.state.logs.iter_mut().rev().find(|entry| entry.id == id) {
                        entry.content.push_str(&content);
                    }
                    self.emit(LoopEventKind::Progress { log_id: id, kind: LogEntryKind::Reasoning, content });
                }
                AgentEvent::MessageComplete { content } => {
                    response_buffer = content.clone();
                    current_message_id = None;
                    current_reasoning_id = None;
                    let mut data = self.inner.lock().await;
                    data.state.messages.push(MessageEntry {
                        id: format!("msg-{}-{}", iteration, data.state.messages.len()),
                        role: MessageRole::Assistant,
                        content: content.clone(),
                        timestamp: Utc::now(),
                    });
                    self.emit(LoopEventKind::Message { role: "assistant".to_string(), content });
                    break;
                }
                AgentEvent::ToolStart { tool_name, input } => {
                    tool_call_count += 1;
                    let id = format!("tool-{iteration}-{tool_call_count}");
                    tool_ids.insert(tool_name.clone(), id.clone());
                    let mut data = self.inner.lock().await;
                    data.state.tool_calls.push(ToolCallEntry {
                        id: id.clone(),
                        name: tool_name.clone(),
                        input: input.clone(),
                        output: None,
                        status: ToolCallStatus::Running,
                        started_at: Utc::now(),
                        completed_at: None,
                    });
                    self.emit(LoopEventKind::ToolCall {
                        id,
                        name: tool_name,
                        status: ToolCallStatus::Running,
                        input: Some(input),
                        output: None,
                    });
                    self.persist(&data).await;
                }
                AgentEvent::ToolComplete { tool_name, output } => {
                    let id = tool_ids.remove(&tool_name).unwrap_or_else(|| format!("tool-{iteration}-{tool_call_count}"));
                    let mut data = self.inner.lock().await;
                    if let Some(entry) = data.state.tool_calls.iter_mut().rev().find(|entry| entry.id == id) {
                        entry.output = Some(output.clone());
                        entry.status = ToolCallStatus::Completed;
                        entry.completed_at = Some(Utc::now());
                    }
                    self.emit(LoopEventKind::ToolCall {
                        id,
                        name: tool_name,
                        status: ToolCallStatus::Completed,
                        input: None,
                        output: Some(output),
                    });
                    self.persist(&data).await;
                }
                AgentEvent::Error { message } => {
                    error_message = Some(message);
                    outcome = IterationOutcome::Error;
                    break;
                }
                AgentEvent::PermissionAsked { request_id, .. } => {
                    let _ = self.backend.reply_to_permission(&request_id, PermissionDecision::Always).await;
                }
                AgentEvent::QuestionAsked { request_id, questions } => {
                    let answers =
                        questions.iter().map(|_| "Take the best course of action you recommend.".to_string()).collect();
                    let _ = self.backend.reply_to_question(&request_id, answers).await;
                }
                AgentEvent::TodoUpdated { todos } => {
                    let mut data = self.inner.lock().await;
                    data.state.todos = todos.clone();
                    self.emit(LoopEventKind::TodoUpdated { todos });
                    self.persist(&data).await;
                }
                AgentEvent::SessionStatusChanged { status, attempt, message } => {
                    debug!(loop_id = %self.loop_id, ?status, ?attempt, ?message, "run_iteration: session status changed");
                }
            }
        }

        stream.close();

        if outcome != IterationOutcome::Error {
            outcome = {
                let data = self.inner.lock().await;
                let plan_active = data.state.plan_mode.as_ref().is_some_and(|p| p.active || data.config.plan_mode);
                if plan_active {
                    if StopPatternDetector::new(PLAN_READY_PATTERN).matches(&response_buffer) {
                        IterationOutcome::PlanReady
                    } else {
                        IterationOutcome::Continue
                    }
                } else if StopPatternDetector::new(&data.config.stop_pattern).matches(&response_buffer) {
                    IterationOutcome::Complete
                } else {
                    IterationOutcome::Continue
                }
            };
            if mode == Mode::Chat {
                outcome = IterationOutcome::Complete;
            }
        }

        if outcome != IterationOutcome::Error {
            self.commit_iteration(&session_id, iteration, &response_buffer).await;
        }

        if let Some(message) = error_message {
            let mut data = self.inner.lock().await;
            data.state.error = Some(ErrorState { message, iteration, timestamp: Utc::now() });
        }

        {
            let mut data = self.inner.lock().await;
            data.state.recent_iterations.push(IterationSummary {
                iteration,
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
                message_count,
                tool_call_count,
                outcome,
            });
            data.state.last_activity_at = Some(Utc::now());
            self.emit(LoopEventKind::IterationEnd { iteration, outcome });
        }
        self.persist_current().await;

        outcome
    }

    async fn handle_outcome(&self, outcome: IterationOutcome) -> Result<(), LoopEngineError> {
        match outcome {
            IterationOutcome::Complete => {
                let mut data = self.inner.lock().await;
                self.transition(&mut data, LoopStatus::Completed)?;
                data.state.completed_at = Some(Utc::now());
                data.state.consecutive_errors = None;
                self.emit(LoopEventKind::Completed);
                self.persist(&data).await;
                self.aborted.store(true, Ordering::SeqCst);
            }
            IterationOutcome::PlanReady => {
                let plan_content = self.read_plan_file().await;
                let mut data = self.inner.lock().await;
                if let Some(plan) = &mut data.state.plan_mode {
                    plan.is_plan_ready = true;
                    plan.plan_content = plan_content;
                }
                data.state.consecutive_errors = None;
                self.emit(LoopEventKind::PlanReady);
                self.persist(&data).await;
                self.aborted.store(true, Ordering::SeqCst);
            }
            IterationOutcome::Error => {
                let mut data = self.inner.lock().await;
                data.state.current_iteration = data.state.current_iteration.saturating_sub(1);
                let message = data.state.error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
                let failsafe_tripped = update_consecutive_errors(&mut data, &message);
                if failsafe_tripped {
                    self.transition(&mut data, LoopStatus::Failed)?;
                    self.emit(LoopEventKind::Error { message, fatal: true });
                    self.persist(&data).await;
                    self.aborted.store(true, Ordering::SeqCst);
                } else {
                    self.emit(LoopEventKind::Error { message, fatal: false });
                    self.persist(&data).await;
                }
            }
            IterationOutcome::Continue => {
                let mut data = self.inner.lock().await;
                data.state.consecutive_errors = None;
            }
        }
        Ok(())
    }

    async fn read_plan_file(&self) -> Option<String> {
        let worktree_path = self.inner.lock().await.state.git.as_ref().map(|g| g.worktree_path.clone())?;
        self.executor.read_file(&worktree_path.join(".planning").join("plan.md")).await.ok()
    }

    async fn commit_iteration(&self, session_id: &str, iteration: u32, response: &str) {
        let (worktree_path, expected_branch, commit_prefix) = {
            let data = self.inner.lock().await;
            match &data.state.git {
                Some(git) => (git.worktree_path.clone(), git.working_branch.clone(), data.config.git.commit_prefix.clone()),
                None => return,
            }
        };

        match self.git.has_uncommitted_changes(&worktree_path).await {
            Ok(true) => {}
            _ => return,
        }
        if self.git.stage_all(&worktree_path).await.is_err() {
            return;
        }
        let changed_files = self.git.get_changed_files(&worktree_path).await.unwrap_or_default();
        let message = self.synthesize_commit_message(session_id, &commit_prefix, iteration, response, &changed_files).await;

        match self.git.commit(&worktree_path, &message, Some(&expected_branch)).await {
            Ok(outcome) => {
                let commit = GitCommit {
                    iteration,
                    sha: outcome.sha,
                    message: outcome.message,
                    timestamp: Utc::now(),
                    files_changed: outcome.files_changed,
                };
                let mut data = self.inner.lock().await;
                if let Some(git) = &mut data.state.git {
                    git.commits.push(commit.clone());
                }
                self.emit(LoopEventKind::GitCommit { commit });
            }
            Err(GitError::NoChangesToCommit) => {}
            Err(error) => warn!(loop_id = %self.loop_id, %error, "commit_iteration: commit failed, continuing"),
        }
    }

    /// Asks the backend to summarise the change in one line; falls back to
    /// `<prefix> Iteration <n>: <files>` when that ask errors.
    async fn synthesize_commit_message(
        &self,
        session_id: &str,
        prefix: &str,
        iteration: u32,
        response: &str,
        files: &[String],
    ) -> String {
        let fallback = fallback_commit_message(prefix, iteration, files);
        let excerpt: String = response.chars().take(500).collect();
        let ask = format!(
            "In a single line under 72 characters, summarise this change for a git commit message (no prefix needed). Changed files: {}. Response excerpt: {excerpt}",
            files.join(", ")
        );
        match self.backend.send_prompt(session_id, &ask).await {
            Ok(response) if !response.content.trim().is_empty() => {
                // §6's 72-char cap applies to the whole first line, prefix included.
                let budget = 72usize.saturating_sub(prefix.chars().count() + 1);
                format!("{prefix} {}", enforce_first_line_cap(response.content.trim(), budget))
            }
            _ => fallback,
        }
    }

    // --- injection protocol ---

    pub async fn set_pending_prompt(&self, message: String) {
        let mut data = self.inner.lock().await;
        data.state.pending_prompt = Some(message.clone());
        self.emit(LoopEventKind::PendingUpdated { prompt: Some(message), model: None });
    }

    pub async fn set_pending_model(&self, model: crate::domain::ModelConfig) {
        let mut data = self.inner.lock().await;
        data.state.pending_model = Some(model.clone());
        self.emit(LoopEventKind::PendingUpdated { prompt: None, model: Some(model) });
    }

    /// Applies a pending prompt/model immediately: if an iteration is in
    /// flight, aborts the live session so the next iteration picks it up;
    /// otherwise starts the loop fresh so it isn't applied silently.
    pub async fn inject_pending_now(
        &self,
        message: Option<String>,
        model: Option<crate::domain::ModelConfig>,
    ) -> Result<(), LoopEngineError> {
        debug!(loop_id = %self.loop_id, "inject_pending_now: called");
        {
            let mut data = self.inner.lock().await;
            if let Some(message) = message {
                data.state.pending_prompt = Some(message);
            }
            if let Some(model) = model {
                data.state.pending_model = Some(model);
            }
        }

        if self.is_loop_running.load(Ordering::SeqCst) {
            self.injection_pending.store(true, Ordering::SeqCst);
            let session_id = self.inner.lock().await.state.session.as_ref().map(|s| s.id.clone());
            if let Some(session_id) = session_id {
                self.backend.abort_session(&session_id).await?;
            }
            self.aborted.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            self.start().await
        }
    }

    // --- control operations ---

    pub async fn stop(&self, reason: impl Into<String>) -> Result<(), LoopEngineError> {
        let reason = reason.into();
        let session_id = self.inner.lock().await.state.session.as_ref().map(|s| s.id.clone());
        if let Some(session_id) = &session_id {
            let _ = self.backend.abort_session(session_id).await;
        }
        self.aborted.store(true, Ordering::SeqCst);
        // Cut the persistence reference first so no iteration still in
        // flight can write a snapshot after this loop is considered stopped.
        *self.on_persist.lock().unwrap() = None;
        let mut data = self.inner.lock().await;
        self.transition(&mut data, LoopStatus::Stopped)?;
        self.emit(LoopEventKind::Stopped { reason });
        Ok(())
    }

    pub async fn abort_session_only(&self, reason: impl Into<String>) -> Result<(), LoopEngineError> {
        let reason = reason.into();
        let session_id = self.inner.lock().await.state.session.as_ref().map(|s| s.id.clone());
        if let Some(session_id) = &session_id {
            self.backend.abort_session(session_id).await?;
        }
        self.emit(LoopEventKind::SessionAborted { reason });
        Ok(())
    }

    pub async fn setup_git_branch_for_plan_acceptance(&self) -> Result<(), LoopEngineError> {
        self.setup_git_branch().await
    }

    pub async fn continue_execution(&self) {
        if self.is_loop_running.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut data = self.inner.lock().await;
            if let Some(plan) = &mut data.state.plan_mode {
                plan.active = false;
            }
            if data.state.status.can_transition_to(LoopStatus::Starting) {
                let _ = self.transition(&mut data, LoopStatus::Starting);
            }
        }
        self.run_loop().await;
    }

    pub async fn inject_plan_feedback(&self, feedback: String) -> Result<(), LoopEngineError> {
        {
            let data = self.inner.lock().await;
            if data.state.status != LoopStatus::Planning {
                return Err(LoopEngineError::NotInPlanningStatus);
            }
        }
        {
            let mut data = self.inner.lock().await;
            if let Some(plan) = &mut data.state.plan_mode {
                plan.feedback_rounds += 1;
                plan.is_plan_ready = false;
            }
        }
        self.inject_pending_now(Some(feedback), None).await
    }

    pub async fn reconnect_session(&self) -> Result<(), LoopEngineError> {
        if !self.backend.is_connected().await {
            self.backend.connect(ConnectionConfig { base_url: String::new(), api_key: String::new() }).await?;
        }
        let has_session = self.inner.lock().await.state.session.is_some();
        if !has_session {
            self.setup_session().await?;
        }
        Ok(())
    }

    pub async fn wait_for_loop_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.is_loop_running.load(Ordering::SeqCst) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    // --- base-branch sync before push, orchestrated by LoopManager ---

    pub fn emit_sync_started(&self) {
        self.emit(LoopEventKind::SyncStarted);
    }

    pub fn emit_sync_clean(&self) {
        self.emit(LoopEventKind::SyncClean);
    }

    pub fn emit_sync_conflicts(&self, conflicted_files: Vec<String>) {
        self.emit(LoopEventKind::SyncConflicts { conflicted_files });
    }

    /// Entered only from `completed`/`max_iterations` (both allow it in the
    /// transition table). Marks `syncState.autoPushOnComplete` so the
    /// manager knows to push once the sub-engine it starts next settles.
    pub async fn transition_to_resolving_conflicts(&self) -> Result<(), LoopEngineError> {
        let mut data = self.inner.lock().await;
        self.transition(&mut data, LoopStatus::ResolvingConflicts)?;
        data.state.sync_state = Some(SyncState { auto_push_on_complete: true });
        self.persist(&data).await;
        Ok(())
    }

    pub async fn clear_auto_push_on_complete(&self) {
        let mut data = self.inner.lock().await;
        if let Some(sync) = &mut data.state.sync_state {
            sync.auto_push_on_complete = false;
        }
        self.persist(&data).await;
    }

    pub async fn mark_pushed(&self, remote_ref: String) -> Result<(), LoopEngineError> {
        let mut data = self.inner.lock().await;
        self.transition(&mut data, LoopStatus::Pushed)?;
        if let Some(sync) = &mut data.state.sync_state {
            sync.auto_push_on_complete = false;
        }
        self.emit(LoopEventKind::Pushed { remote_ref });
        self.persist(&data).await;
        Ok(())
    }

    /// `deleted` has no outgoing transitions and is reachable from every
    /// other status; the manager calls this, then purges the snapshot.
    pub async fn mark_deleted(&self) -> Result<(), LoopEngineError> {
        let session_id = self.inner.lock().await.state.session.as_ref().map(|s| s.id.clone());
        if let Some(session_id) = &session_id {
            let _ = self.backend.abort_session(session_id).await;
        }
        self.aborted.store(true, Ordering::SeqCst);
        *self.on_persist.lock().unwrap() = None;
        let mut data = self.inner.lock().await;
        self.transition(&mut data, LoopStatus::Deleted)?;
        Ok(())
    }
}

/// Same message as last time: increment. Different message: reset to 1.
/// Returns whether the failsafe (`maxConsecutiveErrors`) has now tripped.
fn update_consecutive_errors(data: &mut Loop, message: &str) -> bool {
    let count = match &mut data.state.consecutive_errors {
        Some(existing) if existing.last_error_message == message => {
            existing.count += 1;
            existing.count
        }
        _ => {
            data.state.consecutive_errors = Some(ConsecutiveErrors { last_error_message: message.to_string(), count: 1 });
            1
        }
    };
    data.config.max_consecutive_errors_bound().is_some_and(|limit| count >= limit)
}

fn fallback_commit_message(prefix: &str, iteration: u32, files: &[String]) -> String {
    let shown: Vec<&str> = files.iter().map(String::as_str).take(3).collect();
    let more = files.len().saturating_sub(shown.len());
    if more > 0 {
        format!("{prefix} Iteration {iteration}: {} (+{more} more)", shown.join(", "))
    } else if shown.is_empty() {
        format!("{prefix} Iteration {iteration}")
    } else {
        format!("{prefix} Iteration {iteration}: {}", shown.join(", "))
    }
}

/// Only the first line is length-checked — a multi-line summary is left
/// otherwise intact.
fn enforce_first_line_cap(message: &str, max_len: usize) -> String {
    let mut lines = message.splitn(2, '\n');
    let first: String = lines.next().unwrap_or("").chars().take(max_len).collect();
    match lines.next() {
        Some(rest) => format!("{first}\n{rest}"),
        None => first,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgentBackend;
    use crate::command::LocalCommandExecutor;
    use crate::domain::{GitConfig, LoopConfig};
    use std::process::Command as StdCommand;

    fn init_repo(dir: &Path) {
        StdCommand::new("git").arg("init").arg("-q").current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["config", "user.email", "test@example.com"]).current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["config", "user.name", "Test"]).current_dir(dir).output().unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        StdCommand::new("git").args(["add", "-A"]).current_dir(dir).output().unwrap();
        StdCommand::new("git").args(["commit", "-m", "initial"]).current_dir(dir).output().unwrap();
    }

    fn config(id: &str, directory: std::path::PathBuf) -> LoopConfig {
        LoopConfig {
            id: id.to_string(),
            name: "demo".to_string(),
            workspace_id: "ws-1".to_string(),
            directory,
            prompt: "Fix the bug".to_string(),
            model: crate::domain::ModelConfig { provider_id: "anthropic".to_string(), model_id: "claude".to_string(), variant: None },
            stop_pattern: crate::domain::DEFAULT_STOP_PATTERN.to_string(),
            git: GitConfig::default(),
            max_iterations: Some(5),
            max_consecutive_errors: Some(3),
            activity_timeout_seconds: 30,
            clear_planning_folder: false,
            plan_mode: false,
            mode: Mode::Loop,
        }
    }

    fn engine(id: &str, directory: std::path::PathBuf, backend: Arc<MockAgentBackend>) -> LoopEngine {
        let executor: Arc<dyn CommandExecutor> = Arc::new(LocalCommandExecutor::new());
        let git = Arc::new(GitService::new(executor.clone()));
        let bus = Arc::new(EventBus::with_default_capacity());
        LoopEngine::new(Loop::new(config(id, directory)), git, executor, backend, bus)
    }

    #[tokio::test]
    async fn completes_on_first_matching_iteration() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let backend = Arc::new(MockAgentBackend::new());
        backend.push_script(vec![
            AgentEvent::MessageStart { message_id: "m1".to_string() },
            AgentEvent::MessageComplete { content: "All done. <promise>COMPLETE</promise>".to_string() },
        ]);
        // Commit-message synthesis: backend.send_prompt echoes the prompt, so
        // the fallback path (empty response) never triggers in this test.
        let eng = engine("loop-1", dir.path().to_path_buf(), backend);
        eng.start().await.unwrap();
        let snap = eng.snapshot().await;
        assert_eq!(snap.state.status, LoopStatus::Completed);
        assert_eq!(snap.state.current_iteration, 1);
    }

    #[tokio::test]
    async fn hits_max_iterations_without_completion_marker() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let backend = Arc::new(MockAgentBackend::new());
        for _ in 0..2 {
            backend.push_script(vec![AgentEvent::MessageComplete { content: "still working".to_string() }]);
        }
        let mut cfg_override = config("loop-2", dir.path().to_path_buf());
        cfg_override.max_iterations = Some(2);
        let executor: Arc<dyn CommandExecutor> = Arc::new(LocalCommandExecutor::new());
        let git = Arc::new(GitService::new(executor.clone()));
        let bus = Arc::new(EventBus::with_default_capacity());
        let eng = LoopEngine::new(Loop::new(cfg_override), git, executor, backend, bus);
        eng.start().await.unwrap();
        let snap = eng.snapshot().await;
        assert_eq!(snap.state.status, LoopStatus::MaxIterations);
        assert_eq!(snap.state.current_iteration, 2);
    }

    #[tokio::test]
    async fn error_event_decrements_iteration_and_tracks_consecutive_count() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let backend = Arc::new(MockAgentBackend::new());
        backend.push_script(vec![AgentEvent::Error { message: "boom".to_string() }]);
        backend.push_script(vec![AgentEvent::MessageComplete { content: "<promise>COMPLETE</promise>".to_string() }]);
        let eng = engine("loop-3", dir.path().to_path_buf(), backend);
        eng.start().await.unwrap();
        let snap = eng.snapshot().await;
        assert_eq!(snap.state.status, LoopStatus::Completed);
        assert_eq!(snap.state.current_iteration, 1);
        assert_eq!(snap.state.recent_iterations.len(), 2);
    }

    #[tokio::test]
    async fn clear_planning_folder_removes_tracked_files_and_commits_the_deletion() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let planning_dir = dir.path().join(".planning");
        std::fs::create_dir_all(&planning_dir).unwrap();
        std::fs::write(planning_dir.join("plan.md"), "old plan").unwrap();
        std::fs::write(planning_dir.join("status.md"), "old status").unwrap();
        std::fs::write(planning_dir.join(".gitkeep"), "").unwrap();
        StdCommand::new("git").args(["add", "-A"]).current_dir(dir.path()).output().unwrap();
        StdCommand::new("git").args(["commit", "-m", "add planning"]).current_dir(dir.path()).output().unwrap();

        let backend = Arc::new(MockAgentBackend::new());
        let eng = engine("loop-6", dir.path().to_path_buf(), backend);
        eng.clear_planning_folder(dir.path()).await;

        assert!(!planning_dir.join("plan.md").exists());
        assert!(!planning_dir.join("status.md").exists());
        assert!(planning_dir.join(".gitkeep").exists());
        let log = StdCommand::new("git").args(["log", "-1", "--format=%s"]).current_dir(dir.path()).output().unwrap();
        assert_eq!(String::from_utf8_lossy(&log.stdout).trim(), "Clear planning folder");
    }

    #[tokio::test]
    async fn plan_mode_start_defers_worktree_creation() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let backend = Arc::new(MockAgentBackend::new());
        backend.push_script(vec![AgentEvent::MessageComplete {
            content: "Here's the plan. <promise>PLAN_READY</promise>".to_string(),
        }]);
        let mut cfg = config("loop-plan", dir.path().to_path_buf());
        cfg.plan_mode = true;
        let executor: Arc<dyn CommandExecutor> = Arc::new(LocalCommandExecutor::new());
        let git = Arc::new(GitService::new(executor.clone()));
        let bus = Arc::new(EventBus::with_default_capacity());
        let eng = LoopEngine::new(Loop::new(cfg), git, executor, backend, bus);
        eng.start().await.unwrap();
        let snap = eng.snapshot().await;
        assert_eq!(snap.state.status, LoopStatus::Planning);
        assert!(snap.state.git.is_none(), "plan mode must not create a worktree before acceptance");
        assert!(!dir.path().join(".ralph-worktrees").exists());
        assert!(snap.state.plan_mode.as_ref().unwrap().is_plan_ready);
    }

    #[tokio::test]
    async fn reasoning_deltas_accumulate_into_their_own_log_entry() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let backend = Arc::new(MockAgentBackend::new());
        backend.push_script(vec![
            AgentEvent::MessageStart { message_id: "m1".to_string() },
            AgentEvent::ReasoningDelta { content: "thinking ".to_string() },
            AgentEvent::ReasoningDelta { content: "some more".to_string() },
            AgentEvent::MessageDelta { content: "answer".to_string() },
            AgentEvent::MessageComplete { content: "answer <promise>COMPLETE</promise>".to_string() },
        ]);
        let eng = engine("loop-4", dir.path().to_path_buf(), backend);
        eng.start().await.unwrap();
        let snap = eng.snapshot().await;
        let reasoning_entries: Vec<_> = snap.state.logs.iter().filter(|e| e.kind == LogEntryKind::Reasoning).collect();
        assert_eq!(reasoning_entries.len(), 1);
        assert_eq!(reasoning_entries[0].content, "thinking some more");
        assert_ne!(reasoning_entries[0].id, "m1");
    }

    #[tokio::test]
    async fn commit_message_first_line_respects_72_char_cap_including_prefix() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let backend = Arc::new(MockAgentBackend::new());
        let eng = engine("loop-5", dir.path().to_path_buf(), backend);
        let message =
            eng.synthesize_commit_message("mock-session-1", "[ralph]", 1, "did some stuff", &["a.rs".to_string()]).await;
        let first_line = message.lines().next().unwrap();
        assert!(first_line.chars().count() <= 72, "first line was {} chars: {first_line:?}", first_line.chars().count());
        assert!(first_line.starts_with("[ralph] "));
    }

    #[test]
    fn fallback_commit_message_lists_up_to_three_files_with_overflow_count() {
        let files = vec!["a.rs".to_string(), "b.rs".to_string(), "c.rs".to_string(), "d.rs".to_string()];
        let message = fallback_commit_message("[ralph]", 3, &files);
        assert_eq!(message, "[ralph] Iteration 3: a.rs, b.rs, c.rs (+1 more)");
    }

    #[test]
    fn enforce_first_line_cap_only_truncates_first_line() {
        let message = "a very very very very very long first line here\nsecond line stays whole";
        let capped = enforce_first_line_cap(message, 10);
        let mut lines = capped.lines();
        assert_eq!(lines.next().unwrap().chars().count(), 10);
        assert_eq!(lines.next().unwrap(), "second line stays whole");
    }
}
