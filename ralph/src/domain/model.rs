//! The `Loop` entity: immutable `LoopConfig` plus mutable `LoopState`.
//!
//! This mirrors the data model's entity list one-for-one rather than
//! inventing a richer object graph — `LoopState` is the thing that gets
//! snapshotted to persistence after every iteration, so its shape is driven
//! by what a snapshot needs to reconstruct, not by what's convenient to
//! compute with in memory.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::LoopStatus;

use super::bounded::BoundedLog;

pub const RECENT_ITERATIONS_CAP: usize = 10;
pub const LOGS_CAP: usize = 5000;
pub const MESSAGES_CAP: usize = 2000;
pub const TOOL_CALLS_CAP: usize = 5000;

pub const DEFAULT_STOP_PATTERN: &str = r"<promise>COMPLETE</promise>$";
pub const PLAN_READY_MARKER: &str = "<promise>PLAN_READY</promise>";

/// Which side of the two prompt contracts a loop follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Loop,
    Chat,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Loop
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider_id: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    pub branch_prefix: String,
    pub commit_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self { branch_prefix: "ralph/".to_string(), commit_prefix: "[ralph]".to_string(), base_branch: None }
    }
}

/// Immutable after creation, except `model` (updated in place when an
/// injected model override is promoted, per the injection protocol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub id: String,
    pub name: String,
    pub workspace_id: String,
    pub directory: PathBuf,
    pub prompt: String,
    pub model: ModelConfig,
    pub stop_pattern: String,
    pub git: GitConfig,
    pub max_iterations: Option<u32>,
    pub max_consecutive_errors: Option<u32>,
    pub activity_timeout_seconds: u64,
    pub clear_planning_folder: bool,
    pub plan_mode: bool,
    pub mode: Mode,
}

impl LoopConfig {
    /// `0` and `None` both mean "unbounded" per the data model.
    pub fn max_iterations_bound(&self) -> Option<u32> {
        self.max_iterations.filter(|n| *n > 0)
    }

    pub fn max_consecutive_errors_bound(&self) -> Option<u32> {
        self.max_consecutive_errors.filter(|n| *n > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    Continue,
    Complete,
    PlanReady,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub message_count: u32,
    pub tool_call_count: u32,
    pub outcome: IterationOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommit {
    pub iteration: u32,
    pub sha: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub files_changed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitState {
    pub original_branch: String,
    pub working_branch: String,
    pub worktree_path: PathBuf,
    pub commits: Vec<GitCommit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorState {
    pub message: String,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsecutiveErrors {
    pub last_error_message: String,
    pub count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanModeState {
    pub active: bool,
    pub feedback_rounds: u32,
    pub planning_folder_cleared: bool,
    pub is_plan_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewModeState {
    pub review_cycles: u32,
    pub completion_action: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub auto_push_on_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntry {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEntry {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub status: ToolCallStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryKind {
    Response,
    Reasoning,
    Agent,
    System,
}

/// One line of `state.logs`. Streaming deltas for a single message share one
/// `id` so the UI sees a growing entry rather than thousands of separate
/// lines (P7); a new message, tool call, or reasoning block gets a new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub kind: LogEntryKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Mutable part of a `Loop`. Everything here is the single source of truth
/// for what may happen next (invariant 1) and is written exclusively by the
/// owning `LoopEngine` plus `LoopManager` on user commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    pub status: LoopStatus,
    pub current_iteration: u32,
    pub recent_iterations: BoundedLog<IterationSummary>,
    pub logs: BoundedLog<LogEntry>,
    pub messages: BoundedLog<MessageEntry>,
    pub tool_calls: BoundedLog<ToolCallEntry>,
    pub todos: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_errors: Option<ConsecutiveErrors>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_model: Option<ModelConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_mode: Option<PlanModeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_mode: Option<ReviewModeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_state: Option<SyncState>,
}

impl LoopState {
    /// `BoundedLog::cap` is `#[serde(skip)]` (so a snapshot serializes as a
    /// plain array, not `{entries, cap}`) and therefore comes back from
    /// deserialization as `0`. Call this right after loading a snapshot to
    /// restore the real caps before the log is pushed to again.
    pub fn restore_bounded_caps(&mut self) {
        self.recent_iterations.set_cap(RECENT_ITERATIONS_CAP);
        self.logs.set_cap(LOGS_CAP);
        self.messages.set_cap(MESSAGES_CAP);
        self.tool_calls.set_cap(TOOL_CALLS_CAP);
    }

    pub fn new(status: LoopStatus) -> Self {
        Self {
            status,
            current_iteration: 0,
            recent_iterations: BoundedLog::new(RECENT_ITERATIONS_CAP),
            logs: BoundedLog::new(LOGS_CAP),
            messages: BoundedLog::new(MESSAGES_CAP),
            tool_calls: BoundedLog::new(TOOL_CALLS_CAP),
            todos: Vec::new(),
            git: None,
            session: None,
            started_at: None,
            completed_at: None,
            last_activity_at: None,
            error: None,
            consecutive_errors: None,
            pending_prompt: None,
            pending_model: None,
            plan_mode: None,
            review_mode: None,
            sync_state: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    pub config: LoopConfig,
    pub state: LoopState,
}

impl Loop {
    pub fn new(config: LoopConfig) -> Self {
        let status = if config.plan_mode { LoopStatus::Draft } else { LoopStatus::Idle };
        Self { state: LoopState::new(status), config }
    }
}
