//! Domain entities for the loop supervisor: configuration, runtime state,
//! and the small value types that make up a snapshot.

mod bounded;
mod model;

pub use bounded::BoundedLog;
pub use model::{
    ConsecutiveErrors, ErrorState, GitCommit, GitConfig, GitState, IterationOutcome, IterationSummary, Loop,
    LoopConfig, LoopState, LogEntry, LogEntryKind, MessageEntry, MessageRole, Mode, ModelConfig, PlanModeState,
    ReviewModeState, SessionState, SyncState, ToolCallEntry, ToolCallStatus, DEFAULT_STOP_PATTERN, LOGS_CAP,
    MESSAGES_CAP, PLAN_READY_MARKER, RECENT_ITERATIONS_CAP, TOOL_CALLS_CAP,
};
