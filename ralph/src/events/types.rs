//! The closed event vocabulary published on the bus and projected over SSE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{GitCommit, IterationOutcome, LogEntryKind, ModelConfig, ToolCallStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LoopEventKind {
    #[serde(rename = "loop.started")]
    Started,
    #[serde(rename = "loop.stopped")]
    Stopped { reason: String },
    #[serde(rename = "loop.paused")]
    Paused,
    #[serde(rename = "loop.resumed")]
    Resumed,
    #[serde(rename = "loop.completed")]
    Completed,
    #[serde(rename = "loop.error")]
    Error { message: String, fatal: bool },
    #[serde(rename = "loop.iteration.start")]
    IterationStart { iteration: u32 },
    #[serde(rename = "loop.iteration.end")]
    IterationEnd { iteration: u32, outcome: IterationOutcome },
    #[serde(rename = "loop.message")]
    Message { role: String, content: String },
    #[serde(rename = "loop.progress")]
    Progress { log_id: String, kind: LogEntryKind, content: String },
    #[serde(rename = "loop.tool_call")]
    ToolCall { id: String, name: String, status: ToolCallStatus, input: Option<Value>, output: Option<Value> },
    #[serde(rename = "loop.git.commit")]
    GitCommit { commit: GitCommit },
    #[serde(rename = "loop.log")]
    Log { kind: LogEntryKind, content: String },
    #[serde(rename = "loop.todo.updated")]
    TodoUpdated { todos: Vec<Value> },
    #[serde(rename = "loop.plan.ready")]
    PlanReady,
    #[serde(rename = "loop.pending.updated")]
    PendingUpdated { prompt: Option<String>, model: Option<ModelConfig> },
    #[serde(rename = "loop.session_aborted")]
    SessionAborted { reason: String },
    #[serde(rename = "loop.sync.started")]
    SyncStarted,
    #[serde(rename = "loop.sync.clean")]
    SyncClean,
    #[serde(rename = "loop.sync.conflicts")]
    SyncConflicts { conflicted_files: Vec<String> },
    #[serde(rename = "loop.pushed")]
    Pushed { remote_ref: String },
}

/// An envelope carrying the loop identity and timestamp that every variant
/// needs, so `LoopEventKind` itself stays a plain closed enum instead of
/// repeating `loop_id`/`timestamp` on every arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopEvent {
    pub loop_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LoopEventKind,
}

impl LoopEvent {
    pub fn new(loop_id: impl Into<String>, kind: LoopEventKind) -> Self {
        Self { loop_id: loop_id.into(), timestamp: Utc::now(), kind }
    }

    pub fn event_type(&self) -> &'static str {
        match &self.kind {
            LoopEventKind::Started => "loop.started",
            LoopEventKind::Stopped { .. } => "loop.stopped",
            LoopEventKind::Paused => "loop.paused",
            LoopEventKind::Resumed => "loop.resumed",
            LoopEventKind::Completed => "loop.completed",
            LoopEventKind::Error { .. } => "loop.error",
            LoopEventKind::IterationStart { .. } => "loop.iteration.start",
            LoopEventKind::IterationEnd { .. } => "loop.iteration.end",
            LoopEventKind::Message { .. } => "loop.message",
            LoopEventKind::Progress { .. } => "loop.progress",
            LoopEventKind::ToolCall { .. } => "loop.tool_call",
            LoopEventKind::GitCommit { .. } => "loop.git.commit",
            LoopEventKind::Log { .. } => "loop.log",
            LoopEventKind::TodoUpdated { .. } => "loop.todo.updated",
            LoopEventKind::PlanReady => "loop.plan.ready",
            LoopEventKind::PendingUpdated { .. } => "loop.pending.updated",
            LoopEventKind::SessionAborted { .. } => "loop.session_aborted",
            LoopEventKind::SyncStarted => "loop.sync.started",
            LoopEventKind::SyncClean => "loop.sync.clean",
            LoopEventKind::SyncConflicts { .. } => "loop.sync.conflicts",
            LoopEventKind::Pushed { .. } => "loop.pushed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_variant() {
        let ev = LoopEvent::new("loop-1", LoopEventKind::Started);
        assert_eq!(ev.event_type(), "loop.started");
        assert_eq!(ev.loop_id, "loop-1");
    }

    #[test]
    fn serializes_tagged_with_envelope_fields() {
        let ev = LoopEvent::new("loop-2", LoopEventKind::Stopped { reason: "done".into() });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "loop.stopped");
        assert_eq!(json["loop_id"], "loop-2");
        assert_eq!(json["reason"], "done");
        assert!(json["timestamp"].is_string());
    }
}
