//! C5: the contract between `LoopEngine` and whatever drives the actual AI
//! session. Closed event vocabulary, subscribe-before-send discipline
//! enforced by the shape of the trait (callers must hold the stream before
//! they can call `send_prompt_async`).

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum AgentBackendError {
    #[error("agent backend not connected")]
    NotConnected,
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponsePart {
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub id: String,
    pub content: String,
    pub parts: Vec<AgentResponsePart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Once,
    Always,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskedQuestion {
    pub question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "message.start")]
    MessageStart { message_id: String },
    #[serde(rename = "message.delta")]
    MessageDelta { content: String },
    #[serde(rename = "message.complete")]
    MessageComplete { content: String },
    #[serde(rename = "reasoning.delta")]
    ReasoningDelta { content: String },
    #[serde(rename = "tool.start")]
    ToolStart { tool_name: String, input: serde_json::Value },
    #[serde(rename = "tool.complete")]
    ToolComplete { tool_name: String, output: serde_json::Value },
    #[serde(rename = "permission.asked")]
    PermissionAsked { request_id: String, permission: String, patterns: Vec<String> },
    #[serde(rename = "question.asked")]
    QuestionAsked { request_id: String, questions: Vec<AskedQuestion> },
    #[serde(rename = "todo.updated")]
    TodoUpdated { todos: Vec<serde_json::Value> },
    #[serde(rename = "session.status")]
    SessionStatusChanged { status: SessionStatus, attempt: Option<u32>, message: Option<String> },
    #[serde(rename = "error")]
    Error { message: String },
}

/// A pull-based, cancellable, finite stream of [`AgentEvent`]s. `close()` is
/// idempotent and cancels whatever task is producing events, mirroring the
/// coroutine/async-stream note in the design notes.
pub struct EventStream<T> {
    rx: mpsc::Receiver<T>,
    cancel: Option<oneshot::Sender<()>>,
}

impl<T> EventStream<T> {
    pub fn new(rx: mpsc::Receiver<T>, cancel: oneshot::Sender<()>) -> Self {
        Self { rx, cancel: Some(cancel) }
    }

    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.rx.close();
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn connect(&self, config: ConnectionConfig) -> Result<(), AgentBackendError>;
    async fn disconnect(&self) -> Result<(), AgentBackendError>;
    async fn is_connected(&self) -> bool;
    async fn create_session(&self, title: &str, directory: &Path) -> Result<SessionHandle, AgentBackendError>;
    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<AgentResponse, AgentBackendError>;
    async fn send_prompt_async(&self, session_id: &str, prompt: &str) -> Result<(), AgentBackendError>;
    async fn abort_session(&self, session_id: &str) -> Result<(), AgentBackendError>;
    async fn subscribe_to_events(&self, session_id: &str) -> Result<EventStream<AgentEvent>, AgentBackendError>;
    async fn reply_to_permission(&self, request_id: &str, decision: PermissionDecision) -> Result<(), AgentBackendError>;
    async fn reply_to_question(&self, request_id: &str, answers: Vec<String>) -> Result<(), AgentBackendError>;
}
