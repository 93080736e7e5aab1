//! The one concrete [`AgentBackend`] this crate ships: an Anthropic
//! Messages-API client streamed over `reqwest-eventsource`. Exists purely so
//! `LoopEngine` is exercisable end-to-end against a real model; any other
//! backend only needs to implement the trait.
//!
//! Permission/question prompts aren't part of the raw Messages API wire
//! format, so `reply_to_permission`/`reply_to_question` are no-ops here —
//! a backend fronting an actual agent harness would route them over its own
//! control channel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use super::backend::{
    AgentBackend, AgentBackendError, AgentEvent, AgentResponse, ConnectionConfig, EventStream, PermissionDecision,
    SessionHandle,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

struct Session {
    #[allow(dead_code)]
    directory: std::path::PathBuf,
    history: Vec<Value>,
}

pub struct AnthropicBackend {
    model: String,
    client: Client,
    config: RwLock<Option<ConnectionConfig>>,
    sessions: AsyncMutex<HashMap<String, Session>>,
    event_senders: AsyncMutex<HashMap<String, mpsc::Sender<AgentEvent>>>,
}

impl AnthropicBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            client: Client::new(),
            config: RwLock::new(None),
            sessions: AsyncMutex::new(HashMap::new()),
            event_senders: AsyncMutex::new(HashMap::new()),
        }
    }

    fn base_url(&self) -> String {
        self.config.read().unwrap().as_ref().map(|c| c.base_url.clone()).unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    fn api_key(&self) -> Result<String, AgentBackendError> {
        self.config.read().unwrap().as_ref().map(|c| c.api_key.clone()).ok_or(AgentBackendError::NotConnected)
    }

    async fn request_body(&self, session_id: &str, prompt: &str, stream: bool) -> Result<Value, AgentBackendError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| AgentBackendError::SessionNotFound(session_id.to_string()))?;
        session.history.push(json!({"role": "user", "content": prompt}));
        Ok(json!({
            "model": self.model,
            "max_tokens": 8192,
            "stream": stream,
            "messages": session.history.clone(),
        }))
    }
}

#[async_trait]
impl AgentBackend for AnthropicBackend {
    async fn connect(&self, config: ConnectionConfig) -> Result<(), AgentBackendError> {
        debug!(base_url = %config.base_url, "connect: called");
        *self.config.write().unwrap() = Some(config);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AgentBackendError> {
        *self.config.write().unwrap() = None;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.config.read().unwrap().is_some()
    }

    async fn create_session(&self, title: &str, directory: &Path) -> Result<SessionHandle, AgentBackendError> {
        debug!(title, directory = %directory.display(), "create_session: called");
        let id = uuid::Uuid::now_v7().to_string();
        self.sessions
            .lock()
            .await
            .insert(id.clone(), Session { directory: directory.to_path_buf(), history: Vec::new() });
        Ok(SessionHandle { id, created_at: Utc::now() })
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<AgentResponse, AgentBackendError> {
        let api_key = self.api_key()?;
        let body = self.request_body(session_id, prompt, false).await?;
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url()))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentBackendError::Transport(e.to_string()))?;

        let payload: Value = response.json().await.map_err(|e| AgentBackendError::Transport(e.to_string()))?;
        let content = payload["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .and_then(|block| block["text"].as_str())
            .unwrap_or_default()
            .to_string();

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.history.push(json!({"role": "assistant", "content": content.clone()}));
        }

        Ok(AgentResponse { id: uuid::Uuid::now_v7().to_string(), content, parts: Vec::new() })
    }

    async fn send_prompt_async(&self, session_id: &str, prompt: &str) -> Result<(), AgentBackendError> {
        debug!(session_id, "send_prompt_async: called");
        let api_key = self.api_key()?;
        let base_url = self.base_url();
        let body = self.request_body(session_id, prompt, true).await?;
        let sender = self
            .event_sender(session_id)
            .await
            .ok_or_else(|| AgentBackendError::SessionNotFound(session_id.to_string()))?;

        let client = self.client.clone();
        tokio::spawn(async move {
            let request = client
                .post(format!("{base_url}/v1/messages"))
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body);
            let mut source = match EventSource::new(request) {
                Ok(s) => s,
                Err(error) => {
                    warn!(%error, "send_prompt_async: failed to open event source");
                    let _ = sender.send(AgentEvent::Error { message: error.to_string() }).await;
                    return;
                }
            };

            let mut message_id = String::new();
            let mut accumulated = String::new();
            while let Some(event) = source.next().await {
                match event {
                    Ok(SseEvent::Open) => {}
                    Ok(SseEvent::Message(message)) => {
                        if !translate_sse_message(&message.event, &message.data, &mut message_id, &mut accumulated, &sender).await {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "send_prompt_async: stream error");
                        let _ = sender.send(AgentEvent::Error { message: error.to_string() }).await;
                        break;
                    }
                }
            }
            source.close();
        });
        Ok(())
    }

    async fn abort_session(&self, session_id: &str) -> Result<(), AgentBackendError> {
        debug!(session_id, "abort_session: called");
        Ok(())
    }

    async fn subscribe_to_events(&self, session_id: &str) -> Result<EventStream<AgentEvent>, AgentBackendError> {
        let (tx, rx) = mpsc::channel(256);
        self.register_sender(session_id, tx).await?;
        let (cancel_tx, _cancel_rx) = oneshot::channel();
        Ok(EventStream::new(rx, cancel_tx))
    }

    async fn reply_to_permission(&self, _request_id: &str, _decision: PermissionDecision) -> Result<(), AgentBackendError> {
        Ok(())
    }

    async fn reply_to_question(&self, _request_id: &str, _answers: Vec<String>) -> Result<(), AgentBackendError> {
        Ok(())
    }
}

impl AnthropicBackend {
    async fn register_sender(&self, session_id: &str, sender: mpsc::Sender<AgentEvent>) -> Result<(), AgentBackendError> {
        let mut senders = self.event_senders.lock().await;
        senders.insert(session_id.to_string(), sender);
        Ok(())
    }

    async fn event_sender(&self, session_id: &str) -> Option<mpsc::Sender<AgentEvent>> {
        self.event_senders.lock().await.get(session_id).cloned()
    }
}

/// Returns `false` to signal the caller should stop pumping (stream end).
async fn translate_sse_message(
    event_name: &str,
    data: &str,
    message_id: &mut String,
    accumulated: &mut String,
    sender: &mpsc::Sender<AgentEvent>,
) -> bool {
    let Ok(payload) = serde_json::from_str::<Value>(data) else {
        return true;
    };
    match event_name {
        "message_start" => {
            *message_id = uuid::Uuid::now_v7().to_string();
            accumulated.clear();
            let _ = sender.send(AgentEvent::MessageStart { message_id: message_id.clone() }).await;
        }
        "content_block_delta" => {
            if let Some(text) = payload["delta"]["text"].as_str() {
                accumulated.push_str(text);
                let _ = sender.send(AgentEvent::MessageDelta { content: text.to_string() }).await;
            } else if let Some(thinking) = payload["delta"]["thinking"].as_str() {
                let _ = sender.send(AgentEvent::ReasoningDelta { content: thinking.to_string() }).await;
            }
        }
        "message_stop" => {
            let _ = sender.send(AgentEvent::MessageComplete { content: accumulated.clone() }).await;
            return false;
        }
        "error" => {
            let message = payload["error"]["message"].as_str().unwrap_or("unknown error").to_string();
            let _ = sender.send(AgentEvent::Error { message }).await;
            return false;
        }
        _ => {}
    }
    true
}
