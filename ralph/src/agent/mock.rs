//! A scriptable [`AgentBackend`] double, built the way the persistence layer
//! doesn't need one but the engine's own tests do: an `AtomicUsize` call
//! counter plus a queue of canned per-iteration event scripts. Not
//! `#[cfg(test)]`-gated because the engine's integration tests (a separate
//! compilation unit) need to drive it too.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use super::backend::{
    AgentBackend, AgentBackendError, AgentEvent, AgentResponse, ConnectionConfig, PermissionDecision, SessionHandle,
};

pub struct MockAgentBackend {
    connected: AtomicBool,
    send_prompt_async_calls: AtomicUsize,
    next_session_id: AtomicUsize,
    scripts: Mutex<VecDeque<Vec<AgentEvent>>>,
    senders: Mutex<HashMap<String, mpsc::Sender<AgentEvent>>>,
    aborted_sessions: Mutex<Vec<String>>,
}

impl MockAgentBackend {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            send_prompt_async_calls: AtomicUsize::new(0),
            next_session_id: AtomicUsize::new(1),
            scripts: Mutex::new(VecDeque::new()),
            senders: Mutex::new(HashMap::new()),
            aborted_sessions: Mutex::new(Vec::new()),
        }
    }

    /// Queues one iteration's worth of events, delivered in order on the
    /// next `send_prompt_async` call.
    pub fn push_script(&self, events: Vec<AgentEvent>) {
        self.scripts.lock().unwrap().push_back(events);
    }

    pub fn send_prompt_async_calls(&self) -> usize {
        self.send_prompt_async_calls.load(Ordering::SeqCst)
    }

    pub fn aborted_sessions(&self) -> Vec<String> {
        self.aborted_sessions.lock().unwrap().clone()
    }
}

impl Default for MockAgentBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for MockAgentBackend {
    async fn connect(&self, _config: ConnectionConfig) -> Result<(), AgentBackendError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AgentBackendError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn create_session(&self, _title: &str, _directory: &Path) -> Result<SessionHandle, AgentBackendError> {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        Ok(SessionHandle { id: format!("mock-session-{id}"), created_at: Utc::now() })
    }

    async fn send_prompt(&self, _session_id: &str, prompt: &str) -> Result<AgentResponse, AgentBackendError> {
        Ok(AgentResponse { id: "mock-response".to_string(), content: prompt.to_string(), parts: Vec::new() })
    }

    async fn send_prompt_async(&self, session_id: &str, _prompt: &str) -> Result<(), AgentBackendError> {
        self.send_prompt_async_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let sender = self.senders.lock().unwrap().get(session_id).cloned();
        let Some(sender) = sender else {
            return Err(AgentBackendError::SessionNotFound(session_id.to_string()));
        };
        tokio::spawn(async move {
            for event in script {
                if sender.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn abort_session(&self, session_id: &str) -> Result<(), AgentBackendError> {
        self.aborted_sessions.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn subscribe_to_events(
        &self,
        session_id: &str,
    ) -> Result<super::backend::EventStream<AgentEvent>, AgentBackendError> {
        let (tx, rx) = mpsc::channel(256);
        self.senders.lock().unwrap().insert(session_id.to_string(), tx);
        let (cancel_tx, _cancel_rx) = oneshot::channel();
        Ok(super::backend::EventStream::new(rx, cancel_tx))
    }

    async fn reply_to_permission(&self, _request_id: &str, _decision: PermissionDecision) -> Result<(), AgentBackendError> {
        Ok(())
    }

    async fn reply_to_question(&self, _request_id: &str, _answers: Vec<String>) -> Result<(), AgentBackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_events_are_delivered_in_order() {
        let backend = MockAgentBackend::new();
        backend.push_script(vec![
            AgentEvent::MessageStart { message_id: "m1".to_string() },
            AgentEvent::MessageComplete { content: "done".to_string() },
        ]);
        let session = backend.create_session("t", Path::new(".")).await.unwrap();
        let mut stream = backend.subscribe_to_events(&session.id).await.unwrap();
        backend.send_prompt_async(&session.id, "go").await.unwrap();

        let first = stream.next().await.unwrap();
        assert!(matches!(first, AgentEvent::MessageStart { .. }));
        let second = stream.next().await.unwrap();
        assert!(matches!(second, AgentEvent::MessageComplete { .. }));
        assert_eq!(backend.send_prompt_async_calls(), 1);
    }

    #[tokio::test]
    async fn abort_session_is_recorded() {
        let backend = MockAgentBackend::new();
        backend.abort_session("s1").await.unwrap();
        assert_eq!(backend.aborted_sessions(), vec!["s1".to_string()]);
    }
}
