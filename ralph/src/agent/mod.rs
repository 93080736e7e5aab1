//! The AI-session driver seam (C5).

mod anthropic;
mod backend;
pub mod mock;

pub use anthropic::AnthropicBackend;
pub use backend::{
    AgentBackend, AgentBackendError, AgentEvent, AgentResponse, AgentResponsePart, AskedQuestion, ConnectionConfig,
    EventStream, PermissionDecision, SessionHandle, SessionStatus,
};
pub use mock::MockAgentBackend;
