//! The global typed event channel (C1) and its SSE projection.

mod bus;
mod sse;
mod types;

pub use bus::{EventBus, EventEmitter, DEFAULT_CHANNEL_CAPACITY};
pub use sse::{create_sse_stream, HEARTBEAT_INTERVAL};
pub use types::{LoopEvent, LoopEventKind};
