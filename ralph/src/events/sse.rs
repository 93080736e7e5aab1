//! SSE framing over an [`EventBus`] subscription.
//!
//! Produces the comment/heartbeat/data framing the spec calls for; turning
//! this into an actual HTTP response body is left to whatever REST surface
//! embeds the crate (out of scope here).

use std::time::Duration;

use futures::stream::{self, Stream};
use tokio::sync::broadcast;
use tokio::time::{self, Interval};
use tracing::warn;

use super::bus::EventBus;
use super::types::LoopEvent;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

enum SseState {
    Connected { rx: broadcast::Receiver<LoopEvent>, heartbeat: Interval, loop_id_filter: Option<String> },
    Streaming { rx: broadcast::Receiver<LoopEvent>, heartbeat: Interval, loop_id_filter: Option<String> },
}

/// `": connected\n\n"` on open, `": heartbeat\n\n"` every 5s, `"data: <json>\n\n"`
/// for each event matching `loop_id_filter` (or every event when `None`).
/// Dropping the returned stream cancels both the heartbeat timer and the
/// underlying subscription.
pub fn create_sse_stream(bus: &EventBus, loop_id_filter: Option<String>) -> impl Stream<Item = String> {
    let rx = bus.subscribe();
    let heartbeat = time::interval(HEARTBEAT_INTERVAL);
    let initial = SseState::Connected { rx, heartbeat, loop_id_filter };

    stream::unfold(initial, |state| async move {
        match state {
            SseState::Connected { rx, heartbeat, loop_id_filter } => {
                Some((": connected\n\n".to_string(), SseState::Streaming { rx, heartbeat, loop_id_filter }))
            }
            SseState::Streaming { mut rx, mut heartbeat, loop_id_filter } => loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        return Some((": heartbeat\n\n".to_string(), SseState::Streaming { rx, heartbeat, loop_id_filter }));
                    }
                    received = rx.recv() => {
                        match received {
                            Ok(event) => {
                                if let Some(filter) = &loop_id_filter {
                                    if &event.loop_id != filter {
                                        continue;
                                    }
                                }
                                let payload = match serde_json::to_string(&event) {
                                    Ok(json) => json,
                                    Err(error) => {
                                        warn!(%error, "create_sse_stream: failed to serialize event, skipping");
                                        continue;
                                    }
                                };
                                return Some((format!("data: {payload}\n\n"), SseState::Streaming { rx, heartbeat, loop_id_filter }));
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "create_sse_stream: subscriber lagged, dropping events");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                }
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::LoopEventKind;
    use futures::StreamExt;

    #[tokio::test]
    async fn opens_with_connected_comment() {
        let bus = EventBus::with_default_capacity();
        let mut stream = Box::pin(create_sse_stream(&bus, None));
        assert_eq!(stream.next().await, Some(": connected\n\n".to_string()));
    }

    #[tokio::test]
    async fn frames_matching_events_as_data() {
        let bus = EventBus::with_default_capacity();
        let mut stream = Box::pin(create_sse_stream(&bus, None));
        assert_eq!(stream.next().await, Some(": connected\n\n".to_string()));
        bus.emit(LoopEvent::new("loop-1", LoopEventKind::Started));
        let frame = stream.next().await.unwrap();
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("loop.started"));
    }

    #[tokio::test]
    async fn filter_drops_events_for_other_loops() {
        let bus = EventBus::with_default_capacity();
        let mut stream = Box::pin(create_sse_stream(&bus, Some("loop-1".to_string())));
        stream.next().await;
        bus.emit(LoopEvent::new("loop-2", LoopEventKind::Started));
        bus.emit(LoopEvent::new("loop-1", LoopEventKind::Completed));
        let frame = stream.next().await.unwrap();
        assert!(frame.contains("loop-1"));
        assert!(frame.contains("loop.completed"));
    }
}
