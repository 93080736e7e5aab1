//! Process-wide pub/sub over [`LoopEvent`], backed by a `tokio::sync::broadcast`
//! channel rather than a list of callback handlers. Each subscriber pulls at
//! its own pace, so one slow or failing consumer can never block or poison
//! delivery to the others — the isolation the spec asks for ("a handler's
//! failure is isolated") falls out of the channel design for free.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::LoopEvent;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<LoopEvent>,
    channel_capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx, channel_capacity: capacity }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Fire-and-forget. Returns normally even with zero subscribers;
    /// `broadcast::Sender::send` only errors when every receiver has
    /// dropped, which is not a condition the publisher needs to react to.
    pub fn emit(&self, event: LoopEvent) {
        debug!(loop_id = %event.loop_id, event_type = event.event_type(), "emit: called");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.tx.subscribe()
    }

    /// A thin handle bound to one loop id, so callers inside the engine
    /// don't have to repeat `loop_id` at every call site.
    pub fn emitter_for(&self, loop_id: impl Into<String>) -> EventEmitter {
        EventEmitter { tx: self.tx.clone(), loop_id: loop_id.into() }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    /// Drops every live subscriber without closing the bus: a fresh
    /// `broadcast::channel` replaces the old one, so existing `Receiver`s
    /// start erroring on their next `recv` (`RecvError::Closed`) while the
    /// bus itself stays usable for new `subscribe` calls. Exists for the
    /// shutdown/reset path where in-flight SSE streams should end cleanly
    /// instead of lingering on a bus nobody publishes to anymore.
    pub fn clear(&mut self) {
        let (tx, _rx) = broadcast::channel(self.channel_capacity);
        self.tx = tx;
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<LoopEvent>,
    loop_id: String,
}

impl EventEmitter {
    pub fn emit(&self, kind: super::types::LoopEventKind) {
        let event = LoopEvent::new(self.loop_id.clone(), kind);
        debug!(loop_id = %event.loop_id, event_type = event.event_type(), "emit: called");
        let _ = self.tx.send(event);
    }

    pub fn loop_id(&self) -> &str {
        &self.loop_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::LoopEventKind;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::with_default_capacity();
        let mut rx = bus.subscribe();
        bus.emit(LoopEvent::new("loop-1", LoopEventKind::Started));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.loop_id, "loop-1");
        assert_eq!(received.event_type(), "loop.started");
    }

    #[tokio::test]
    async fn ordering_within_one_loop_is_preserved() {
        let bus = EventBus::with_default_capacity();
        let mut rx = bus.subscribe();
        let emitter = bus.emitter_for("loop-1");
        emitter.emit(LoopEventKind::IterationStart { iteration: 1 });
        emitter.emit(LoopEventKind::IterationEnd { iteration: 1, outcome: crate::domain::IterationOutcome::Complete });
        emitter.emit(LoopEventKind::Completed);

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!(a.event_type(), "loop.iteration.start");
        assert_eq!(b.event_type(), "loop.iteration.end");
        assert_eq!(c.event_type(), "loop.completed");
    }

    #[tokio::test]
    async fn lagged_subscriber_gets_recv_error_not_a_panic() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.emit(LoopEvent::new("loop-1", LoopEventKind::Started));
        }
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, broadcast::error::RecvError::Lagged(_)));
    }

    #[test]
    fn subscriber_count_reflects_live_receivers() {
        let bus = EventBus::with_default_capacity();
        assert_eq!(bus.subscriber_count(), 0);
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(rx1);
        drop(rx2);
    }

    #[tokio::test]
    async fn clear_disconnects_existing_subscribers_without_closing_the_bus() {
        let mut bus = EventBus::with_default_capacity();
        let mut rx = bus.subscribe();
        bus.clear();
        assert_eq!(bus.subscriber_count(), 0);
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, broadcast::error::RecvError::Closed));

        let mut fresh = bus.subscribe();
        bus.emit(LoopEvent::new("loop-1", LoopEventKind::Started));
        let received = fresh.recv().await.unwrap();
        assert_eq!(received.event_type(), "loop.started");
    }
}
