//! Events a [`ClientConnection`](crate::ClientConnection) publishes to its owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use agentbridge_protocol::{Payload, ServerControl};
use serde_json::Value;
use tokio::sync::Notify;

use crate::backpressure::{
    agent_event_is_critical, coalesce_agent_deltas, BackpressureBuffer, BackpressureStats,
    PushOutcome,
};
use crate::transport::TransportPhase;

/// Full state captured after connect and after every reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct ResyncSnapshot {
    pub generation: u64,
    pub client_id: String,
    pub resumed: bool,
    pub state: Option<Value>,
    pub messages: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Resynced(ResyncSnapshot),
    /// Data-channel event that was not a reply to one of our commands.
    Agent(Payload),
    /// Unsolicited control message (`agent_status`, uncorrelated `error`).
    Control(ServerControl),
    Connection(TransportPhase),
}

impl ClientEvent {
    pub fn is_critical(&self) -> bool {
        match self {
            ClientEvent::Agent(payload) => agent_event_is_critical(payload),
            _ => true,
        }
    }
}

fn coalesce_events(last: &mut ClientEvent, next: &ClientEvent) -> bool {
    match (last, next) {
        (ClientEvent::Agent(last), ClientEvent::Agent(next)) => coalesce_agent_deltas(last, next),
        _ => false,
    }
}

/// Single-consumer queue between the dispatch loop and the application.
pub struct EventQueue {
    buffer: Mutex<BackpressureBuffer<ClientEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(
                BackpressureBuffer::new(capacity, ClientEvent::is_critical)
                    .with_coalescing(coalesce_events),
            ),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackpressureBuffer<ClientEvent>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, event: ClientEvent) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Dropped;
        }
        let outcome = self.lock().push(event);
        match outcome {
            PushOutcome::Dropped => {
                tracing::debug!(
                    component = "client",
                    event = "client.events.dropped",
                    "Dropped non-critical event under backpressure"
                );
            }
            PushOutcome::AcceptedEvictingOldest => {
                tracing::warn!(
                    component = "client",
                    event = "client.events.evicted",
                    "Event queue full, evicted oldest event"
                );
                self.notify.notify_one();
            }
            PushOutcome::Accepted | PushOutcome::Coalesced => self.notify.notify_one(),
        }
        outcome
    }

    pub fn try_next(&self) -> Option<ClientEvent> {
        self.lock().pop()
    }

    /// Wait for the next event. Returns `None` once closed and drained.
    pub async fn next(&self) -> Option<ClientEvent> {
        loop {
            if let Some(event) = self.try_next() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> BackpressureStats {
        self.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn agent(value: Value) -> ClientEvent {
        match value {
            Value::Object(map) => ClientEvent::Agent(map),
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn next_wakes_on_push_and_ends_after_close() {
        let queue = Arc::new(EventQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(event) = queue.next().await {
                    seen.push(event);
                }
                seen
            })
        };

        queue.push(ClientEvent::Connection(TransportPhase::Connected));
        queue.push(agent(json!({"type": "agent_start"})));
        tokio::task::yield_now().await;
        queue.close();

        let seen = consumer.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ClientEvent::Connection(TransportPhase::Connected));
    }

    #[test]
    fn lifecycle_events_survive_delta_floods() {
        let queue = EventQueue::new(2);
        let delta = |n: u64| {
            agent(json!({
                "type": "message_update",
                "message": {"timestamp": n},
                "assistantMessageEvent": {"type": "text_delta", "contentIndex": 0, "delta": "x"}
            }))
        };
        queue.push(delta(1));
        queue.push(delta(2));
        assert_eq!(queue.push(delta(3)), PushOutcome::Dropped);
        assert_eq!(
            queue.push(agent(json!({"type": "agent_end"}))),
            PushOutcome::AcceptedEvictingOldest
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().dropped, 1);
    }
}
