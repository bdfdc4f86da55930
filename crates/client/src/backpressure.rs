//! Fixed-capacity queue that sheds non-critical items under overload.

use std::collections::VecDeque;

use agentbridge_protocol::agent::payload_type;
use agentbridge_protocol::Payload;
use serde_json::Value;

use crate::streaming::MESSAGE_UPDATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Merged into the newest queued item.
    Coalesced,
    /// Queue full and the item was not critical.
    Dropped,
    /// Queue full; the oldest item made room for this critical one.
    AcceptedEvictingOldest,
}

impl PushOutcome {
    pub fn accepted(self) -> bool {
        !matches!(self, PushOutcome::Dropped)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackpressureStats {
    pub dropped: u64,
    pub evicted: u64,
    pub coalesced: u64,
}

pub struct BackpressureBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
    is_critical: fn(&T) -> bool,
    coalesce: Option<fn(&mut T, &T) -> bool>,
    stats: BackpressureStats,
}

impl<T> BackpressureBuffer<T> {
    pub fn new(capacity: usize, is_critical: fn(&T) -> bool) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
            is_critical,
            coalesce: None,
            stats: BackpressureStats::default(),
        }
    }

    /// Let non-critical items merge into the newest queued item.
    pub fn with_coalescing(mut self, coalesce: fn(&mut T, &T) -> bool) -> Self {
        self.coalesce = Some(coalesce);
        self
    }

    pub fn push(&mut self, item: T) -> PushOutcome {
        let critical = (self.is_critical)(&item);

        if !critical {
            if let (Some(coalesce), Some(last)) = (self.coalesce, self.items.back_mut()) {
                if coalesce(last, &item) {
                    self.stats.coalesced += 1;
                    return PushOutcome::Coalesced;
                }
            }
        }

        if self.items.len() < self.capacity {
            self.items.push_back(item);
            return PushOutcome::Accepted;
        }

        if !critical {
            self.stats.dropped += 1;
            return PushOutcome::Dropped;
        }

        self.items.pop_front();
        self.stats.evicted += 1;
        self.items.push_back(item);
        PushOutcome::AcceptedEvictingOldest
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BackpressureStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

const DELTA_EVENTS: [&str; 3] = ["text_delta", "thinking_delta", "toolcall_delta"];

fn assistant_event(payload: &Payload) -> Option<&serde_json::Map<String, Value>> {
    if payload_type(payload) != Some(MESSAGE_UPDATE) {
        return None;
    }
    payload.get("assistantMessageEvent")?.as_object()
}

fn delta_event_type(payload: &Payload) -> Option<&str> {
    let kind = assistant_event(payload)?.get("type")?.as_str()?;
    DELTA_EVENTS.contains(&kind).then_some(kind)
}

/// Agent events that must always reach the consumer. Intermediate deltas
/// and tool progress updates are the only sheddable traffic.
pub fn agent_event_is_critical(payload: &Payload) -> bool {
    if delta_event_type(payload).is_some() {
        return false;
    }
    payload_type(payload) != Some("tool_execution_update")
}

/// Merge `next` into `last` when both are deltas of the same kind for the
/// same message slot.
pub fn coalesce_agent_deltas(last: &mut Payload, next: &Payload) -> bool {
    let (Some(last_kind), Some(next_kind)) = (delta_event_type(last), delta_event_type(next)) else {
        return false;
    };
    if last_kind != next_kind
        || last.get("message") != next.get("message")
        || slot_of(last) != slot_of(next)
    {
        return false;
    }
    let Some(addition) = assistant_event(next)
        .and_then(|event| event.get("delta"))
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return false;
    };
    let Some(Value::Object(event)) = last.get_mut("assistantMessageEvent") else {
        return false;
    };
    match event.get_mut("delta") {
        Some(Value::String(existing)) => existing.push_str(&addition),
        _ => {
            event.insert("delta".into(), Value::String(addition));
        }
    }
    true
}

fn slot_of(payload: &Payload) -> Option<u64> {
    assistant_event(payload)?.get("contentIndex")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq)]
    struct Item {
        name: &'static str,
        critical: bool,
    }

    fn item(name: &'static str, critical: bool) -> Item {
        Item { name, critical }
    }

    fn buffer() -> BackpressureBuffer<Item> {
        BackpressureBuffer::new(2, |item: &Item| item.critical)
    }

    #[test]
    fn full_buffer_drops_non_critical() {
        let mut buffer = buffer();
        assert_eq!(buffer.push(item("a", true)), PushOutcome::Accepted);
        assert_eq!(buffer.push(item("b", true)), PushOutcome::Accepted);
        assert_eq!(buffer.push(item("c", false)), PushOutcome::Dropped);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.stats().dropped, 1);
    }

    #[test]
    fn full_buffer_evicts_oldest_for_critical() {
        let mut buffer = buffer();
        buffer.push(item("a", true));
        buffer.push(item("b", true));
        assert_eq!(
            buffer.push(item("c", true)),
            PushOutcome::AcceptedEvictingOldest
        );
        assert_eq!(buffer.pop().map(|i| i.name), Some("b"));
        assert_eq!(buffer.pop().map(|i| i.name), Some("c"));
        assert!(buffer.is_empty());
    }

    fn object(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn delta(kind: &str, index: u64, text: &str) -> Payload {
        object(json!({
            "type": "message_update",
            "message": {"timestamp": 1},
            "assistantMessageEvent": {"type": kind, "contentIndex": index, "delta": text}
        }))
    }

    #[test]
    fn classifies_agent_events() {
        assert!(!agent_event_is_critical(&delta("text_delta", 0, "x")));
        assert!(!agent_event_is_critical(&object(
            json!({"type": "tool_execution_update"})
        )));
        assert!(agent_event_is_critical(&object(json!({"type": "agent_end"}))));
        assert!(agent_event_is_critical(&object(
            json!({"type": "tool_execution_start"})
        )));
        let mut end = delta("text_end", 0, "");
        end.remove("delta");
        assert!(agent_event_is_critical(&end));
    }

    #[test]
    fn merges_consecutive_deltas_for_same_slot() {
        let mut buffer = BackpressureBuffer::new(8, agent_event_is_critical)
            .with_coalescing(coalesce_agent_deltas);
        buffer.push(delta("text_delta", 0, "He"));
        assert_eq!(
            buffer.push(delta("text_delta", 0, "llo")),
            PushOutcome::Coalesced
        );
        assert_eq!(
            buffer.push(delta("thinking_delta", 0, "hm")),
            PushOutcome::Accepted
        );
        assert_eq!(
            buffer.push(delta("text_delta", 1, "x")),
            PushOutcome::Accepted
        );

        let first = buffer.pop().unwrap();
        assert_eq!(first["assistantMessageEvent"]["delta"], "Hello");
        assert_eq!(buffer.len(), 2);
    }
}
