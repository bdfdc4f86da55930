//! Streaming reassembly of assistant text and thinking.
//!
//! The agent streams `message_update` events whose `assistantMessageEvent`
//! carries `text_start`/`text_delta`/`text_end` (and the `thinking_*`
//! equivalents) for a `contentIndex`. Each kind drives its own accumulator
//! and its own completion flag.

use agentbridge_protocol::agent::payload_type;
use agentbridge_protocol::Payload;
use serde_json::Value;

use crate::content_buffer::{Accumulator, AssistantContentSnapshot, BufferLimits, MessageContentBuffer};

pub const MESSAGE_UPDATE: &str = "message_update";

const FALLBACK_MESSAGE_KEY: &str = "current";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Text,
    Thinking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentKind {
    Start,
    Delta(String),
    /// Optional authoritative final value.
    End(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_key: String,
    pub slot: usize,
    pub content: ContentKind,
    pub kind: FragmentKind,
}

impl Fragment {
    /// Extract a fragment from a data-channel event, if it is one.
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        if payload_type(payload) != Some(MESSAGE_UPDATE) {
            return None;
        }
        let event = payload.get("assistantMessageEvent")?.as_object()?;
        let (content, phase) = match event.get("type")?.as_str()? {
            "text_start" => (ContentKind::Text, "start"),
            "text_delta" => (ContentKind::Text, "delta"),
            "text_end" => (ContentKind::Text, "end"),
            "thinking_start" => (ContentKind::Thinking, "start"),
            "thinking_delta" => (ContentKind::Thinking, "delta"),
            "thinking_end" => (ContentKind::Thinking, "end"),
            _ => return None,
        };
        let text_field = |name: &str| event.get(name).and_then(Value::as_str).map(str::to_string);
        let kind = match phase {
            "start" => FragmentKind::Start,
            "delta" => FragmentKind::Delta(text_field("delta").unwrap_or_default()),
            _ => FragmentKind::End(text_field("content")),
        };
        let slot = event
            .get("contentIndex")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;

        Some(Self {
            message_key: message_key(payload),
            slot,
            content,
            kind,
        })
    }
}

/// Where a fragment landed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentTarget {
    pub message_key: String,
    pub slot: usize,
    pub content: ContentKind,
}

/// Stable key for the message an update belongs to.
pub fn message_key(payload: &Payload) -> String {
    let Some(message) = payload.get("message").and_then(Value::as_object) else {
        return FALLBACK_MESSAGE_KEY.to_string();
    };
    match (message.get("id"), message.get("timestamp")) {
        (Some(Value::String(id)), _) => id.clone(),
        (_, Some(Value::Number(ts))) => ts.to_string(),
        (_, Some(Value::String(ts))) => ts.clone(),
        _ => FALLBACK_MESSAGE_KEY.to_string(),
    }
}

/// What one fragment did to its accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUpdate {
    Started,
    Appended(String),
    /// `replaced` is set when the end event carried a final value that
    /// overwrote the accumulated deltas.
    Completed { replaced: bool },
}

fn apply_to(accumulator: &mut Accumulator, kind: FragmentKind) -> StreamUpdate {
    accumulator.started = true;
    match kind {
        FragmentKind::Start => {
            accumulator.content.clear();
            accumulator.complete = false;
            StreamUpdate::Started
        }
        FragmentKind::Delta(delta) => {
            accumulator.content.append(&delta);
            StreamUpdate::Appended(delta)
        }
        FragmentKind::End(final_value) => {
            accumulator.complete = true;
            match final_value {
                Some(value) => {
                    accumulator.content.set(&value);
                    StreamUpdate::Completed { replaced: true }
                }
                None => StreamUpdate::Completed { replaced: false },
            }
        }
    }
}

/// Folds fragments into bounded per-message buffers.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    buffer: MessageContentBuffer,
}

impl StreamReassembler {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            buffer: MessageContentBuffer::new(limits),
        }
    }

    /// Fold one fragment in. Only the fragment's own effect is returned;
    /// the accumulated value is read with [`StreamReassembler::snapshot`].
    pub fn apply(&mut self, fragment: Fragment) -> StreamUpdate {
        let slot = self.buffer.slot_mut(&fragment.message_key, fragment.slot);
        let accumulator = match fragment.content {
            ContentKind::Text => &mut slot.text,
            ContentKind::Thinking => &mut slot.thinking,
        };
        apply_to(accumulator, fragment.kind)
    }

    /// Apply a raw data-channel event when it is a text or thinking update.
    pub fn apply_payload(&mut self, payload: &Payload) -> Option<(FragmentTarget, StreamUpdate)> {
        let fragment = Fragment::from_payload(payload)?;
        let target = FragmentTarget {
            message_key: fragment.message_key.clone(),
            slot: fragment.slot,
            content: fragment.content,
        };
        Some((target, self.apply(fragment)))
    }

    pub fn snapshot(&mut self, message_key: &str, slot: usize) -> Option<AssistantContentSnapshot> {
        self.buffer.snapshot(message_key, slot)
    }

    /// Forget everything, e.g. after a resync replaced the history.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fragment(content: ContentKind, kind: FragmentKind) -> Fragment {
        Fragment {
            message_key: "m1".into(),
            slot: 0,
            content,
            kind,
        }
    }

    fn feed(reassembler: &mut StreamReassembler, end: Option<&str>) -> AssistantContentSnapshot {
        reassembler.apply(fragment(ContentKind::Text, FragmentKind::Start));
        reassembler.apply(fragment(ContentKind::Text, FragmentKind::Delta("He".into())));
        reassembler.apply(fragment(ContentKind::Text, FragmentKind::Delta("llo".into())));
        reassembler.apply(fragment(
            ContentKind::Text,
            FragmentKind::End(end.map(str::to_string)),
        ));
        reassembler.snapshot("m1", 0).unwrap()
    }

    #[test]
    fn deltas_accumulate_until_end() {
        let mut reassembler = StreamReassembler::default();
        let snapshot = feed(&mut reassembler, None);
        assert_eq!(snapshot.text.as_deref(), Some("Hello"));
        assert!(snapshot.text_complete);
    }

    #[test]
    fn authoritative_end_overrides_deltas() {
        let mut reassembler = StreamReassembler::default();
        let snapshot = feed(&mut reassembler, Some("Goodbye"));
        assert_eq!(snapshot.text.as_deref(), Some("Goodbye"));
    }

    #[test]
    fn text_and_thinking_complete_independently() {
        let mut reassembler = StreamReassembler::default();
        reassembler.apply(fragment(ContentKind::Thinking, FragmentKind::Start));
        reassembler.apply(fragment(
            ContentKind::Thinking,
            FragmentKind::Delta("hmm".into()),
        ));
        let update = reassembler.apply(fragment(ContentKind::Thinking, FragmentKind::End(None)));
        assert_eq!(update, StreamUpdate::Completed { replaced: false });
        let snapshot = reassembler.snapshot("m1", 0).unwrap();
        assert!(snapshot.thinking_complete);
        assert!(!snapshot.text_complete);
        assert_eq!(snapshot.text, None);

        let snapshot = feed(&mut reassembler, None);
        assert!(snapshot.text_complete);
        assert_eq!(snapshot.thinking.as_deref(), Some("hmm"));
    }

    #[test]
    fn start_resets_previous_content() {
        let mut reassembler = StreamReassembler::default();
        feed(&mut reassembler, None);
        let update = reassembler.apply(fragment(ContentKind::Text, FragmentKind::Start));
        assert_eq!(update, StreamUpdate::Started);
        let snapshot = reassembler.snapshot("m1", 0).unwrap();
        assert_eq!(snapshot.text.as_deref(), Some(""));
        assert!(!snapshot.text_complete);
    }

    #[test]
    fn parses_agent_message_updates() {
        let payload = json!({
            "type": "message_update",
            "message": {"role": "assistant", "timestamp": 1700000000123u64},
            "assistantMessageEvent": {"type": "text_delta", "contentIndex": 2, "delta": "Hi"}
        });
        let Value::Object(payload) = payload else { unreachable!() };
        let fragment = Fragment::from_payload(&payload).unwrap();
        assert_eq!(fragment.message_key, "1700000000123");
        assert_eq!(fragment.slot, 2);
        assert_eq!(fragment.content, ContentKind::Text);
        assert_eq!(fragment.kind, FragmentKind::Delta("Hi".into()));

        let Value::Object(tool) = json!({
            "type": "message_update",
            "assistantMessageEvent": {"type": "toolcall_delta", "delta": "{"}
        }) else {
            unreachable!()
        };
        assert!(Fragment::from_payload(&tool).is_none());
    }

    #[test]
    fn end_event_content_is_authoritative() {
        let Value::Object(payload) = json!({
            "type": "message_update",
            "message": {"id": "abc"},
            "assistantMessageEvent": {"type": "thinking_end", "contentIndex": 0, "content": "final"}
        }) else {
            unreachable!()
        };
        let mut reassembler = StreamReassembler::default();
        let (target, update) = reassembler.apply_payload(&payload).unwrap();
        assert_eq!(target.message_key, "abc");
        assert_eq!(target.content, ContentKind::Thinking);
        assert_eq!(update, StreamUpdate::Completed { replaced: true });
        let snapshot = reassembler.snapshot("abc", 0).unwrap();
        assert_eq!(snapshot.thinking.as_deref(), Some("final"));
        assert!(snapshot.thinking_complete);
    }

    #[test]
    fn deltas_stay_pending_until_compaction_threshold() {
        let limits = BufferLimits::default();
        let mut reassembler = StreamReassembler::new(limits);
        let deltas = limits.compact_after - 1;
        reassembler.apply(fragment(ContentKind::Text, FragmentKind::Start));
        for i in 0..deltas {
            let update =
                reassembler.apply(fragment(ContentKind::Text, FragmentKind::Delta(format!("{i} "))));
            assert_eq!(update, StreamUpdate::Appended(format!("{i} ")));
        }
        let slot = reassembler.buffer.slot_mut("m1", 0);
        assert_eq!(slot.text.content.pending_fragments(), deltas);

        // One more delta folds everything into a single string.
        reassembler.apply(fragment(ContentKind::Text, FragmentKind::Delta("!".into())));
        let slot = reassembler.buffer.slot_mut("m1", 0);
        assert_eq!(slot.text.content.pending_fragments(), 0);
        let text = reassembler.snapshot("m1", 0).unwrap().text.unwrap();
        assert!(text.starts_with("0 1 2 "));
        assert!(text.ends_with("!"));
    }
}
