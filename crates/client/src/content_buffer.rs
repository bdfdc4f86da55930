//! Bounded storage for streamed assistant content.
//!
//! Each `(message key, content slot)` holds one text and one thinking
//! accumulator. Content is tail-truncated at a character limit, small
//! appends are compacted into a single string, and the number of tracked
//! messages is capped with first-use order eviction.

use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    /// Characters kept per accumulator; older characters are discarded.
    pub max_chars: usize,
    /// Pending fragments that trigger compaction.
    pub compact_after: usize,
    /// Messages tracked before the oldest is evicted.
    pub max_messages: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_chars: 256 * 1024,
            compact_after: 64,
            max_messages: 32,
        }
    }
}

/// Append-mostly string with tail-preserving truncation.
#[derive(Debug, Clone)]
pub struct BoundedText {
    max_chars: usize,
    compact_after: usize,
    head: String,
    head_chars: usize,
    fragments: Vec<String>,
    fragment_chars: usize,
    truncated: bool,
}

impl BoundedText {
    pub fn new(max_chars: usize, compact_after: usize) -> Self {
        Self {
            max_chars,
            compact_after: compact_after.max(1),
            head: String::new(),
            head_chars: 0,
            fragments: Vec::new(),
            fragment_chars: 0,
            truncated: false,
        }
    }

    pub fn append(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.fragment_chars += fragment.chars().count();
        self.fragments.push(fragment.to_string());

        if self.fragments.len() >= self.compact_after || self.char_len() > self.max_chars {
            self.compact();
        }
    }

    /// Replace the whole value.
    pub fn set(&mut self, value: &str) {
        self.clear();
        self.append(value);
        self.compact();
    }

    pub fn clear(&mut self) {
        self.head.clear();
        self.head_chars = 0;
        self.fragments.clear();
        self.fragment_chars = 0;
        self.truncated = false;
    }

    /// Fold pending fragments into the head and enforce the length limit.
    pub fn compact(&mut self) {
        for fragment in self.fragments.drain(..) {
            self.head.push_str(&fragment);
        }
        self.head_chars += self.fragment_chars;
        self.fragment_chars = 0;

        if self.head_chars > self.max_chars {
            let excess = self.head_chars - self.max_chars;
            let cut = self
                .head
                .char_indices()
                .nth(excess)
                .map_or(self.head.len(), |(index, _)| index);
            self.head.drain(..cut);
            self.head_chars = self.max_chars;
            self.truncated = true;
        }
    }

    pub fn char_len(&self) -> usize {
        self.head_chars + self.fragment_chars
    }

    pub fn is_empty(&self) -> bool {
        self.char_len() == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn pending_fragments(&self) -> usize {
        self.fragments.len()
    }

    pub fn value(&mut self) -> &str {
        self.compact();
        &self.head
    }
}

/// One accumulator: bounded content plus its own completion flag.
#[derive(Debug, Clone)]
pub struct Accumulator {
    pub content: BoundedText,
    pub started: bool,
    pub complete: bool,
}

impl Accumulator {
    fn new(limits: &BufferLimits) -> Self {
        Self {
            content: BoundedText::new(limits.max_chars, limits.compact_after),
            started: false,
            complete: false,
        }
    }

    fn snapshot(&mut self) -> Option<String> {
        if !self.started && self.content.is_empty() {
            return None;
        }
        Some(self.content.value().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SlotBuffers {
    pub text: Accumulator,
    pub thinking: Accumulator,
}

impl SlotBuffers {
    fn new(limits: &BufferLimits) -> Self {
        Self {
            text: Accumulator::new(limits),
            thinking: Accumulator::new(limits),
        }
    }

    pub fn snapshot(&mut self) -> AssistantContentSnapshot {
        AssistantContentSnapshot {
            text: self.text.snapshot(),
            thinking: self.thinking.snapshot(),
            text_complete: self.text.complete,
            thinking_complete: self.thinking.complete,
            truncated: self.text.content.is_truncated() || self.thinking.content.is_truncated(),
        }
    }
}

/// What the presentation layer renders for one content slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistantContentSnapshot {
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub text_complete: bool,
    pub thinking_complete: bool,
    pub truncated: bool,
}

/// Per-message content slots with a cap on tracked messages.
#[derive(Debug)]
pub struct MessageContentBuffer {
    limits: BufferLimits,
    order: VecDeque<String>,
    messages: HashMap<String, BTreeMap<usize, SlotBuffers>>,
}

impl MessageContentBuffer {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            limits: BufferLimits {
                max_messages: limits.max_messages.max(1),
                ..limits
            },
            order: VecDeque::new(),
            messages: HashMap::new(),
        }
    }

    pub fn limits(&self) -> &BufferLimits {
        &self.limits
    }

    /// Slot for `(key, slot)`, creating it and evicting the oldest message
    /// when a new key pushes the count over the cap.
    pub fn slot_mut(&mut self, key: &str, slot: usize) -> &mut SlotBuffers {
        if !self.messages.contains_key(key) {
            while self.order.len() >= self.limits.max_messages {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.messages.remove(&oldest);
                tracing::debug!(
                    component = "client",
                    event = "client.content_buffer.evicted",
                    message_key = %oldest,
                    "Evicted oldest message content"
                );
            }
            self.order.push_back(key.to_string());
        }
        let limits = self.limits;
        self.messages
            .entry(key.to_string())
            .or_default()
            .entry(slot)
            .or_insert_with(|| SlotBuffers::new(&limits))
    }

    pub fn snapshot(&mut self, key: &str, slot: usize) -> Option<AssistantContentSnapshot> {
        self.messages
            .get_mut(key)?
            .get_mut(&slot)
            .map(SlotBuffers::snapshot)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.messages.contains_key(key)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn remove(&mut self, key: &str) {
        if self.messages.remove(key).is_some() {
            self.order.retain(|existing| existing != key);
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.messages.clear();
    }
}

impl Default for MessageContentBuffer {
    fn default() -> Self {
        Self::new(BufferLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_most_recent_characters() {
        let mut text = BoundedText::new(10, 64);
        text.append("0123456789ABCDEF");
        assert_eq!(text.value(), "6789ABCDEF");
        assert_eq!(text.char_len(), 10);
        assert!(text.is_truncated());
    }

    #[test]
    fn truncation_spans_many_small_appends() {
        let mut text = BoundedText::new(4, 64);
        for piece in ["ab", "cd", "ef"] {
            text.append(piece);
        }
        assert_eq!(text.value(), "cdef");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut text = BoundedText::new(3, 64);
        text.append("héllo→");
        assert_eq!(text.value(), "lo→");
    }

    #[test]
    fn compacts_after_threshold() {
        let mut text = BoundedText::new(1000, 4);
        for _ in 0..3 {
            text.append("x");
        }
        assert_eq!(text.pending_fragments(), 3);
        text.append("x");
        assert_eq!(text.pending_fragments(), 0);
        assert_eq!(text.value(), "xxxx");
    }

    #[test]
    fn set_replaces_and_clears_truncation() {
        let mut text = BoundedText::new(5, 8);
        text.append("0123456789");
        assert!(text.is_truncated());
        text.set("done");
        assert_eq!(text.value(), "done");
        assert!(!text.is_truncated());
    }

    #[test]
    fn evicts_oldest_message_by_first_use() {
        let mut buffer = MessageContentBuffer::new(BufferLimits {
            max_messages: 2,
            ..BufferLimits::default()
        });
        buffer.slot_mut("m1", 0).text.content.append("one");
        buffer.slot_mut("m2", 0).text.content.append("two");
        // Touching m1 again does not refresh its position.
        buffer.slot_mut("m1", 1).text.content.append("uno");
        buffer.slot_mut("m3", 0).text.content.append("three");

        assert!(!buffer.contains("m1"));
        assert!(buffer.contains("m2"));
        assert!(buffer.contains("m3"));
        assert_eq!(buffer.message_count(), 2);
    }

    #[test]
    fn snapshot_reports_only_touched_accumulators() {
        let mut buffer = MessageContentBuffer::default();
        let slot = buffer.slot_mut("m", 0);
        slot.text.started = true;
        slot.text.content.append("hi");

        let snapshot = buffer.snapshot("m", 0).unwrap();
        assert_eq!(snapshot.text.as_deref(), Some("hi"));
        assert_eq!(snapshot.thinking, None);
        assert!(buffer.snapshot("m", 7).is_none());
    }
}
