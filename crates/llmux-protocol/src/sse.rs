//! Incremental server-sent-events parsing.
//!
//! Upstream chunks arrive on arbitrary byte boundaries; the parser buffers
//! partial lines and yields complete events as they close.

use bytes::Bytes;

/// The OpenAI-style terminal data payload.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_MARKER
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    pending: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.pending.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.find('\n') {
            let mut line = self.pending[..pos].to_string();
            self.pending.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.close_event(&mut events);
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = (!value.is_empty()).then(|| value.to_string());
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
                continue;
            }
            // Bare field names carry empty values.
            if line == "event" {
                self.event = None;
            } else if line == "data" {
                self.data_lines.push(String::new());
            }
        }

        events
    }

    /// Flush whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if !self.pending.is_empty() {
            let mut line = std::mem::take(&mut self.pending);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = (!value.is_empty()).then(|| value.to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            }
        }
        let mut events = Vec::new();
        self.close_event(&mut events);
        events
    }

    fn close_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_frames_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: message_start\nda").is_empty());
        let events = parser.push_str("ta: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn data_only_frames_and_done_marker() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: {\"x\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert!(events[0].event.is_none());
        assert!(!events[0].is_done());
        assert!(events[1].is_done());
    }

    #[test]
    fn comment_lines_are_skipped() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keepalive\ndata: 1\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "1");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }
}
