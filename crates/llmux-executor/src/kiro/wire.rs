//! JSON record recognizer for the CodeWhisperer event stream.
//!
//! The upstream envelope is a binary event stream whose headers are not worth
//! parsing; the embedded JSON records are reliably delimited, so the
//! recognizer scans for known leading patterns and extracts each record with
//! a brace-balanced, string-aware walk. Incomplete records stay buffered for
//! the next read.

use serde_json::Value as JsonValue;

/// Leading byte patterns that start an embedded record.
const PATTERNS: [&[u8]; 5] = [
    b"{\"content\":",
    b"{\"name\":",
    b"{\"followupPrompt\":",
    b"{\"input\":",
    b"{\"stop\":",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Assistant text delta.
    Content(String),
    /// Structured tool-use start; may carry inline input and stop.
    ToolUse {
        name: String,
        tool_use_id: String,
        input: String,
        stop: bool,
    },
    /// Tool-input continuation (no name field).
    ToolInput(String),
    /// Tool-use terminator (stop with no name).
    ToolStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Idle,
    InJson,
    InString,
    Escape,
}

/// Restartable recognizer: leftover bytes from one `push` are re-scanned
/// when the next chunk arrives.
#[derive(Debug, Default)]
pub struct EventRecognizer {
    buffer: Vec<u8>,
}

impl EventRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<WireEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut cursor = 0usize;

        loop {
            let Some(start) = earliest_pattern(&self.buffer[cursor..]) else {
                cursor = self.buffer.len();
                break;
            };
            let start = cursor + start;

            match balanced_end(&self.buffer[start..]) {
                Some(len) => {
                    let record = &self.buffer[start..start + len];
                    if let Ok(parsed) = serde_json::from_slice::<JsonValue>(record) {
                        if let Some(event) = classify(&parsed) {
                            events.push(event);
                        }
                    }
                    cursor = start + len;
                }
                None => {
                    // Incomplete record: keep it for the next read.
                    cursor = start;
                    break;
                }
            }
        }

        self.buffer.drain(..cursor);
        events
    }

    /// Bytes still waiting for completion.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn earliest_pattern(haystack: &[u8]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for pattern in PATTERNS {
        if let Some(pos) = find_subslice(haystack, pattern) {
            best = Some(match best {
                Some(current) if current <= pos => current,
                _ => pos,
            });
        }
    }
    best
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the balanced JSON object starting at `bytes[0]`, or None if the
/// record is still incomplete. Four states: idle, in-json, in-string, escape.
fn balanced_end(bytes: &[u8]) -> Option<usize> {
    let mut state = ScanState::Idle;
    let mut depth = 0usize;

    for (i, &byte) in bytes.iter().enumerate() {
        state = match state {
            ScanState::Idle | ScanState::InJson => match byte {
                b'"' => ScanState::InString,
                b'{' => {
                    depth += 1;
                    ScanState::InJson
                }
                b'}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(i + 1);
                    }
                    ScanState::InJson
                }
                _ => ScanState::InJson,
            },
            ScanState::InString => match byte {
                b'\\' => ScanState::Escape,
                b'"' => ScanState::InJson,
                _ => ScanState::InString,
            },
            ScanState::Escape => ScanState::InString,
        };
    }
    None
}

fn classify(record: &JsonValue) -> Option<WireEvent> {
    if let Some(content) = record.get("content").and_then(|v| v.as_str()) {
        if record.get("followupPrompt").is_some() {
            return None;
        }
        return Some(WireEvent::Content(content.to_string()));
    }

    if let Some(name) = record.get("name").and_then(|v| v.as_str()) {
        let tool_use_id = record.get("toolUseId").and_then(|v| v.as_str())?;
        return Some(WireEvent::ToolUse {
            name: name.to_string(),
            tool_use_id: tool_use_id.to_string(),
            input: record
                .get("input")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            stop: record.get("stop").and_then(|v| v.as_bool()).unwrap_or(false),
        });
    }

    if let Some(input) = record.get("input").and_then(|v| v.as_str()) {
        return Some(WireEvent::ToolInput(input.to_string()));
    }

    if record.get("stop").and_then(|v| v.as_bool()) == Some(true) {
        return Some(WireEvent::ToolStop);
    }

    None
}
