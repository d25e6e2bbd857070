//! Live stream translation between dialects.

use bytes::Bytes;
use llmux_protocol::claude;
use llmux_protocol::{SseEvent, SseParser};

use crate::gemini_claude::{ClaudeToGeminiStream, GeminiToClaudeStream};
use crate::ollama::{ClaudeToOllamaStream, OllamaStreamKind};
use crate::openai_claude::{ClaudeToOpenAiStream, OpenAiToClaudeStream};
use crate::Dialect;

enum Decoder {
    Claude,
    OpenAi(OpenAiToClaudeStream),
    Gemini(GeminiToClaudeStream),
}

enum Renderer {
    Claude,
    OpenAi(ClaudeToOpenAiStream),
    Gemini(ClaudeToGeminiStream),
    Ollama(ClaudeToOllamaStream),
}

/// Incremental translator from an upstream stream dialect into the caller's
/// dialect. Feed raw upstream bytes in, collect ready-to-flush frames out.
///
/// Every delta the upstream produced is either re-emitted in the source
/// dialect or held in accumulator state until a later frame completes it;
/// nothing is dropped.
pub struct StreamTranslator {
    sse: SseParser,
    decoder: Decoder,
    renderer: Renderer,
    finished: bool,
}

impl StreamTranslator {
    pub fn new(upstream: Dialect, source: Dialect, model: &str) -> Self {
        let decoder = match upstream {
            Dialect::Claude => Decoder::Claude,
            Dialect::OpenAiChat => Decoder::OpenAi(OpenAiToClaudeStream::new()),
            Dialect::Gemini => Decoder::Gemini(GeminiToClaudeStream::new(model)),
            // Ollama is never an upstream; treat its frames as opaque Claude SSE.
            Dialect::OllamaChat | Dialect::OllamaGenerate => Decoder::Claude,
        };
        let renderer = match source {
            Dialect::Claude => Renderer::Claude,
            Dialect::OpenAiChat => Renderer::OpenAi(ClaudeToOpenAiStream::new(model)),
            Dialect::Gemini => Renderer::Gemini(ClaudeToGeminiStream::new(model)),
            Dialect::OllamaChat => {
                Renderer::Ollama(ClaudeToOllamaStream::new(OllamaStreamKind::Chat, model))
            }
            Dialect::OllamaGenerate => {
                Renderer::Ollama(ClaudeToOllamaStream::new(OllamaStreamKind::Generate, model))
            }
        };
        Self {
            sse: SseParser::new(),
            decoder,
            renderer,
            finished: false,
        }
    }

    /// Feed an upstream chunk, returning frames ready to be flushed downstream.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let text = match std::str::from_utf8(chunk) {
            Ok(text) => text.to_owned(),
            Err(_) => return Vec::new(),
        };
        let events = self.sse.push_str(&text);
        self.translate_events(events)
    }

    /// Flush buffered state at end of stream.
    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let pending = self.sse.finish();
        let mut out = self.translate_events(pending);
        let tail = match &mut self.decoder {
            Decoder::Claude => Vec::new(),
            Decoder::OpenAi(state) => state.finish(),
            Decoder::Gemini(state) => state.finish(),
        };
        for event in tail {
            out.extend(self.render_event(event));
        }
        if let Renderer::Ollama(state) = &mut self.renderer {
            for frame in state.finish() {
                out.push(Bytes::from(frame));
            }
        }
        out
    }

    fn translate_events(&mut self, events: Vec<SseEvent>) -> Vec<Bytes> {
        let mut out = Vec::new();
        for event in events {
            let canonical = self.decode_event(event);
            for item in canonical {
                out.extend(self.render_event(item));
            }
        }
        out
    }

    fn decode_event(&mut self, event: SseEvent) -> Vec<claude::StreamEvent> {
        match &mut self.decoder {
            Decoder::Claude => {
                match serde_json::from_str::<claude::StreamEvent>(&event.data) {
                    Ok(parsed) => vec![parsed],
                    Err(_) => Vec::new(),
                }
            }
            Decoder::OpenAi(state) => {
                if event.is_done() {
                    return state.finish();
                }
                match serde_json::from_str(&event.data) {
                    Ok(chunk) => state.push_chunk(chunk),
                    Err(_) => Vec::new(),
                }
            }
            Decoder::Gemini(state) => match serde_json::from_str(&event.data) {
                Ok(frame) => state.push_frame(frame),
                Err(_) => Vec::new(),
            },
        }
    }

    fn render_event(&mut self, event: claude::StreamEvent) -> Vec<Bytes> {
        match &mut self.renderer {
            Renderer::Claude => vec![Bytes::from(event.to_sse())],
            Renderer::OpenAi(state) => {
                let (chunks, done) = state.push_event(event);
                let mut out = Vec::with_capacity(chunks.len() + usize::from(done));
                for chunk in chunks {
                    if let Ok(json) = serde_json::to_string(&chunk) {
                        out.push(Bytes::from(format!("data: {json}\n\n")));
                    }
                }
                if done {
                    out.push(Bytes::from_static(b"data: [DONE]\n\n"));
                }
                out
            }
            Renderer::Gemini(state) => state
                .push_event(event)
                .into_iter()
                .filter_map(|frame| serde_json::to_string(&frame).ok())
                .map(|json| Bytes::from(format!("data: {json}\n\n")))
                .collect(),
            Renderer::Ollama(state) => state
                .push_event(event)
                .into_iter()
                .map(Bytes::from)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claude_sse(event: &claude::StreamEvent) -> String {
        event.to_sse()
    }

    fn sample_events() -> Vec<claude::StreamEvent> {
        vec![
            claude::StreamEvent::MessageStart {
                message: claude::MessageStart {
                    id: "msg_1".to_string(),
                    kind: "message".to_string(),
                    role: "assistant".to_string(),
                    model: "claude-sonnet-4-5".to_string(),
                    content: Vec::new(),
                    usage: claude::Usage {
                        input_tokens: 3,
                        output_tokens: 0,
                    },
                },
            },
            claude::StreamEvent::ContentBlockStart {
                index: 0,
                content_block: claude::StreamContentBlock::Text {
                    text: String::new(),
                },
            },
            claude::StreamEvent::ContentBlockDelta {
                index: 0,
                delta: claude::ContentDelta::TextDelta {
                    text: "Hel".to_string(),
                },
            },
            claude::StreamEvent::ContentBlockDelta {
                index: 0,
                delta: claude::ContentDelta::TextDelta {
                    text: "lo.".to_string(),
                },
            },
            claude::StreamEvent::ContentBlockStop { index: 0 },
            claude::StreamEvent::MessageDelta {
                delta: claude::MessageDeltaBody {
                    stop_reason: Some(claude::StopReason::EndTurn),
                    stop_sequence: None,
                },
                usage: Some(claude::DeltaUsage { output_tokens: 2 }),
            },
            claude::StreamEvent::MessageStop,
        ]
    }

    #[test]
    fn claude_to_openai_stream_terminates_with_done() {
        let mut translator =
            StreamTranslator::new(Dialect::Claude, Dialect::OpenAiChat, "claude-sonnet-4-5");
        let mut frames = Vec::new();
        for event in sample_events() {
            frames.extend(translator.push(claude_sse(&event).as_bytes()));
        }
        frames.extend(translator.finish());
        let text: Vec<String> = frames
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        assert_eq!(text.last().unwrap(), "data: [DONE]\n\n");
        // Stream-sum invariant: concatenated content deltas equal the full text.
        let mut total = String::new();
        for frame in &text {
            if let Some(json) = frame.strip_prefix("data: ") {
                if let Ok(chunk) =
                    serde_json::from_str::<llmux_protocol::openai::ChatCompletionChunk>(json.trim())
                {
                    if let Some(content) = &chunk.choices[0].delta.content {
                        total.push_str(content);
                    }
                }
            }
        }
        assert_eq!(total, "Hello.");
    }

    #[test]
    fn claude_to_ollama_stream_has_terminal_done_frame() {
        let mut translator =
            StreamTranslator::new(Dialect::Claude, Dialect::OllamaChat, "claude-sonnet-4-5");
        let mut frames = Vec::new();
        for event in sample_events() {
            frames.extend(translator.push(claude_sse(&event).as_bytes()));
        }
        frames.extend(translator.finish());
        let last: serde_json::Value =
            serde_json::from_slice(frames.last().unwrap()).unwrap();
        assert_eq!(last["done"], true);
        assert_eq!(last["eval_count"], 2);
        assert_eq!(last["prompt_eval_count"], 3);
    }

    #[test]
    fn claude_identity_stream_reemits_every_event() {
        let mut translator =
            StreamTranslator::new(Dialect::Claude, Dialect::Claude, "claude-sonnet-4-5");
        let mut frames = Vec::new();
        for event in sample_events() {
            frames.extend(translator.push(claude_sse(&event).as_bytes()));
        }
        frames.extend(translator.finish());
        assert_eq!(frames.len(), sample_events().len());
        let last = String::from_utf8(frames.last().unwrap().to_vec()).unwrap();
        assert!(last.starts_with("event: message_stop"));
    }

    #[test]
    fn openai_upstream_decodes_into_claude_frames() {
        let mut translator =
            StreamTranslator::new(Dialect::OpenAiChat, Dialect::Claude, "gpt-4o");
        let chunk = serde_json::json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"content": "hi"}, "finish_reason": null}]
        });
        let mut frames = translator.push(format!("data: {chunk}\n\n").as_bytes());
        frames.extend(translator.push(b"data: [DONE]\n\n"));
        frames.extend(translator.finish());
        let text: String = frames
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect();
        assert!(text.contains("event: message_start"));
        assert!(text.contains("event: content_block_delta"));
        assert!(text.contains("event: message_stop"));
    }

    #[test]
    fn partial_sse_chunks_are_buffered() {
        let mut translator =
            StreamTranslator::new(Dialect::Claude, Dialect::Claude, "claude-sonnet-4-5");
        let frame = claude_sse(&claude::StreamEvent::MessageStop);
        let (head, tail) = frame.split_at(10);
        assert!(translator.push(head.as_bytes()).is_empty());
        let frames = translator.push(tail.as_bytes());
        assert_eq!(frames.len(), 1);
    }
}
