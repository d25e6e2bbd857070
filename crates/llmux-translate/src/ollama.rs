//! Ollama dialect adapters.
//!
//! Ollama requests are first flattened into OpenAI chat-completions form and
//! then take the normal OpenAI path into the canonical Claude shape. Ollama is
//! never an upstream, so only the response direction out of Claude exists.

use llmux_protocol::claude;
use llmux_protocol::ollama;
use llmux_protocol::openai;

use crate::now_rfc3339;

pub fn chat_request_to_openai(request: ollama::ChatRequest) -> openai::ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        if !system.is_empty() {
            messages.push(openai::ChatMessage::text("system", system.clone()));
        }
    }
    for message in &request.messages {
        match message.images.as_deref() {
            Some(images) if !images.is_empty() => {
                let mut parts = vec![openai::ContentPart::Text {
                    text: message.content.clone(),
                }];
                for image in images {
                    parts.push(openai::ContentPart::ImageUrl {
                        image_url: openai::ImageUrl {
                            url: format!("data:image/png;base64,{image}"),
                        },
                    });
                }
                messages.push(openai::ChatMessage {
                    role: message.role.clone(),
                    content: Some(openai::ChatContent::Parts(parts)),
                    tool_calls: None,
                    tool_call_id: None,
                    name: None,
                });
            }
            _ => messages.push(openai::ChatMessage::text(&message.role, message.content.clone())),
        }
    }

    let options = request.options.unwrap_or_default();
    openai::ChatCompletionRequest {
        model: request.model,
        messages,
        tools: None,
        tool_choice: None,
        temperature: options.temperature,
        top_p: options.top_p,
        max_tokens: options.num_predict,
        max_completion_tokens: None,
        stop: options.stop.map(openai::StopConfig::Many),
        stream: request.stream,
    }
}

pub fn generate_request_to_openai(request: ollama::GenerateRequest) -> openai::ChatCompletionRequest {
    let chat = ollama::ChatRequest {
        model: request.model,
        messages: vec![ollama::ChatMessage {
            role: "user".to_string(),
            content: request.prompt,
            images: None,
        }],
        system: request.system,
        options: request.options,
        stream: request.stream,
    };
    chat_request_to_openai(chat)
}

/// Render the canonical request back as an Ollama chat request.
pub fn chat_request_from_claude(request: claude::MessagesRequest) -> ollama::ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(ollama::ChatMessage {
            role: "system".to_string(),
            content: system.joined_text(),
            images: None,
        });
    }
    for message in &request.messages {
        let role = match message.role {
            claude::Role::User => "user",
            claude::Role::Assistant => "assistant",
        };
        messages.push(ollama::ChatMessage {
            role: role.to_string(),
            content: message.content.joined_text(),
            images: None,
        });
    }

    let options = ollama::ModelOptions {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        num_predict: request.max_tokens,
        stop: request.stop_sequences,
    };
    let has_options = options.temperature.is_some()
        || options.top_p.is_some()
        || options.top_k.is_some()
        || options.num_predict.is_some()
        || options.stop.is_some();

    ollama::ChatRequest {
        model: request.model,
        messages,
        system: None,
        options: has_options.then_some(options),
        stream: request.stream,
    }
}

fn done_reason(stop_reason: Option<claude::StopReason>) -> String {
    match stop_reason {
        Some(claude::StopReason::MaxTokens) => "length".to_string(),
        _ => "stop".to_string(),
    }
}

pub fn chat_response_from_claude(response: &claude::MessagesResponse) -> ollama::ChatResponse {
    let mut text = String::new();
    for block in &response.content {
        if let claude::ContentBlock::Text { text: value } = block {
            text.push_str(value);
        }
    }
    ollama::ChatResponse {
        model: response.model.clone(),
        created_at: now_rfc3339(),
        message: ollama::ChatMessage {
            role: "assistant".to_string(),
            content: text,
            images: None,
        },
        done: true,
        done_reason: Some(done_reason(response.stop_reason)),
        total_duration: 0,
        load_duration: 0,
        prompt_eval_count: response.usage.input_tokens,
        prompt_eval_duration: 0,
        eval_count: response.usage.output_tokens,
        eval_duration: 0,
    }
}

pub fn generate_response_from_claude(response: &claude::MessagesResponse) -> ollama::GenerateResponse {
    let chat = chat_response_from_claude(response);
    ollama::GenerateResponse {
        model: chat.model,
        created_at: chat.created_at,
        response: chat.message.content,
        done: true,
        done_reason: chat.done_reason,
        total_duration: 0,
        load_duration: 0,
        prompt_eval_count: chat.prompt_eval_count,
        prompt_eval_duration: 0,
        eval_count: chat.eval_count,
        eval_duration: 0,
    }
}

// ---- Streams ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OllamaStreamKind {
    Chat,
    Generate,
}

/// Claude stream events rendered as Ollama NDJSON frames.
#[derive(Debug)]
pub struct ClaudeToOllamaStream {
    kind: OllamaStreamKind,
    model: String,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<claude::StopReason>,
    done_emitted: bool,
}

impl ClaudeToOllamaStream {
    pub fn new(kind: OllamaStreamKind, model: &str) -> Self {
        Self {
            kind,
            model: model.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
            done_emitted: false,
        }
    }

    /// Returns NDJSON lines (each already newline-terminated).
    pub fn push_event(&mut self, event: claude::StreamEvent) -> Vec<String> {
        match event {
            claude::StreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
                if !message.model.is_empty() {
                    self.model = message.model;
                }
                Vec::new()
            }
            claude::StreamEvent::ContentBlockDelta {
                delta: claude::ContentDelta::TextDelta { text },
                ..
            } => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![self.delta_frame(text)]
                }
            }
            claude::StreamEvent::MessageDelta { delta, usage } => {
                self.stop_reason = delta.stop_reason;
                if let Some(usage) = usage {
                    self.output_tokens = usage.output_tokens;
                }
                Vec::new()
            }
            claude::StreamEvent::MessageStop => vec![self.final_frame()],
            _ => Vec::new(),
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        if self.done_emitted {
            Vec::new()
        } else {
            vec![self.final_frame()]
        }
    }

    fn delta_frame(&self, text: String) -> String {
        let frame = match self.kind {
            OllamaStreamKind::Chat => serde_json::json!({
                "model": self.model,
                "created_at": now_rfc3339(),
                "message": {"role": "assistant", "content": text},
                "done": false,
            }),
            OllamaStreamKind::Generate => serde_json::json!({
                "model": self.model,
                "created_at": now_rfc3339(),
                "response": text,
                "done": false,
            }),
        };
        format!("{frame}\n")
    }

    fn final_frame(&mut self) -> String {
        self.done_emitted = true;
        let done_reason = done_reason(self.stop_reason);
        let frame = match self.kind {
            OllamaStreamKind::Chat => serde_json::json!({
                "model": self.model,
                "created_at": now_rfc3339(),
                "message": {"role": "assistant", "content": ""},
                "done": true,
                "done_reason": done_reason,
                "total_duration": 0,
                "load_duration": 0,
                "prompt_eval_count": self.input_tokens,
                "prompt_eval_duration": 0,
                "eval_count": self.output_tokens,
                "eval_duration": 0,
            }),
            OllamaStreamKind::Generate => serde_json::json!({
                "model": self.model,
                "created_at": now_rfc3339(),
                "response": "",
                "done": true,
                "done_reason": done_reason,
                "total_duration": 0,
                "load_duration": 0,
                "prompt_eval_count": self.input_tokens,
                "prompt_eval_duration": 0,
                "eval_count": self.output_tokens,
                "eval_duration": 0,
            }),
        };
        format!("{frame}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_flattens_system_and_options() {
        let request: ollama::ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "system": "S",
            "messages": [{"role": "user", "content": "hi"}],
            "options": {"temperature": 0.5, "num_predict": 100, "stop": ["END"]},
            "stream": true
        }))
        .unwrap();
        let openai_req = chat_request_to_openai(request);
        assert_eq!(openai_req.messages[0].role, "system");
        assert_eq!(openai_req.messages[1].role, "user");
        assert_eq!(openai_req.temperature, Some(0.5));
        assert_eq!(openai_req.max_tokens, Some(100));
        assert_eq!(openai_req.stream, Some(true));
        assert!(matches!(
            openai_req.stop,
            Some(openai::StopConfig::Many(ref v)) if v == &["END".to_string()]
        ));
    }

    #[test]
    fn generate_request_becomes_single_user_turn() {
        let request: ollama::GenerateRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "prompt": "p"
        }))
        .unwrap();
        let openai_req = generate_request_to_openai(request);
        assert_eq!(openai_req.messages.len(), 1);
        assert_eq!(
            openai_req.messages[0].content.as_ref().unwrap().joined_text(),
            "p"
        );
    }

    #[test]
    fn stream_frames_carry_done_flag() {
        let mut state = ClaudeToOllamaStream::new(OllamaStreamKind::Chat, "m");
        let frames = state.push_event(claude::StreamEvent::ContentBlockDelta {
            index: 0,
            delta: claude::ContentDelta::TextDelta {
                text: "hi".to_string(),
            },
        });
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["done"], false);
        assert_eq!(frame["message"]["content"], "hi");

        state.push_event(claude::StreamEvent::MessageDelta {
            delta: claude::MessageDeltaBody {
                stop_reason: Some(claude::StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Some(claude::DeltaUsage { output_tokens: 1 }),
        });
        let frames = state.push_event(claude::StreamEvent::MessageStop);
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["done"], true);
        assert_eq!(frame["done_reason"], "stop");
        assert_eq!(frame["eval_count"], 1);
        assert!(state.finish().is_empty());
    }
}
