//! Gemini generateContent <-> Claude messages conversion.
//!
//! Gemini carries no tool-use ids on the wire. Function calls round-trip by
//! name: a Claude `tool_use` id surfaces as the functionCall name on the way
//! out, and function responses are matched back through the ids seen earlier
//! in the same request.

use std::collections::HashMap;

use llmux_protocol::claude;
use llmux_protocol::gemini;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub fn request_to_claude(model: &str, request: gemini::GenerateContentRequest) -> claude::MessagesRequest {
    let system = request
        .system_instruction
        .as_ref()
        .map(|content| claude::SystemPrompt::Text(content.joined_text()));

    let mut messages = Vec::new();
    for content in &request.contents {
        let role = match content.role.as_deref() {
            Some("model") => claude::Role::Assistant,
            _ => claude::Role::User,
        };
        let mut blocks = Vec::new();
        for part in &content.parts {
            if let Some(text) = &part.text {
                if !text.is_empty() {
                    blocks.push(claude::ContentBlock::Text { text: text.clone() });
                }
            }
            if let Some(blob) = &part.inline_data {
                blocks.push(claude::ContentBlock::Image {
                    source: claude::ImageSource::Base64 {
                        media_type: blob.mime_type.clone(),
                        data: blob.data.clone(),
                    },
                });
            }
            if let Some(call) = &part.function_call {
                blocks.push(claude::ContentBlock::ToolUse {
                    id: call.name.clone(),
                    name: call.name.clone(),
                    input: call.args.clone(),
                });
            }
            if let Some(response) = &part.function_response {
                blocks.push(claude::ContentBlock::ToolResult {
                    tool_use_id: response.name.clone(),
                    content: Some(claude::ToolResultContent::Text(function_response_text(
                        &response.response,
                    ))),
                    is_error: None,
                });
            }
        }
        messages.push(claude::Message {
            role,
            content: if blocks.len() == 1 {
                match &blocks[0] {
                    claude::ContentBlock::Text { text } => claude::MessageContent::Text(text.clone()),
                    _ => claude::MessageContent::Blocks(blocks),
                }
            } else {
                claude::MessageContent::Blocks(blocks)
            },
        });
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .flat_map(|tool| tool.function_declarations)
            .map(|decl| claude::Tool {
                name: decl.name,
                description: decl.description,
                input_schema: decl
                    .parameters
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            })
            .collect::<Vec<_>>()
    });

    let config = request.generation_config.unwrap_or_default();
    claude::MessagesRequest {
        model: model.to_string(),
        max_tokens: config.max_output_tokens,
        messages,
        system,
        tools,
        tool_choice: None,
        temperature: config.temperature,
        top_p: config.top_p,
        top_k: config.top_k,
        stop_sequences: config.stop_sequences,
        stream: None,
        metadata: None,
    }
}

fn function_response_text(response: &JsonValue) -> String {
    match response {
        JsonValue::String(text) => text.clone(),
        JsonValue::Object(map) => {
            if let Some(JsonValue::String(text)) = map.get("result").or_else(|| map.get("output")) {
                text.clone()
            } else {
                serde_json::to_string(response).unwrap_or_default()
            }
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

pub fn request_from_claude(request: claude::MessagesRequest) -> gemini::GenerateContentRequest {
    // Names for function responses come from the tool uses seen earlier.
    let mut names_by_id: HashMap<String, String> = HashMap::new();

    let mut contents = Vec::new();
    for message in &request.messages {
        let role = match message.role {
            claude::Role::User => "user",
            claude::Role::Assistant => "model",
        };
        let mut parts = Vec::new();
        match &message.content {
            claude::MessageContent::Text(text) => {
                if !text.is_empty() {
                    parts.push(gemini::Part::text(text.clone()));
                }
            }
            claude::MessageContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        claude::ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                parts.push(gemini::Part::text(text.clone()));
                            }
                        }
                        claude::ContentBlock::Image { source } => {
                            if let claude::ImageSource::Base64 { media_type, data } = source {
                                parts.push(gemini::Part {
                                    inline_data: Some(gemini::Blob {
                                        mime_type: media_type.clone(),
                                        data: data.clone(),
                                    }),
                                    ..gemini::Part::default()
                                });
                            }
                        }
                        claude::ContentBlock::ToolUse { id, name, input } => {
                            names_by_id.insert(id.clone(), name.clone());
                            parts.push(gemini::Part {
                                function_call: Some(gemini::FunctionCall {
                                    name: name.clone(),
                                    args: input.clone(),
                                }),
                                ..gemini::Part::default()
                            });
                        }
                        claude::ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            let name = names_by_id
                                .get(tool_use_id)
                                .cloned()
                                .unwrap_or_else(|| tool_use_id.clone());
                            let text = content
                                .as_ref()
                                .map(|content| content.joined_text())
                                .unwrap_or_default();
                            parts.push(gemini::Part {
                                function_response: Some(gemini::FunctionResponse {
                                    name,
                                    response: serde_json::json!({"result": text}),
                                }),
                                ..gemini::Part::default()
                            });
                        }
                        claude::ContentBlock::Thinking { .. } => {}
                    }
                }
            }
        }
        contents.push(gemini::Content {
            role: Some(role.to_string()),
            parts,
        });
    }

    let tools = request.tools.map(|tools| {
        vec![gemini::Tool {
            function_declarations: tools
                .into_iter()
                .map(|tool| gemini::FunctionDeclaration {
                    name: tool.name,
                    description: tool.description,
                    parameters: Some(tool.input_schema),
                })
                .collect(),
        }]
    });

    let generation_config = gemini::GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        max_output_tokens: request.max_tokens,
        stop_sequences: request.stop_sequences,
    };
    let has_config = generation_config.temperature.is_some()
        || generation_config.top_p.is_some()
        || generation_config.top_k.is_some()
        || generation_config.max_output_tokens.is_some()
        || generation_config.stop_sequences.is_some();

    gemini::GenerateContentRequest {
        contents,
        system_instruction: request.system.map(|system| gemini::Content {
            role: None,
            parts: vec![gemini::Part::text(system.joined_text())],
        }),
        tools,
        generation_config: has_config.then_some(generation_config),
    }
}

// ---- Responses ----

pub fn response_to_claude(model: &str, response: gemini::GenerateContentResponse) -> claude::MessagesResponse {
    let mut content = Vec::new();
    let mut stop_reason = None;
    if let Some(candidate) = response.candidates.into_iter().next() {
        if let Some(candidate_content) = candidate.content {
            let mut text = String::new();
            for part in candidate_content.parts {
                if let Some(value) = part.text {
                    text.push_str(&value);
                }
                if let Some(call) = part.function_call {
                    content.push(claude::ContentBlock::ToolUse {
                        id: format!("{}-{}", call.name, Uuid::new_v4()),
                        name: call.name,
                        input: call.args,
                    });
                }
            }
            if !text.is_empty() {
                content.insert(0, claude::ContentBlock::Text { text });
            }
        }
        let has_tool_use = content
            .iter()
            .any(|block| matches!(block, claude::ContentBlock::ToolUse { .. }));
        stop_reason = Some(if has_tool_use {
            claude::StopReason::ToolUse
        } else {
            map_finish_reason(candidate.finish_reason.as_deref())
        });
    }

    let usage = response
        .usage_metadata
        .map(|usage| claude::Usage {
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    claude::MessagesResponse {
        id: format!("msg_{}", Uuid::new_v4()),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: response
            .model_version
            .unwrap_or_else(|| model.to_string()),
        content,
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

fn map_finish_reason(reason: Option<&str>) -> claude::StopReason {
    match reason {
        Some("MAX_TOKENS") => claude::StopReason::MaxTokens,
        _ => claude::StopReason::EndTurn,
    }
}

pub fn response_from_claude(response: &claude::MessagesResponse) -> gemini::GenerateContentResponse {
    let mut parts = Vec::new();
    for block in &response.content {
        match block {
            claude::ContentBlock::Text { text } => parts.push(gemini::Part::text(text.clone())),
            claude::ContentBlock::ToolUse { name, input, .. } => parts.push(gemini::Part {
                function_call: Some(gemini::FunctionCall {
                    name: name.clone(),
                    args: input.clone(),
                }),
                ..gemini::Part::default()
            }),
            _ => {}
        }
    }

    let finish_reason = match response.stop_reason {
        Some(claude::StopReason::MaxTokens) => "MAX_TOKENS",
        _ => "STOP",
    };

    gemini::GenerateContentResponse {
        candidates: vec![gemini::Candidate {
            content: Some(gemini::Content {
                role: Some("model".to_string()),
                parts,
            }),
            finish_reason: Some(finish_reason.to_string()),
            index: Some(0),
        }],
        usage_metadata: Some(gemini::UsageMetadata {
            prompt_token_count: Some(response.usage.input_tokens),
            candidates_token_count: Some(response.usage.output_tokens),
            total_token_count: Some(response.usage.input_tokens + response.usage.output_tokens),
        }),
        model_version: Some(response.model.clone()),
    }
}

// ---- Streams ----

/// Claude stream events rendered as Gemini streamGenerateContent frames.
///
/// Tool-use input arrives as JSON fragments; Gemini expects whole
/// functionCall parts, so fragments accumulate until the block closes.
#[derive(Debug, Default)]
pub struct ClaudeToGeminiStream {
    model: String,
    open_tool: Option<(String, String)>, // (name, accumulated json)
    output_tokens: Option<u32>,
    stop_reason: Option<claude::StopReason>,
}

impl ClaudeToGeminiStream {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::default()
        }
    }

    pub fn push_event(&mut self, event: claude::StreamEvent) -> Vec<gemini::GenerateContentResponse> {
        match event {
            claude::StreamEvent::ContentBlockStart { content_block, .. } => {
                if let claude::StreamContentBlock::ToolUse { name, input, .. } = content_block {
                    let seed = if input.as_object().map(|o| o.is_empty()).unwrap_or(false) {
                        String::new()
                    } else {
                        serde_json::to_string(&input).unwrap_or_default()
                    };
                    self.open_tool = Some((name, seed));
                }
                Vec::new()
            }
            claude::StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                claude::ContentDelta::TextDelta { text } => {
                    if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![self.frame(vec![gemini::Part::text(text)], None)]
                    }
                }
                claude::ContentDelta::InputJsonDelta { partial_json } => {
                    if let Some((_, buffer)) = self.open_tool.as_mut() {
                        buffer.push_str(&partial_json);
                    }
                    Vec::new()
                }
            },
            claude::StreamEvent::ContentBlockStop { .. } => {
                if let Some((name, buffer)) = self.open_tool.take() {
                    let args = serde_json::from_str(&buffer).unwrap_or(serde_json::json!({}));
                    vec![self.frame(
                        vec![gemini::Part {
                            function_call: Some(gemini::FunctionCall { name, args }),
                            ..gemini::Part::default()
                        }],
                        None,
                    )]
                } else {
                    Vec::new()
                }
            }
            claude::StreamEvent::MessageDelta { delta, usage } => {
                self.stop_reason = delta.stop_reason;
                self.output_tokens = usage.map(|usage| usage.output_tokens);
                Vec::new()
            }
            claude::StreamEvent::MessageStop => {
                let finish = match self.stop_reason {
                    Some(claude::StopReason::MaxTokens) => "MAX_TOKENS",
                    _ => "STOP",
                };
                vec![self.frame(Vec::new(), Some(finish.to_string()))]
            }
            claude::StreamEvent::MessageStart { .. } | claude::StreamEvent::Ping => Vec::new(),
        }
    }

    fn frame(
        &self,
        parts: Vec<gemini::Part>,
        finish_reason: Option<String>,
    ) -> gemini::GenerateContentResponse {
        let is_final = finish_reason.is_some();
        gemini::GenerateContentResponse {
            candidates: vec![gemini::Candidate {
                content: Some(gemini::Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason,
                index: Some(0),
            }],
            usage_metadata: if is_final {
                self.output_tokens.map(|output| gemini::UsageMetadata {
                    prompt_token_count: None,
                    candidates_token_count: Some(output),
                    total_token_count: None,
                })
            } else {
                None
            },
            model_version: Some(self.model.clone()),
        }
    }
}

/// Gemini stream frames decoded into canonical Claude events.
#[derive(Debug, Default)]
pub struct GeminiToClaudeStream {
    started: bool,
    text_open: bool,
    next_block: usize,
    saw_tool_use: bool,
    finish_reason: Option<String>,
    output_tokens: Option<u32>,
    model: String,
    stopped: bool,
}

impl GeminiToClaudeStream {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::default()
        }
    }

    pub fn push_frame(&mut self, frame: gemini::GenerateContentResponse) -> Vec<claude::StreamEvent> {
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(claude::StreamEvent::MessageStart {
                message: claude::MessageStart {
                    id: format!("msg_{}", Uuid::new_v4()),
                    kind: "message".to_string(),
                    role: "assistant".to_string(),
                    model: frame
                        .model_version
                        .clone()
                        .unwrap_or_else(|| self.model.clone()),
                    content: Vec::new(),
                    usage: claude::Usage::default(),
                },
            });
        }
        if let Some(usage) = &frame.usage_metadata {
            if let Some(output) = usage.candidates_token_count {
                self.output_tokens = Some(output);
            }
        }
        for candidate in frame.candidates {
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if let Some(text) = part.text {
                        if !text.is_empty() {
                            if !self.text_open {
                                self.text_open = true;
                                if self.next_block == 0 {
                                    self.next_block = 1;
                                }
                                events.push(claude::StreamEvent::ContentBlockStart {
                                    index: 0,
                                    content_block: claude::StreamContentBlock::Text {
                                        text: String::new(),
                                    },
                                });
                            }
                            events.push(claude::StreamEvent::ContentBlockDelta {
                                index: 0,
                                delta: claude::ContentDelta::TextDelta { text },
                            });
                        }
                    }
                    if let Some(call) = part.function_call {
                        if self.text_open {
                            events.push(claude::StreamEvent::ContentBlockStop { index: 0 });
                            self.text_open = false;
                        }
                        let index = self.next_block.max(1);
                        self.next_block = index + 1;
                        self.saw_tool_use = true;
                        events.push(claude::StreamEvent::ContentBlockStart {
                            index,
                            content_block: claude::StreamContentBlock::ToolUse {
                                id: format!("{}-{}", call.name, Uuid::new_v4()),
                                name: call.name,
                                input: serde_json::json!({}),
                            },
                        });
                        events.push(claude::StreamEvent::ContentBlockDelta {
                            index,
                            delta: claude::ContentDelta::InputJsonDelta {
                                partial_json: serde_json::to_string(&call.args)
                                    .unwrap_or_else(|_| "{}".to_string()),
                            },
                        });
                        events.push(claude::StreamEvent::ContentBlockStop { index });
                    }
                }
            }
            if let Some(reason) = candidate.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<claude::StreamEvent> {
        let mut events = Vec::new();
        if self.stopped {
            return events;
        }
        self.stopped = true;
        if self.text_open {
            events.push(claude::StreamEvent::ContentBlockStop { index: 0 });
            self.text_open = false;
        }
        let stop_reason = if self.saw_tool_use {
            claude::StopReason::ToolUse
        } else {
            map_finish_reason(self.finish_reason.as_deref())
        };
        events.push(claude::StreamEvent::MessageDelta {
            delta: claude::MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: self
                .output_tokens
                .map(|output_tokens| claude::DeltaUsage { output_tokens }),
        });
        events.push(claude::StreamEvent::MessageStop);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_response_text_prefers_result_field() {
        assert_eq!(
            function_response_text(&serde_json::json!({"result": "ok"})),
            "ok"
        );
        assert_eq!(function_response_text(&serde_json::json!("raw")), "raw");
        assert_eq!(
            function_response_text(&serde_json::json!({"other": 1})),
            "{\"other\":1}"
        );
    }

    #[test]
    fn tool_use_maps_to_whole_function_call_frame() {
        let mut state = ClaudeToGeminiStream::new("gemini-2.5-pro");
        state.push_event(claude::StreamEvent::ContentBlockStart {
            index: 1,
            content_block: claude::StreamContentBlock::ToolUse {
                id: "tu_1".to_string(),
                name: "search".to_string(),
                input: serde_json::json!({}),
            },
        });
        assert!(state
            .push_event(claude::StreamEvent::ContentBlockDelta {
                index: 1,
                delta: claude::ContentDelta::InputJsonDelta {
                    partial_json: "{\"q\":".to_string(),
                },
            })
            .is_empty());
        let frames = state.push_event(claude::StreamEvent::ContentBlockDelta {
            index: 1,
            delta: claude::ContentDelta::InputJsonDelta {
                partial_json: "\"x\"}".to_string(),
            },
        });
        assert!(frames.is_empty());
        let frames = state.push_event(claude::StreamEvent::ContentBlockStop { index: 1 });
        let call = frames[0].candidates[0].content.as_ref().unwrap().parts[0]
            .function_call
            .as_ref()
            .unwrap();
        assert_eq!(call.name, "search");
        assert_eq!(call.args["q"], "x");
    }

    #[test]
    fn gemini_frames_decode_with_tool_stop_reason() {
        let mut state = GeminiToClaudeStream::new("gemini-2.5-pro");
        let frame: gemini::GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"text": "Thinking"},
                {"functionCall": {"name": "search", "args": {"q": "x"}}}
            ]}, "finishReason": "STOP"}]
        }))
        .unwrap();
        let events = state.push_frame(frame);
        assert!(matches!(events[0], claude::StreamEvent::MessageStart { .. }));
        let tail = state.finish();
        assert!(matches!(
            tail.iter().find(|event| matches!(event, claude::StreamEvent::MessageDelta { .. })),
            Some(claude::StreamEvent::MessageDelta {
                delta: claude::MessageDeltaBody { stop_reason: Some(claude::StopReason::ToolUse), .. },
                ..
            })
        ));
    }
}
