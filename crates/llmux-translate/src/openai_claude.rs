//! OpenAI chat-completions <-> Claude messages conversion.

use std::collections::BTreeMap;

use llmux_protocol::claude;
use llmux_protocol::openai;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{stop_reason_from_openai, stop_reason_to_openai};

pub fn request_to_claude(request: openai::ChatCompletionRequest) -> claude::MessagesRequest {
    let mut system_texts = Vec::new();
    let mut messages: Vec<claude::Message> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &message.content {
                    system_texts.push(content.joined_text());
                }
            }
            "assistant" => messages.push(map_assistant_message(message)),
            "tool" => messages.push(map_tool_message(message)),
            // Anything else is treated as a user turn.
            _ => messages.push(map_user_message(message)),
        }
    }

    let system = if system_texts.is_empty() {
        None
    } else {
        Some(claude::SystemPrompt::Text(system_texts.join("\n")))
    };

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| claude::Tool {
                name: tool.function.name,
                description: tool.function.description,
                input_schema: tool
                    .function
                    .parameters
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            })
            .collect::<Vec<_>>()
    });

    claude::MessagesRequest {
        model: request.model,
        max_tokens: request.max_completion_tokens.or(request.max_tokens),
        messages,
        system,
        tools,
        tool_choice: map_tool_choice_to_claude(request.tool_choice),
        temperature: request.temperature.map(|t| t.clamp(0.0, 1.0)),
        top_p: request.top_p,
        top_k: None,
        stop_sequences: map_stop_to_sequences(request.stop),
        stream: request.stream,
        metadata: None,
    }
}

fn map_user_message(message: &openai::ChatMessage) -> claude::Message {
    let content = match &message.content {
        Some(openai::ChatContent::Text(text)) => claude::MessageContent::Text(text.clone()),
        Some(openai::ChatContent::Parts(parts)) => {
            let mut blocks = Vec::new();
            for part in parts {
                match part {
                    openai::ContentPart::Text { text } => {
                        if !text.is_empty() {
                            blocks.push(claude::ContentBlock::Text { text: text.clone() });
                        }
                    }
                    openai::ContentPart::ImageUrl { image_url } => {
                        blocks.push(map_image_url(&image_url.url));
                    }
                }
            }
            collapse_blocks(blocks)
        }
        None => claude::MessageContent::Text(String::new()),
    };
    claude::Message {
        role: claude::Role::User,
        content,
    }
}

fn map_assistant_message(message: &openai::ChatMessage) -> claude::Message {
    let mut blocks = Vec::new();
    if let Some(content) = &message.content {
        let text = content.joined_text();
        if !text.is_empty() {
            blocks.push(claude::ContentBlock::Text { text });
        }
    }
    if let Some(tool_calls) = &message.tool_calls {
        for call in tool_calls {
            blocks.push(claude::ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input: parse_tool_arguments(&call.function.arguments),
            });
        }
    }
    claude::Message {
        role: claude::Role::Assistant,
        content: collapse_blocks(blocks),
    }
}

fn map_tool_message(message: &openai::ChatMessage) -> claude::Message {
    let text = message
        .content
        .as_ref()
        .map(|content| content.joined_text())
        .unwrap_or_default();
    let block = claude::ContentBlock::ToolResult {
        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
        content: Some(claude::ToolResultContent::Text(text)),
        is_error: None,
    };
    claude::Message {
        role: claude::Role::User,
        content: claude::MessageContent::Blocks(vec![block]),
    }
}

fn collapse_blocks(blocks: Vec<claude::ContentBlock>) -> claude::MessageContent {
    if blocks.len() == 1 {
        if let claude::ContentBlock::Text { text } = &blocks[0] {
            return claude::MessageContent::Text(text.clone());
        }
    }
    claude::MessageContent::Blocks(blocks)
}

fn map_image_url(url: &str) -> claude::ContentBlock {
    if let Some((media_type, data)) = parse_data_url(url) {
        return claude::ContentBlock::Image {
            source: claude::ImageSource::Base64 { media_type, data },
        };
    }
    claude::ContentBlock::Image {
        source: claude::ImageSource::Url {
            url: url.to_string(),
        },
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

pub(crate) fn parse_tool_arguments(arguments: &str) -> JsonValue {
    match serde_json::from_str::<JsonValue>(arguments) {
        Ok(value @ JsonValue::Object(_)) => value,
        Ok(other) => serde_json::json!({ "arguments": other }),
        Err(_) => serde_json::json!({ "arguments": arguments }),
    }
}

fn map_stop_to_sequences(stop: Option<openai::StopConfig>) -> Option<Vec<String>> {
    let sequences = match stop? {
        openai::StopConfig::Single(value) => vec![value],
        openai::StopConfig::Many(values) => values,
    };
    let sequences: Vec<String> = sequences
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect();
    (!sequences.is_empty()).then_some(sequences)
}

fn map_tool_choice_to_claude(choice: Option<JsonValue>) -> Option<JsonValue> {
    match choice? {
        JsonValue::String(mode) => match mode.as_str() {
            "none" => Some(serde_json::json!({"type": "none"})),
            "required" => Some(serde_json::json!({"type": "any"})),
            _ => Some(serde_json::json!({"type": "auto"})),
        },
        JsonValue::Object(map) => {
            let name = map
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())?;
            Some(serde_json::json!({"type": "tool", "name": name}))
        }
        _ => None,
    }
}

fn map_tool_choice_from_claude(choice: Option<JsonValue>) -> Option<JsonValue> {
    let choice = choice?;
    let kind = choice.get("type").and_then(|t| t.as_str())?;
    match kind {
        "none" => Some(JsonValue::String("none".to_string())),
        "any" => Some(JsonValue::String("required".to_string())),
        "tool" => {
            let name = choice.get("name").and_then(|n| n.as_str())?;
            Some(serde_json::json!({"type": "function", "function": {"name": name}}))
        }
        _ => Some(JsonValue::String("auto".to_string())),
    }
}

pub fn request_from_claude(request: claude::MessagesRequest) -> openai::ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(openai::ChatMessage::text("system", system.joined_text()));
    }

    for message in &request.messages {
        match message.role {
            claude::Role::User => push_user_from_claude(&mut messages, message),
            claude::Role::Assistant => push_assistant_from_claude(&mut messages, message),
        }
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| openai::ToolDefinition {
                kind: "function".to_string(),
                function: openai::FunctionDefinition {
                    name: tool.name,
                    description: tool.description,
                    parameters: Some(tool.input_schema),
                },
            })
            .collect::<Vec<_>>()
    });

    openai::ChatCompletionRequest {
        model: request.model,
        messages,
        tools,
        tool_choice: map_tool_choice_from_claude(request.tool_choice),
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_tokens,
        max_completion_tokens: None,
        stop: request.stop_sequences.map(openai::StopConfig::Many),
        stream: request.stream,
    }
}

fn push_user_from_claude(messages: &mut Vec<openai::ChatMessage>, message: &claude::Message) {
    let blocks = match &message.content {
        claude::MessageContent::Text(text) => {
            messages.push(openai::ChatMessage::text("user", text.clone()));
            return;
        }
        claude::MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    for block in blocks {
        match block {
            claude::ContentBlock::Text { text } => {
                parts.push(openai::ContentPart::Text { text: text.clone() });
            }
            claude::ContentBlock::Image { source } => {
                let url = match source {
                    claude::ImageSource::Base64 { media_type, data } => {
                        format!("data:{media_type};base64,{data}")
                    }
                    claude::ImageSource::Url { url } => url.clone(),
                };
                parts.push(openai::ContentPart::ImageUrl {
                    image_url: openai::ImageUrl { url },
                });
            }
            claude::ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                // Tool results become their own `tool` role turns.
                messages.push(openai::ChatMessage {
                    role: "tool".to_string(),
                    content: Some(openai::ChatContent::Text(
                        content
                            .as_ref()
                            .map(|content| content.joined_text())
                            .unwrap_or_default(),
                    )),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                    name: None,
                });
            }
            claude::ContentBlock::ToolUse { .. } | claude::ContentBlock::Thinking { .. } => {}
        }
    }

    if !parts.is_empty() {
        let content = if parts.len() == 1 {
            match &parts[0] {
                openai::ContentPart::Text { text } => openai::ChatContent::Text(text.clone()),
                _ => openai::ChatContent::Parts(parts),
            }
        } else {
            openai::ChatContent::Parts(parts)
        };
        messages.push(openai::ChatMessage {
            role: "user".to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        });
    }
}

fn push_assistant_from_claude(messages: &mut Vec<openai::ChatMessage>, message: &claude::Message) {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    match &message.content {
        claude::MessageContent::Text(value) => text.push_str(value),
        claude::MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    claude::ContentBlock::Text { text: value } => text.push_str(value),
                    claude::ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(openai::ToolCall {
                            id: id.clone(),
                            kind: "function".to_string(),
                            function: openai::FunctionCall {
                                name: name.clone(),
                                arguments: serde_json::to_string(input)
                                    .unwrap_or_else(|_| "{}".to_string()),
                            },
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    messages.push(openai::ChatMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty()).then(|| openai::ChatContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
        name: None,
    });
}

// ---- Responses ----

pub fn response_to_claude(response: openai::ChatCompletionResponse) -> claude::MessagesResponse {
    let mut content = Vec::new();
    let mut stop_reason = None;
    if let Some(choice) = response.choices.into_iter().next() {
        if let Some(text) = choice.message.content {
            if !text.is_empty() {
                content.push(claude::ContentBlock::Text { text });
            }
        }
        if let Some(tool_calls) = choice.message.tool_calls {
            for call in tool_calls {
                content.push(claude::ContentBlock::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    input: parse_tool_arguments(&call.function.arguments),
                });
            }
        }
        stop_reason = choice.finish_reason.map(stop_reason_from_openai);
    }

    let usage = response
        .usage
        .map(|usage| claude::Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
        .unwrap_or_default();

    claude::MessagesResponse {
        id: format!("msg_{}", Uuid::new_v4()),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: response.model,
        content,
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

pub fn response_from_claude(response: &claude::MessagesResponse) -> openai::ChatCompletionResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in &response.content {
        match block {
            claude::ContentBlock::Text { text: value } => text.push_str(value),
            claude::ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(openai::ToolCall {
                    id: id.clone(),
                    kind: "function".to_string(),
                    function: openai::FunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = response
        .stop_reason
        .map(stop_reason_to_openai)
        .unwrap_or(openai::FinishReason::Stop);

    openai::ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: time::OffsetDateTime::now_utc().unix_timestamp(),
        model: response.model.clone(),
        choices: vec![openai::Choice {
            index: 0,
            message: openai::AssistantMessage {
                role: "assistant".to_string(),
                content: (!text.is_empty()).then_some(text),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(finish_reason),
        }],
        usage: Some(openai::CompletionUsage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        }),
    }
}

// ---- Streams ----

#[derive(Debug, Clone)]
struct ToolCallInfo {
    id: String,
    name: String,
}

/// Claude stream events rendered as OpenAI chat-completion chunks.
#[derive(Debug)]
pub struct ClaudeToOpenAiStream {
    id: String,
    model: String,
    created: i64,
    tool_calls: BTreeMap<usize, ToolCallInfo>,
    finish_emitted: bool,
}

impl ClaudeToOpenAiStream {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            model: model.to_string(),
            created: time::OffsetDateTime::now_utc().unix_timestamp(),
            tool_calls: BTreeMap::new(),
            finish_emitted: false,
        }
    }

    /// Returns chunks to emit plus whether the terminal `[DONE]` marker is due.
    pub fn push_event(&mut self, event: claude::StreamEvent) -> (Vec<openai::ChatCompletionChunk>, bool) {
        match event {
            claude::StreamEvent::MessageStart { message } => {
                if !message.id.is_empty() {
                    self.id = message.id;
                }
                if !message.model.is_empty() {
                    self.model = message.model.clone();
                }
                let chunk = self.chunk(
                    openai::ChunkDelta {
                        role: Some("assistant".to_string()),
                        ..openai::ChunkDelta::default()
                    },
                    None,
                    None,
                );
                (vec![chunk], false)
            }
            claude::StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                claude::StreamContentBlock::Text { text } => {
                    if text.is_empty() {
                        (Vec::new(), false)
                    } else {
                        (vec![self.text_chunk(text)], false)
                    }
                }
                claude::StreamContentBlock::ToolUse { id, name, .. } => {
                    self.tool_calls.insert(index, ToolCallInfo { id, name });
                    (vec![self.tool_start_chunk(index)], false)
                }
            },
            claude::StreamEvent::ContentBlockDelta { index, delta } => match delta {
                claude::ContentDelta::TextDelta { text } => {
                    if text.is_empty() {
                        (Vec::new(), false)
                    } else {
                        (vec![self.text_chunk(text)], false)
                    }
                }
                claude::ContentDelta::InputJsonDelta { partial_json } => {
                    if partial_json.is_empty() {
                        (Vec::new(), false)
                    } else {
                        (vec![self.tool_delta_chunk(index, partial_json)], false)
                    }
                }
            },
            claude::StreamEvent::ContentBlockStop { .. } | claude::StreamEvent::Ping => {
                (Vec::new(), false)
            }
            claude::StreamEvent::MessageDelta { delta, usage } => {
                let finish = delta.stop_reason.map(stop_reason_to_openai);
                if finish.is_some() {
                    self.finish_emitted = true;
                }
                let usage = usage.map(|usage| openai::CompletionUsage {
                    prompt_tokens: 0,
                    completion_tokens: usage.output_tokens,
                    total_tokens: usage.output_tokens,
                });
                if finish.is_none() && usage.is_none() {
                    (Vec::new(), false)
                } else {
                    (
                        vec![self.chunk(openai::ChunkDelta::default(), finish, usage)],
                        false,
                    )
                }
            }
            claude::StreamEvent::MessageStop => {
                if self.finish_emitted {
                    (Vec::new(), true)
                } else {
                    self.finish_emitted = true;
                    (
                        vec![self.chunk(
                            openai::ChunkDelta::default(),
                            Some(openai::FinishReason::Stop),
                            None,
                        )],
                        true,
                    )
                }
            }
        }
    }

    fn text_chunk(&self, text: String) -> openai::ChatCompletionChunk {
        self.chunk(
            openai::ChunkDelta {
                content: Some(text),
                ..openai::ChunkDelta::default()
            },
            None,
            None,
        )
    }

    fn tool_start_chunk(&self, index: usize) -> openai::ChatCompletionChunk {
        let info = self.tool_calls.get(&index);
        self.chunk(
            openai::ChunkDelta {
                tool_calls: Some(vec![openai::ToolCallChunk {
                    index: index as u32,
                    id: info.map(|tool| tool.id.clone()),
                    kind: Some("function".to_string()),
                    function: Some(openai::FunctionCallChunk {
                        name: info.map(|tool| tool.name.clone()),
                        arguments: None,
                    }),
                }]),
                ..openai::ChunkDelta::default()
            },
            None,
            None,
        )
    }

    fn tool_delta_chunk(&self, index: usize, partial_json: String) -> openai::ChatCompletionChunk {
        self.chunk(
            openai::ChunkDelta {
                tool_calls: Some(vec![openai::ToolCallChunk {
                    index: index as u32,
                    id: None,
                    kind: Some("function".to_string()),
                    function: Some(openai::FunctionCallChunk {
                        name: None,
                        arguments: Some(partial_json),
                    }),
                }]),
                ..openai::ChunkDelta::default()
            },
            None,
            None,
        )
    }

    fn chunk(
        &self,
        delta: openai::ChunkDelta,
        finish_reason: Option<openai::FinishReason>,
        usage: Option<openai::CompletionUsage>,
    ) -> openai::ChatCompletionChunk {
        openai::ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![openai::ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

/// OpenAI chat-completion chunks decoded into canonical Claude events.
#[derive(Debug, Default)]
pub struct OpenAiToClaudeStream {
    started: bool,
    text_open: bool,
    next_block: usize,
    // openai tool index -> (claude block index, still open)
    tool_blocks: BTreeMap<u32, usize>,
    open_tool_block: Option<usize>,
    stop_reason: Option<claude::StopReason>,
    output_tokens: Option<u32>,
    stopped: bool,
}

impl OpenAiToClaudeStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: openai::ChatCompletionChunk) -> Vec<claude::StreamEvent> {
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(claude::StreamEvent::MessageStart {
                message: claude::MessageStart {
                    id: chunk.id.clone(),
                    kind: "message".to_string(),
                    role: "assistant".to_string(),
                    model: chunk.model.clone(),
                    content: Vec::new(),
                    usage: claude::Usage::default(),
                },
            });
        }

        if let Some(usage) = &chunk.usage {
            self.output_tokens = Some(usage.completion_tokens);
        }

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    self.ensure_text_block(&mut events);
                    events.push(claude::StreamEvent::ContentBlockDelta {
                        index: 0,
                        delta: claude::ContentDelta::TextDelta { text },
                    });
                }
            }
            if let Some(tool_calls) = choice.delta.tool_calls {
                for call in tool_calls {
                    self.push_tool_chunk(&mut events, call);
                }
            }
            if let Some(finish) = choice.finish_reason {
                self.stop_reason = Some(stop_reason_from_openai(finish));
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
        self.close_open_blocks(&mut events);
        let stop_reason = self.stop_reason.take().or(Some(claude::StopReason::EndTurn));
        events.push(claude::StreamEvent::MessageDelta {
            delta: claude::MessageDeltaBody {
                stop_reason,
                stop_sequence: None,
            },
            usage: self
                .output_tokens
                .map(|output_tokens| claude::DeltaUsage { output_tokens }),
        });
        events.push(claude::StreamEvent::MessageStop);
        events
    }

    fn ensure_text_block(&mut self, events: &mut Vec<claude::StreamEvent>) {
        if self.text_open {
            return;
        }
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

    fn push_tool_chunk(
        &mut self,
        events: &mut Vec<claude::StreamEvent>,
        call: openai::ToolCallChunk,
    ) {
        let is_new = call.id.is_some() && !self.tool_blocks.contains_key(&call.index);
        if is_new {
            if self.text_open {
                events.push(claude::StreamEvent::ContentBlockStop { index: 0 });
                self.text_open = false;
            }
            if let Some(open) = self.open_tool_block.take() {
                events.push(claude::StreamEvent::ContentBlockStop { index: open });
            }
            let block_index = self.next_block.max(1);
            self.next_block = block_index + 1;
            self.tool_blocks.insert(call.index, block_index);
            self.open_tool_block = Some(block_index);
            events.push(claude::StreamEvent::ContentBlockStart {
                index: block_index,
                content_block: claude::StreamContentBlock::ToolUse {
                    id: call.id.clone().unwrap_or_default(),
                    name: call
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default(),
                    input: serde_json::json!({}),
                },
            });
        }
        if let Some(arguments) = call.function.and_then(|f| f.arguments) {
            if !arguments.is_empty() {
                let index = self
                    .tool_blocks
                    .get(&call.index)
                    .copied()
                    .or(self.open_tool_block)
                    .unwrap_or(1);
                events.push(claude::StreamEvent::ContentBlockDelta {
                    index,
                    delta: claude::ContentDelta::InputJsonDelta {
                        partial_json: arguments,
                    },
                });
            }
        }
    }

    fn close_open_blocks(&mut self, events: &mut Vec<claude::StreamEvent>) {
        if let Some(open) = self.open_tool_block.take() {
            events.push(claude::StreamEvent::ContentBlockStop { index: open });
        }
        if self.text_open {
            events.push(claude::StreamEvent::ContentBlockStop { index: 0 });
            self.text_open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_event(text: &str) -> claude::StreamEvent {
        claude::StreamEvent::ContentBlockDelta {
            index: 0,
            delta: claude::ContentDelta::TextDelta {
                text: text.to_string(),
            },
        }
    }

    #[test]
    fn tool_message_becomes_tool_result_block() {
        let request: openai::ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "tool", "tool_call_id": "tu_1", "content": "42"}
            ]
        }))
        .unwrap();
        let claude_req = request_to_claude(request);
        let blocks = match &claude_req.messages[0].content {
            claude::MessageContent::Blocks(blocks) => blocks,
            other => panic!("unexpected content: {other:?}"),
        };
        assert!(matches!(
            &blocks[0],
            claude::ContentBlock::ToolResult { tool_use_id, content: Some(content), .. }
                if tool_use_id == "tu_1" && content.joined_text() == "42"
        ));
    }

    #[test]
    fn invalid_tool_arguments_are_wrapped() {
        let value = parse_tool_arguments("not json");
        assert_eq!(value["arguments"], "not json");
        let value = parse_tool_arguments("[1,2]");
        assert_eq!(value["arguments"][0], 1);
    }

    #[test]
    fn claude_stream_renders_openai_chunks_in_order() {
        let mut state = ClaudeToOpenAiStream::new("m");
        let (start, _) = state.push_event(claude::StreamEvent::MessageStart {
            message: claude::MessageStart {
                id: "msg_1".to_string(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: "m".to_string(),
                content: Vec::new(),
                usage: claude::Usage::default(),
            },
        });
        assert_eq!(start[0].choices[0].delta.role.as_deref(), Some("assistant"));

        let (chunks, _) = state.push_event(text_event("hi"));
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("hi"));

        let (chunks, _) = state.push_event(claude::StreamEvent::MessageDelta {
            delta: claude::MessageDeltaBody {
                stop_reason: Some(claude::StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Some(claude::DeltaUsage { output_tokens: 2 }),
        });
        assert_eq!(
            chunks[0].choices[0].finish_reason,
            Some(openai::FinishReason::Stop)
        );

        let (chunks, done) = state.push_event(claude::StreamEvent::MessageStop);
        assert!(chunks.is_empty());
        assert!(done);
    }

    #[test]
    fn openai_chunks_decode_to_claude_events() {
        let mut state = OpenAiToClaudeStream::new();
        let chunk: openai::ChatCompletionChunk = serde_json::from_value(serde_json::json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"content": "hi"}, "finish_reason": null}]
        }))
        .unwrap();
        let events = state.push_chunk(chunk);
        assert!(matches!(events[0], claude::StreamEvent::MessageStart { .. }));
        assert!(matches!(
            events[1],
            claude::StreamEvent::ContentBlockStart { index: 0, .. }
        ));
        assert!(matches!(
            &events[2],
            claude::StreamEvent::ContentBlockDelta { index: 0, delta: claude::ContentDelta::TextDelta { text } }
                if text == "hi"
        ));

        let tool_chunk: openai::ChatCompletionChunk = serde_json::from_value(serde_json::json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "tu_1", "type": "function",
                 "function": {"name": "search", "arguments": "{\"q\""}}
            ]}, "finish_reason": null}]
        }))
        .unwrap();
        let events = state.push_chunk(tool_chunk);
        // Text block closes before the tool block opens.
        assert!(matches!(events[0], claude::StreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(
            events[1],
            claude::StreamEvent::ContentBlockStart { index: 1, .. }
        ));
        assert!(matches!(
            events[2],
            claude::StreamEvent::ContentBlockDelta { index: 1, .. }
        ));

        let tail = state.finish();
        assert!(matches!(tail[0], claude::StreamEvent::ContentBlockStop { index: 1 }));
        assert!(matches!(
            tail[1],
            claude::StreamEvent::MessageDelta { delta: claude::MessageDeltaBody { stop_reason: Some(_), .. }, .. }
        ));
        assert!(matches!(tail[2], claude::StreamEvent::MessageStop));
    }
}
