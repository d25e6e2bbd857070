//! CodeWhisperer request envelope construction.
//!
//! Folds a Claude-form request into the conversationState shape the upstream
//! accepts: history plus one current user message, with the provider's
//! well-known normalization quirks applied.

use llmux_auth::constants::{CHAT_TRIGGER_MANUAL, ORIGIN_AI_EDITOR};
use llmux_auth::KiroCredential;
use llmux_protocol::claude;
use serde_json::{json, Map, Value as JsonValue};
use uuid::Uuid;

/// User-facing Claude names to CodeWhisperer model ids. Unknown names pass
/// through unchanged.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("claude-opus-4-5", "claude-opus-4.5"),
    ("claude-opus-4-5-20251101", "claude-opus-4.5"),
    ("claude-haiku-4-5", "claude-haiku-4.5"),
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
];

pub fn resolve_model_alias(model: &str) -> &str {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, upstream)| *upstream)
        .unwrap_or(model)
}

#[derive(Debug, Default, Clone)]
struct Turn {
    is_assistant: bool,
    content: String,
    tool_uses: Vec<JsonValue>,
    tool_results: Vec<JsonValue>,
    images: Vec<JsonValue>,
}

pub fn build_request(
    request: &claude::MessagesRequest,
    upstream_model: &str,
    credential: &KiroCredential,
) -> JsonValue {
    let model_id = resolve_model_alias(upstream_model).to_string();
    let system_prompt = request
        .system
        .as_ref()
        .map(|system| system.joined_text())
        .unwrap_or_default();
    let tools_context = build_tools_context(request.tools.as_deref());

    let mut turns: Vec<Turn> = request.messages.iter().map(flatten_message).collect();

    // The upstream sometimes leaves a dangling "{" assistant tail behind.
    if let Some(last) = turns.last() {
        if last.is_assistant && last.content.trim() == "{" {
            turns.pop();
        }
    }

    let mut merged: Vec<Turn> = Vec::with_capacity(turns.len());
    for turn in turns {
        match merged.last_mut() {
            Some(previous) if previous.is_assistant == turn.is_assistant => {
                if !turn.content.is_empty() {
                    if !previous.content.is_empty() {
                        previous.content.push('\n');
                    }
                    previous.content.push_str(&turn.content);
                }
                previous.tool_uses.extend(turn.tool_uses);
                previous.tool_results.extend(turn.tool_results);
                previous.images.extend(turn.images);
            }
            _ => merged.push(turn),
        }
    }

    if !system_prompt.is_empty() {
        match merged.first_mut() {
            Some(first) if !first.is_assistant => {
                first.content = format!("{system_prompt}\n\n{}", first.content);
            }
            _ => {
                merged.insert(
                    0,
                    Turn {
                        is_assistant: false,
                        content: system_prompt,
                        ..Turn::default()
                    },
                );
            }
        }
    }

    let mut history: Vec<JsonValue> = Vec::new();
    let mut current = Turn::default();
    if let Some(tail) = merged.pop() {
        for turn in merged {
            history.push(history_entry(&turn, &model_id));
        }
        if tail.is_assistant {
            history.push(history_entry(&tail, &model_id));
            current.content = "Continue".to_string();
        } else {
            current = tail;
        }
    }

    // The upstream rejects empty content.
    if current.content.is_empty() {
        current.content = if current.tool_results.is_empty() {
            "Continue".to_string()
        } else {
            "Tool results provided.".to_string()
        };
    }

    let mut user_input = Map::new();
    user_input.insert("content".to_string(), json!(current.content));
    user_input.insert("modelId".to_string(), json!(model_id));
    user_input.insert("origin".to_string(), json!(ORIGIN_AI_EDITOR));
    if !current.images.is_empty() {
        user_input.insert("images".to_string(), JsonValue::Array(current.images));
    }

    let mut context = Map::new();
    if !current.tool_results.is_empty() {
        context.insert(
            "toolResults".to_string(),
            JsonValue::Array(dedupe_tool_results(current.tool_results)),
        );
    }
    if !tools_context.is_empty() {
        context.insert("tools".to_string(), JsonValue::Array(tools_context));
    }
    if !context.is_empty() {
        user_input.insert(
            "userInputMessageContext".to_string(),
            JsonValue::Object(context),
        );
    }

    let mut conversation_state = Map::new();
    conversation_state.insert("chatTriggerType".to_string(), json!(CHAT_TRIGGER_MANUAL));
    conversation_state.insert("conversationId".to_string(), json!(Uuid::new_v4().to_string()));
    conversation_state.insert(
        "currentMessage".to_string(),
        json!({ "userInputMessage": JsonValue::Object(user_input) }),
    );
    if !history.is_empty() {
        conversation_state.insert("history".to_string(), JsonValue::Array(history));
    }

    let mut envelope = Map::new();
    envelope.insert(
        "conversationState".to_string(),
        JsonValue::Object(conversation_state),
    );
    if credential.is_social() {
        if let Some(profile_arn) = credential.profile_arn.as_deref() {
            if !profile_arn.is_empty() {
                envelope.insert("profileArn".to_string(), json!(profile_arn));
            }
        }
    }

    JsonValue::Object(envelope)
}

fn flatten_message(message: &claude::Message) -> Turn {
    let mut turn = Turn {
        is_assistant: message.role == claude::Role::Assistant,
        ..Turn::default()
    };
    match &message.content {
        claude::MessageContent::Text(text) => turn.content.push_str(text),
        claude::MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    claude::ContentBlock::Text { text } => turn.content.push_str(text),
                    claude::ContentBlock::ToolUse { id, name, input } => {
                        turn.tool_uses.push(json!({
                            "name": name,
                            "toolUseId": id,
                            "input": input,
                        }));
                    }
                    claude::ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        let text = content
                            .as_ref()
                            .map(|content| content.joined_text())
                            .unwrap_or_default();
                        turn.tool_results.push(json!({
                            "content": [{"text": text}],
                            "status": "success",
                            "toolUseId": tool_use_id,
                        }));
                    }
                    claude::ContentBlock::Image { source } => {
                        if let claude::ImageSource::Base64 { media_type, data } = source {
                            let format = media_type
                                .split_once('/')
                                .map(|(_, sub)| sub)
                                .unwrap_or("png");
                            turn.images.push(json!({
                                "format": format,
                                "source": {"bytes": data},
                            }));
                        }
                    }
                    claude::ContentBlock::Thinking { .. } => {}
                }
            }
        }
    }
    turn
}

fn history_entry(turn: &Turn, model_id: &str) -> JsonValue {
    if turn.is_assistant {
        let mut message = Map::new();
        message.insert("content".to_string(), json!(turn.content));
        if !turn.tool_uses.is_empty() {
            message.insert("toolUses".to_string(), JsonValue::Array(turn.tool_uses.clone()));
        }
        json!({ "assistantResponseMessage": JsonValue::Object(message) })
    } else {
        let mut message = Map::new();
        message.insert("content".to_string(), json!(turn.content));
        message.insert("modelId".to_string(), json!(model_id));
        message.insert("origin".to_string(), json!(ORIGIN_AI_EDITOR));
        if !turn.images.is_empty() {
            message.insert("images".to_string(), JsonValue::Array(turn.images.clone()));
        }
        if !turn.tool_results.is_empty() {
            message.insert(
                "userInputMessageContext".to_string(),
                json!({ "toolResults": dedupe_tool_results(turn.tool_results.clone()) }),
            );
        }
        json!({ "userInputMessage": JsonValue::Object(message) })
    }
}

fn build_tools_context(tools: Option<&[claude::Tool]>) -> Vec<JsonValue> {
    let Some(tools) = tools else {
        return Vec::new();
    };
    tools
        .iter()
        .map(|tool| {
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": tool.description.as_deref().unwrap_or_default(),
                    "inputSchema": {"json": tool.input_schema},
                }
            })
        })
        .collect()
}

/// Keep only the first tool result per toolUseId within a turn.
fn dedupe_tool_results(results: Vec<JsonValue>) -> Vec<JsonValue> {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::with_capacity(results.len());
    for result in results {
        match result.get("toolUseId").and_then(|id| id.as_str()) {
            Some(id) => {
                if seen.insert(id.to_string()) {
                    unique.push(result);
                }
            }
            None => unique.push(result),
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: serde_json::Value) -> claude::MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    fn plain_credential() -> KiroCredential {
        KiroCredential::default()
    }

    fn social_credential(arn: &str) -> KiroCredential {
        KiroCredential {
            auth_method: Some(llmux_auth::AuthMethod::Social),
            profile_arn: Some(arn.to_string()),
            ..KiroCredential::default()
        }
    }

    #[test]
    fn single_user_turn_has_no_history() {
        let req = parse(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "say hi"}]
        }));
        let body = build_request(&req, "claude-sonnet-4-5", &plain_credential());
        let message = &body["conversationState"]["currentMessage"]["userInputMessage"];
        assert_eq!(message["content"], "say hi");
        assert_eq!(message["modelId"], "CLAUDE_SONNET_4_5_20250929_V1_0");
        assert_eq!(message["origin"], "AI_EDITOR");
        assert!(body["conversationState"].get("history").is_none());
        assert_eq!(body["conversationState"]["chatTriggerType"], "MANUAL");
    }

    #[test]
    fn system_prompt_folds_into_first_user_turn() {
        let req = parse(serde_json::json!({
            "model": "m",
            "system": "S",
            "messages": [{"role": "user", "content": "U"}]
        }));
        let body = build_request(&req, "m", &plain_credential());
        assert_eq!(
            body["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "S\n\nU"
        );
        assert!(body["conversationState"].get("history").is_none());
    }

    #[test]
    fn system_prompt_without_user_becomes_synthetic_turn() {
        let req = parse(serde_json::json!({
            "model": "m",
            "system": "S",
            "messages": [{"role": "assistant", "content": "A"}]
        }));
        let body = build_request(&req, "m", &plain_credential());
        let history = body["conversationState"]["history"].as_array().unwrap();
        assert_eq!(history[0]["userInputMessage"]["content"], "S");
        assert_eq!(history[1]["assistantResponseMessage"]["content"], "A");
        assert_eq!(
            body["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "Continue"
        );
    }

    #[test]
    fn dangling_brace_assistant_tail_is_dropped() {
        let req = parse(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "U"},
                {"role": "assistant", "content": " { "}
            ]
        }));
        let body = build_request(&req, "m", &plain_credential());
        assert!(body["conversationState"].get("history").is_none());
        assert_eq!(
            body["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "U"
        );
    }

    #[test]
    fn adjacent_same_role_turns_merge() {
        let req = parse(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "a"},
                {"role": "user", "content": "b"},
                {"role": "user", "content": "c"}
            ]
        }));
        let body = build_request(&req, "m", &plain_credential());
        assert_eq!(
            body["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "a\nb\nc"
        );
    }

    #[test]
    fn assistant_tail_moves_to_history_with_continue() {
        let req = parse(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "U"},
                {"role": "assistant", "content": "A"}
            ]
        }));
        let body = build_request(&req, "m", &plain_credential());
        let history = body["conversationState"]["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1]["assistantResponseMessage"]["content"], "A");
        assert_eq!(
            body["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "Continue"
        );
    }

    #[test]
    fn empty_content_guard_with_tool_results() {
        let req = parse(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "42"},
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "42 again"}
                ]}
            ]
        }));
        let body = build_request(&req, "m", &plain_credential());
        let message = &body["conversationState"]["currentMessage"]["userInputMessage"];
        assert_eq!(message["content"], "Tool results provided.");
        let results = message["userInputMessageContext"]["toolResults"]
            .as_array()
            .unwrap();
        // Duplicate toolUseIds keep the first occurrence only.
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["content"][0]["text"], "42");
    }

    #[test]
    fn tools_are_wrapped_in_tool_specifications() {
        let req = parse(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "U"}],
            "tools": [{"name": "search", "description": "find",
                       "input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}}]
        }));
        let body = build_request(&req, "m", &plain_credential());
        let tools = body["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"]
            .as_array()
            .unwrap();
        assert_eq!(tools[0]["toolSpecification"]["name"], "search");
        assert_eq!(
            tools[0]["toolSpecification"]["inputSchema"]["json"]["type"],
            "object"
        );
    }

    #[test]
    fn profile_arn_only_for_social_accounts() {
        let req = parse(serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "U"}]
        }));
        let social = build_request(&req, "m", &social_credential("arn:aws:x"));
        assert_eq!(social["profileArn"], "arn:aws:x");

        let idc = build_request(&req, "m", &plain_credential());
        assert!(idc.get("profileArn").is_none());
    }

    #[test]
    fn unknown_models_pass_through() {
        assert_eq!(resolve_model_alias("amazonq-custom"), "amazonq-custom");
        assert_eq!(
            resolve_model_alias("claude-sonnet-4-20250514"),
            "CLAUDE_SONNET_4_20250514_V1_0"
        );
    }

    #[test]
    fn assistant_tool_uses_survive_in_history() {
        let req = parse(serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "U"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "calling"},
                    {"type": "tool_use", "id": "tu_1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "result"}
                ]}
            ]
        }));
        let body = build_request(&req, "m", &plain_credential());
        let history = body["conversationState"]["history"].as_array().unwrap();
        let tool_uses = history[1]["assistantResponseMessage"]["toolUses"]
            .as_array()
            .unwrap();
        assert_eq!(tool_uses[0]["toolUseId"], "tu_1");
        assert_eq!(tool_uses[0]["input"]["q"], "x");
        let message = &body["conversationState"]["currentMessage"]["userInputMessage"];
        assert_eq!(message["content"], "Tool results provided.");
    }
}
