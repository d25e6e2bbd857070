//! Dialect translation.
//!
//! Every conversion routes through the Claude messages form, which is the
//! canonical shape executors produce and consume. `translate_request` turns a
//! source-dialect request into the provider dialect, `translate_non_stream`
//! maps a finished upstream response back into the source dialect, and
//! [`StreamTranslator`] does the same for live streams without ever dropping
//! a delta.

mod gemini_claude;
mod model_info;
mod ollama;
mod openai_claude;
mod stream;

pub use model_info::{model_capabilities, synthesize_show, ModelCapabilities};
pub use stream::StreamTranslator;

use llmux_protocol::claude;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Claude,
    OpenAiChat,
    Gemini,
    OllamaChat,
    OllamaGenerate,
}

impl Dialect {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claude" => Some(Dialect::Claude),
            "openai" | "openai_chat" => Some(Dialect::OpenAiChat),
            "gemini" => Some(Dialect::Gemini),
            "ollama" | "ollama_chat" => Some(Dialect::OllamaChat),
            "ollama_generate" => Some(Dialect::OllamaGenerate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Claude => "claude",
            Dialect::OpenAiChat => "openai",
            Dialect::Gemini => "gemini",
            Dialect::OllamaChat => "ollama",
            Dialect::OllamaGenerate => "ollama_generate",
        }
    }
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("malformed {dialect} payload: {source}")]
    Malformed {
        dialect: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported conversion: {from} -> {to}")]
    Unsupported { from: &'static str, to: &'static str },
}

impl TranslateError {
    fn malformed(dialect: Dialect, source: serde_json::Error) -> Self {
        TranslateError::Malformed {
            dialect: dialect.as_str(),
            source,
        }
    }
}

/// Translate a request body from one dialect to another.
///
/// `model` overrides the model carried in the body (the host may have resolved
/// an alias). With `strict` unset, a source body that fails to parse is passed
/// through unchanged when source and target dialects agree, which lets opaque
/// provider extensions survive same-dialect proxying.
pub fn translate_request(
    from: Dialect,
    to: Dialect,
    model: &str,
    body: &[u8],
    strict: bool,
) -> Result<Vec<u8>, TranslateError> {
    let canonical = match canonicalize_request(from, model, body) {
        Ok(req) => req,
        Err(err) => {
            if !strict && from == to {
                return Ok(body.to_vec());
            }
            return Err(err);
        }
    };
    render_request(to, canonical)
}

fn canonicalize_request(
    from: Dialect,
    model: &str,
    body: &[u8],
) -> Result<claude::MessagesRequest, TranslateError> {
    let mut req = match from {
        Dialect::Claude => serde_json::from_slice::<claude::MessagesRequest>(body)
            .map_err(|err| TranslateError::malformed(from, err))?,
        Dialect::OpenAiChat => {
            let req = serde_json::from_slice(body)
                .map_err(|err| TranslateError::malformed(from, err))?;
            openai_claude::request_to_claude(req)
        }
        Dialect::Gemini => {
            let req = serde_json::from_slice(body)
                .map_err(|err| TranslateError::malformed(from, err))?;
            gemini_claude::request_to_claude(model, req)
        }
        Dialect::OllamaChat => {
            let req = serde_json::from_slice(body)
                .map_err(|err| TranslateError::malformed(from, err))?;
            openai_claude::request_to_claude(ollama::chat_request_to_openai(req))
        }
        Dialect::OllamaGenerate => {
            let req = serde_json::from_slice(body)
                .map_err(|err| TranslateError::malformed(from, err))?;
            openai_claude::request_to_claude(ollama::generate_request_to_openai(req))
        }
    };
    if !model.is_empty() {
        req.model = model.to_string();
    }
    Ok(req)
}

fn render_request(
    to: Dialect,
    canonical: claude::MessagesRequest,
) -> Result<Vec<u8>, TranslateError> {
    let value = match to {
        Dialect::Claude => serde_json::to_vec(&canonical),
        Dialect::OpenAiChat => serde_json::to_vec(&openai_claude::request_from_claude(canonical)),
        Dialect::Gemini => serde_json::to_vec(&gemini_claude::request_from_claude(canonical)),
        Dialect::OllamaChat | Dialect::OllamaGenerate => {
            serde_json::to_vec(&ollama::chat_request_from_claude(canonical))
        }
    };
    value.map_err(|err| TranslateError::malformed(to, err))
}

/// Translate a finished upstream response (`upstream` dialect) into the
/// caller's `source` dialect.
pub fn translate_non_stream(
    upstream: Dialect,
    source: Dialect,
    model: &str,
    response: &[u8],
) -> Result<Vec<u8>, TranslateError> {
    let canonical = match upstream {
        Dialect::Claude => serde_json::from_slice::<claude::MessagesResponse>(response)
            .map_err(|err| TranslateError::malformed(upstream, err))?,
        Dialect::OpenAiChat => {
            let resp = serde_json::from_slice(response)
                .map_err(|err| TranslateError::malformed(upstream, err))?;
            openai_claude::response_to_claude(resp)
        }
        Dialect::Gemini => {
            let resp = serde_json::from_slice(response)
                .map_err(|err| TranslateError::malformed(upstream, err))?;
            gemini_claude::response_to_claude(model, resp)
        }
        Dialect::OllamaChat | Dialect::OllamaGenerate => {
            return Err(TranslateError::Unsupported {
                from: upstream.as_str(),
                to: source.as_str(),
            });
        }
    };

    let rendered = match source {
        Dialect::Claude => serde_json::to_vec(&canonical),
        Dialect::OpenAiChat => serde_json::to_vec(&openai_claude::response_from_claude(&canonical)),
        Dialect::Gemini => serde_json::to_vec(&gemini_claude::response_from_claude(&canonical)),
        Dialect::OllamaChat => serde_json::to_vec(&ollama::chat_response_from_claude(&canonical)),
        Dialect::OllamaGenerate => {
            serde_json::to_vec(&ollama::generate_response_from_claude(&canonical))
        }
    };
    rendered.map_err(|err| TranslateError::malformed(source, err))
}

pub(crate) fn stop_reason_to_openai(
    reason: claude::StopReason,
) -> llmux_protocol::openai::FinishReason {
    use llmux_protocol::openai::FinishReason;
    match reason {
        claude::StopReason::EndTurn | claude::StopReason::StopSequence => FinishReason::Stop,
        claude::StopReason::MaxTokens => FinishReason::Length,
        claude::StopReason::ToolUse => FinishReason::ToolCalls,
    }
}

pub(crate) fn stop_reason_from_openai(
    reason: llmux_protocol::openai::FinishReason,
) -> claude::StopReason {
    use llmux_protocol::openai::FinishReason;
    match reason {
        FinishReason::Stop | FinishReason::ContentFilter => claude::StopReason::EndTurn,
        FinishReason::Length => claude::StopReason::MaxTokens,
        FinishReason::ToolCalls => claude::StopReason::ToolUse,
    }
}

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_parse_known_names() {
        assert_eq!(Dialect::parse("claude"), Some(Dialect::Claude));
        assert_eq!(Dialect::parse("openai"), Some(Dialect::OpenAiChat));
        assert_eq!(Dialect::parse("ollama"), Some(Dialect::OllamaChat));
        assert_eq!(Dialect::parse("mystery"), None);
    }

    #[test]
    fn same_dialect_passthrough_when_not_strict() {
        let opaque = br#"{"model": 3}"#;
        let out = translate_request(Dialect::Claude, Dialect::Claude, "m", opaque, false).unwrap();
        assert_eq!(out, opaque.to_vec());
        assert!(translate_request(Dialect::Claude, Dialect::Claude, "m", opaque, true).is_err());
    }

    #[test]
    fn openai_request_reaches_claude_form() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "say hi"}]
        });
        let out = translate_request(
            Dialect::OpenAiChat,
            Dialect::Claude,
            "claude-sonnet-4-5",
            &serde_json::to_vec(&body).unwrap(),
            true,
        )
        .unwrap();
        let req: llmux_protocol::claude::MessagesRequest = serde_json::from_slice(&out).unwrap();
        assert_eq!(req.model, "claude-sonnet-4-5");
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].content.joined_text(), "say hi");
    }

    #[test]
    fn round_trip_preserves_roles_text_and_tools() {
        let body = serde_json::json!({
            "model": "m",
            "max_tokens": 512,
            "system": "S",
            "messages": [
                {"role": "user", "content": "question"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "thinking"},
                    {"type": "tool_use", "id": "tu_1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "result text"}
                ]}
            ],
            "tools": [{"name": "search", "description": "find things",
                       "input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}}]
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        let openai = translate_request(Dialect::Claude, Dialect::OpenAiChat, "m", &bytes, true).unwrap();
        let back = translate_request(Dialect::OpenAiChat, Dialect::Claude, "m", &openai, true).unwrap();
        let req: llmux_protocol::claude::MessagesRequest = serde_json::from_slice(&back).unwrap();

        assert_eq!(req.system.unwrap().joined_text(), "S");
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[0].content.joined_text(), "question");
        assert_eq!(req.messages[1].content.joined_text(), "thinking");
        let tools = req.tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[0].description.as_deref(), Some("find things"));

        let blocks = match &req.messages[1].content {
            llmux_protocol::claude::MessageContent::Blocks(blocks) => blocks,
            other => panic!("unexpected content: {other:?}"),
        };
        assert!(blocks.iter().any(|block| matches!(
            block,
            llmux_protocol::claude::ContentBlock::ToolUse { id, name, .. }
                if id == "tu_1" && name == "search"
        )));
    }

    #[test]
    fn gemini_round_trip_preserves_function_calls() {
        let body = serde_json::json!({
            "contents": [
                {"role": "user", "parts": [{"text": "q"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "search", "args": {"q": "x"}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "search", "response": {"result": "ok"}}}]}
            ],
            "systemInstruction": {"parts": [{"text": "S"}]}
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        let canonical =
            translate_request(Dialect::Gemini, Dialect::Claude, "gemini-2.5-pro", &bytes, true)
                .unwrap();
        let back = translate_request(
            Dialect::Claude,
            Dialect::Gemini,
            "gemini-2.5-pro",
            &canonical,
            true,
        )
        .unwrap();
        let req: llmux_protocol::gemini::GenerateContentRequest =
            serde_json::from_slice(&back).unwrap();
        assert_eq!(req.contents.len(), 3);
        assert!(req.contents[1].parts[0].function_call.is_some());
        assert!(req.contents[2].parts[0].function_response.is_some());
        assert_eq!(req.system_instruction.unwrap().joined_text(), "S");
    }
}
