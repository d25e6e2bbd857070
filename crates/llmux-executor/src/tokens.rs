//! Character-based token estimation.
//!
//! The upstream has no native tokenizer, so counts are approximations:
//! roughly four characters per token plus fixed overheads per structural
//! element. Never treat these numbers as authoritative.

use llmux_protocol::claude;

const BASE_REQUEST_OVERHEAD: u32 = 4;
const SYSTEM_OVERHEAD: u32 = 2;
const MESSAGE_OVERHEAD: u32 = 4;
const ROLE_OVERHEAD: u32 = 1;
const BLOCK_STRUCTURE_OVERHEAD: u32 = 4;
const IMAGE_TOKENS: u32 = 1500;

pub fn count_text_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    ((text.len() + 3) / 4) as u32
}

pub fn estimate_output_tokens(text: &str) -> u32 {
    count_text_tokens(text)
}

pub fn estimate_input_tokens(request: &claude::MessagesRequest) -> u32 {
    let mut total = BASE_REQUEST_OVERHEAD;

    if let Some(system) = &request.system {
        total += count_text_tokens(&system.joined_text());
        total += SYSTEM_OVERHEAD;
    }

    for message in &request.messages {
        total += MESSAGE_OVERHEAD + ROLE_OVERHEAD;
        total += estimate_content_tokens(&message.content);
    }

    if let Some(tools) = &request.tools {
        let (base, per_tool) = match tools.len() {
            0 => (0, 0),
            1 => (0, 50),
            2..=5 => (100, 30),
            _ => (180, 20),
        };
        total += base;
        for tool in tools {
            total += count_text_tokens(&tool.name);
            total += count_text_tokens(tool.description.as_deref().unwrap_or_default());
            total += count_text_tokens(&tool.input_schema.to_string());
            total += per_tool;
        }
    }

    total
}

fn estimate_content_tokens(content: &claude::MessageContent) -> u32 {
    match content {
        claude::MessageContent::Text(text) => count_text_tokens(text),
        claude::MessageContent::Blocks(blocks) => blocks.iter().map(estimate_block_tokens).sum(),
    }
}

fn estimate_block_tokens(block: &claude::ContentBlock) -> u32 {
    match block {
        claude::ContentBlock::Text { text } => count_text_tokens(text),
        claude::ContentBlock::Image { .. } => IMAGE_TOKENS,
        claude::ContentBlock::ToolUse { name, input, .. } => {
            BLOCK_STRUCTURE_OVERHEAD + count_text_tokens(name) + count_text_tokens(&input.to_string())
        }
        claude::ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => {
            let mut total = BLOCK_STRUCTURE_OVERHEAD + count_text_tokens(tool_use_id);
            if let Some(content) = content {
                total += match content {
                    claude::ToolResultContent::Text(text) => count_text_tokens(text),
                    claude::ToolResultContent::Blocks(blocks) => {
                        blocks.iter().map(estimate_block_tokens).sum()
                    }
                };
            }
            total
        }
        claude::ContentBlock::Thinking { thinking } => count_text_tokens(thinking),
    }
}
