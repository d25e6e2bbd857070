//! Model capability table and Ollama `show` synthesis.
//!
//! The table is closed: every family the proxy fronts is enumerated here and
//! anything else falls back to the conservative 4096/2048 pair.

use std::collections::BTreeMap;

use llmux_protocol::ollama;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub context_length: u32,
    pub max_output_tokens: u32,
    pub supports_tools: bool,
    pub supports_vision: bool,
}

const FALLBACK: ModelCapabilities = ModelCapabilities {
    context_length: 4096,
    max_output_tokens: 2048,
    supports_tools: false,
    supports_vision: false,
};

pub fn model_capabilities(model: &str) -> ModelCapabilities {
    let name = model.to_ascii_lowercase();

    if name.starts_with("claude") {
        let max_output_tokens = if name.contains("claude-3-5") {
            8192
        } else if name.contains("opus-4") || name.contains("sonnet-4") || name.contains("haiku-4") {
            64000
        } else {
            32000
        };
        return ModelCapabilities {
            context_length: 200_000,
            max_output_tokens,
            supports_tools: true,
            supports_vision: true,
        };
    }

    if name.starts_with("gemini") {
        let (context_length, max_output_tokens) = if name.contains("1.5-pro") {
            (2_097_152, 8192)
        } else if name.contains("1.5-flash") {
            (1_048_576, 8192)
        } else if name.contains("2.5") {
            (1_048_576, 65_536)
        } else if name.contains("2.0") {
            (1_048_576, 8192)
        } else {
            (32_768, 8192)
        };
        return ModelCapabilities {
            context_length,
            max_output_tokens,
            supports_tools: true,
            supports_vision: true,
        };
    }

    if name.starts_with("gpt-4o") || name.contains("gpt-4-turbo") {
        return ModelCapabilities {
            context_length: 128_000,
            max_output_tokens: 16_384,
            supports_tools: true,
            supports_vision: true,
        };
    }
    if name.starts_with("gpt-4") {
        return ModelCapabilities {
            context_length: 8192,
            max_output_tokens: 8192,
            supports_tools: true,
            supports_vision: false,
        };
    }
    if name.starts_with("gpt-3.5") {
        return ModelCapabilities {
            context_length: 16_385,
            max_output_tokens: 4096,
            supports_tools: true,
            supports_vision: false,
        };
    }

    if name.contains("qwen") {
        if name.contains("coder") {
            return ModelCapabilities {
                context_length: 131_072,
                max_output_tokens: 8192,
                supports_tools: true,
                supports_vision: false,
            };
        }
        if name.contains("vl") {
            return ModelCapabilities {
                context_length: 32_768,
                max_output_tokens: 8192,
                supports_tools: true,
                supports_vision: true,
            };
        }
        return ModelCapabilities {
            context_length: 32_768,
            max_output_tokens: 8192,
            supports_tools: true,
            supports_vision: false,
        };
    }

    FALLBACK
}

fn family_of(model: &str) -> &'static str {
    let name = model.to_ascii_lowercase();
    if name.starts_with("claude") {
        "claude"
    } else if name.starts_with("gemini") {
        "gemini"
    } else if name.starts_with("gpt") {
        "gpt"
    } else if name.contains("qwen") {
        "qwen"
    } else {
        "llama"
    }
}

/// Answer the Ollama `show` endpoint for a proxied model.
pub fn synthesize_show(model: &str) -> ollama::ShowResponse {
    let caps = model_capabilities(model);
    let family = family_of(model);

    let mut model_info = BTreeMap::new();
    model_info.insert(
        "general.architecture".to_string(),
        serde_json::json!(family),
    );
    model_info.insert(
        "general.basename".to_string(),
        serde_json::json!(model),
    );
    model_info.insert(
        "general.context_length".to_string(),
        serde_json::json!(caps.context_length),
    );
    model_info.insert(
        format!("{family}.context_length"),
        serde_json::json!(caps.context_length),
    );
    model_info.insert(
        format!("{family}.embedding_length"),
        serde_json::json!(8192),
    );

    let parameters = format!(
        "num_ctx {}\nnum_predict {}\nstop \"<|endoftext|>\"",
        caps.context_length, caps.max_output_tokens
    );

    let mut capabilities = vec!["completion".to_string()];
    if caps.supports_tools {
        capabilities.push("tools".to_string());
    }
    if caps.supports_vision {
        capabilities.push("vision".to_string());
    }

    ollama::ShowResponse {
        parameters,
        details: ollama::ModelDetails {
            format: "gguf".to_string(),
            family: family.to_string(),
            families: vec![family.to_string()],
            parameter_size: "unknown".to_string(),
            quantization_level: "unknown".to_string(),
        },
        model_info,
        capabilities,
    }
}
