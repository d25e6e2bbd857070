//! Per-provider constants: URL templates and client fingerprints.

pub const DEFAULT_REGION: &str = "us-east-1";

/// Constants for the Kiro / CodeWhisperer back-end. URLs carry a
/// `{{region}}` placeholder interpolated at call time.
#[derive(Debug, Clone)]
pub struct KiroConstants {
    pub refresh_url: &'static str,
    pub refresh_idc_url: &'static str,
    pub base_url: &'static str,
    pub amazon_q_url: &'static str,
    pub usage_limits_url: &'static str,
    pub default_model: &'static str,
    pub user_agent: &'static str,
    pub version: &'static str,
}

impl Default for KiroConstants {
    fn default() -> Self {
        Self {
            refresh_url: "https://prod.{{region}}.auth.desktop.kiro.dev/refreshToken",
            refresh_idc_url: "https://oidc.{{region}}.amazonaws.com/token",
            base_url: "https://codewhisperer.{{region}}.amazonaws.com/generateAssistantResponse",
            amazon_q_url: "https://codewhisperer.{{region}}.amazonaws.com/SendMessageStreaming",
            usage_limits_url: "https://q.{{region}}.amazonaws.com/getUsageLimits",
            default_model: "claude-opus-4-5",
            user_agent: "KiroIDE",
            version: "0.7.5",
        }
    }
}

pub const ORIGIN_AI_EDITOR: &str = "AI_EDITOR";
pub const CHAT_TRIGGER_MANUAL: &str = "MANUAL";

pub fn interpolate_region(template: &str, region: &str) -> String {
    let region = if region.is_empty() {
        DEFAULT_REGION
    } else {
        region
    };
    template.replace("{{region}}", region)
}
