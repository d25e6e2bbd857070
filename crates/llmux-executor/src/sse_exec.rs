//! Executors for SSE-speaking back-ends.
//!
//! One implementation covers every provider whose wire protocol is a
//! JSON-over-SSE chat API: OpenAI itself and the OpenAI-compatible OAuth
//! back-ends (Qwen, iFlow), plus the Claude and Gemini native APIs. The
//! provider profile picks the upstream dialect, URLs and headers; request
//! construction and stream reassembly go through the translator.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use llmux_auth::{Account, Credential, OAuthRefreshDriver, ProviderKind, RefreshDriver};
use llmux_translate::{translate_non_stream, translate_request, Dialect, StreamTranslator};

use crate::error::ExecuteError;
use crate::http::client_for;
use crate::usage::UsageReporter;
use crate::{ExecContext, ExecRequest, Executor, EventStream, StreamChunk, STREAM_CHANNEL_CAPACITY};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20";
const CLAUDE_OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Wire profile of one SSE back-end.
#[derive(Debug, Clone)]
pub struct SseProvider {
    pub identifier: &'static str,
    pub provider: ProviderKind,
    /// The dialect the upstream natively speaks.
    pub dialect: Dialect,
    pub base_url: String,
    /// OAuth token endpoint; absent for API-key providers.
    pub token_url: Option<String>,
    pub default_client_id: Option<String>,
}

impl SseProvider {
    pub fn openai() -> Self {
        Self {
            identifier: "openai",
            provider: ProviderKind::OpenAi,
            dialect: Dialect::OpenAiChat,
            base_url: "https://api.openai.com/v1".to_string(),
            token_url: None,
            default_client_id: None,
        }
    }

    pub fn qwen() -> Self {
        Self {
            identifier: "qwen",
            provider: ProviderKind::Qwen,
            dialect: Dialect::OpenAiChat,
            base_url: "https://portal.qwen.ai/v1".to_string(),
            token_url: Some("https://chat.qwen.ai/api/v1/oauth2/token".to_string()),
            default_client_id: Some("f0304373b74a44d2b584a3fb70ca9e56".to_string()),
        }
    }

    pub fn iflow() -> Self {
        Self {
            identifier: "iflow",
            provider: ProviderKind::IFlow,
            dialect: Dialect::OpenAiChat,
            base_url: "https://apis.iflow.cn/v1".to_string(),
            token_url: Some("https://iflow.cn/oauth/token".to_string()),
            default_client_id: None,
        }
    }

    pub fn claude() -> Self {
        Self {
            identifier: "claude",
            provider: ProviderKind::Claude,
            dialect: Dialect::Claude,
            base_url: "https://api.anthropic.com".to_string(),
            token_url: Some("https://api.anthropic.com/v1/oauth/token".to_string()),
            default_client_id: Some(CLAUDE_OAUTH_CLIENT_ID.to_string()),
        }
    }

    pub fn gemini() -> Self {
        Self {
            identifier: "gemini",
            provider: ProviderKind::Gemini,
            dialect: Dialect::Gemini,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            token_url: Some("https://oauth2.googleapis.com/token".to_string()),
            default_client_id: None,
        }
    }

    pub fn antigravity() -> Self {
        Self {
            identifier: "antigravity",
            provider: ProviderKind::Antigravity,
            dialect: Dialect::Gemini,
            base_url: "https://antigravity.googleapis.com/v1internal".to_string(),
            token_url: Some("https://oauth2.googleapis.com/token".to_string()),
            default_client_id: None,
        }
    }

    fn request_url(&self, model: &str, stream: bool) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.dialect {
            Dialect::OpenAiChat => format!("{base}/chat/completions"),
            Dialect::Claude => format!("{base}/v1/messages"),
            Dialect::Gemini => {
                if stream {
                    format!("{base}/models/{model}:streamGenerateContent?alt=sse")
                } else {
                    format!("{base}/models/{model}:generateContent")
                }
            }
            Dialect::OllamaChat | Dialect::OllamaGenerate => {
                format!("{base}/api/chat")
            }
        }
    }
}

pub struct SseExecutor {
    spec: SseProvider,
    refresh_driver: Option<OAuthRefreshDriver>,
}

impl SseExecutor {
    pub fn new(spec: SseProvider) -> Self {
        let refresh_driver = spec.token_url.clone().map(|url| {
            OAuthRefreshDriver::new(spec.provider, url, spec.default_client_id.clone())
        });
        Self {
            spec,
            refresh_driver,
        }
    }

    /// Override the base URL, e.g. for a self-hosted compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.spec.base_url = base_url.into();
        self
    }

    fn build_body(
        &self,
        request: &ExecRequest,
        stream: bool,
    ) -> Result<Vec<u8>, ExecuteError> {
        let translated = translate_request(
            request.source_dialect,
            self.spec.dialect,
            request.upstream_model(),
            &request.payload,
            true,
        )?;
        // The stream flag travels in the body for OpenAI and Claude shapes;
        // Gemini selects streaming through the URL.
        match self.spec.dialect {
            Dialect::OpenAiChat | Dialect::Claude => {
                let mut value: JsonValue = serde_json::from_slice(&translated)
                    .map_err(|err| ExecuteError::Decode(err.to_string()))?;
                if let Some(object) = value.as_object_mut() {
                    object.insert("stream".to_string(), JsonValue::Bool(stream));
                }
                serde_json::to_vec(&value).map_err(|err| ExecuteError::Decode(err.to_string()))
            }
            _ => Ok(translated),
        }
    }

    fn apply_headers(
        &self,
        builder: reqwest::RequestBuilder,
        account: &Account,
    ) -> reqwest::RequestBuilder {
        let mut builder = builder
            .header("Authorization", format!("Bearer {}", account.access_token()))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        if self.spec.dialect == Dialect::Claude {
            builder = builder
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("anthropic-beta", ANTHROPIC_OAUTH_BETA);
        }
        builder
    }

    async fn send_with_auth_retry(
        &self,
        ctx: &ExecContext,
        client: &reqwest::Client,
        account: &Account,
        request: &ExecRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ExecuteError> {
        let url = self.spec.request_url(request.upstream_model(), stream);
        let body = self.build_body(request, stream)?;

        let response = self
            .send_once(ctx, client, &url, &body, account)
            .await?;
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(response);
        }
        let error_body = response.bytes().await.unwrap_or_default();
        ctx.traffic.append_chunk(&error_body);

        let can_refresh = self.refresh_driver.is_some() && !account.refresh_token().is_empty();
        if status == 403 && can_refresh {
            info!(provider = self.spec.identifier, "403 from upstream; refreshing and retrying once");
            let refreshed = self.refresh(ctx, account).await?;
            if let Some(updates) = &ctx.account_updates {
                let _ = updates.send(refreshed.clone());
            }
            let retry = self
                .send_once(ctx, client, &url, &body, &refreshed)
                .await?;
            let retry_status = retry.status().as_u16();
            if (200..300).contains(&retry_status) {
                return Ok(retry);
            }
            let retry_error = retry.bytes().await.unwrap_or_default();
            warn!(
                provider = self.spec.identifier,
                status = retry_status,
                "retry after token refresh failed"
            );
            return Err(ExecuteError::upstream(retry_status, &retry_error));
        }

        Err(ExecuteError::upstream(status, &error_body))
    }

    async fn send_once(
        &self,
        ctx: &ExecContext,
        client: &reqwest::Client,
        url: &str,
        body: &[u8],
        account: &Account,
    ) -> Result<reqwest::Response, ExecuteError> {
        ctx.traffic.record_request(
            url,
            "POST",
            &Vec::new(),
            body,
            self.spec.identifier,
            &account.id,
        );
        let response = self
            .apply_headers(client.post(url).body(body.to_vec()), account)
            .send()
            .await?;
        ctx.traffic
            .record_response(response.status().as_u16(), &Vec::new());
        Ok(response)
    }
}

#[async_trait]
impl Executor for SseExecutor {
    fn identifier(&self) -> &'static str {
        self.spec.identifier
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        account: &Account,
        request: ExecRequest,
    ) -> Result<Bytes, ExecuteError> {
        let reporter = UsageReporter::new(ctx, self.identifier(), &request.model, &account.id);

        let result: Result<Bytes, ExecuteError> = async {
            let client = client_for(ctx.outbound_proxy.as_deref())?;
            let response = self
                .send_with_auth_retry(ctx, &client, account, &request, false)
                .await?;
            let bytes = response.bytes().await?;
            ctx.traffic.append_chunk(&bytes);
            let out = translate_non_stream(
                self.spec.dialect,
                request.source_dialect,
                &request.model,
                &bytes,
            )?;
            Ok(Bytes::from(out))
        }
        .await;

        match &result {
            Ok(_) => reporter.publish_success(),
            Err(err) => reporter.publish_failure(&err.to_string()),
        }
        result
    }

    async fn execute_stream(
        &self,
        ctx: &ExecContext,
        account: &Account,
        request: ExecRequest,
    ) -> Result<EventStream, ExecuteError> {
        let reporter = UsageReporter::new(ctx, self.identifier(), &request.model, &account.id);

        let client = client_for(ctx.outbound_proxy.as_deref())?;
        let response = match self
            .send_with_auth_retry(ctx, &client, account, &request, true)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                reporter.publish_failure(&err.to_string());
                return Err(err);
            }
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(STREAM_CHANNEL_CAPACITY);
        let upstream = self.spec.dialect;
        let source = request.source_dialect;
        let model = request.model.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let mut translator = StreamTranslator::new(upstream, source, &model);
            let mut byte_stream = response.bytes_stream();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        ctx.traffic.record_error(&err.to_string());
                        reporter.publish_failure(&err.to_string());
                        let _ = tx
                            .send(StreamChunk::Error(ExecuteError::Transport(err)))
                            .await;
                        return;
                    }
                };
                ctx.traffic.append_chunk(&chunk);
                for frame in translator.push(&chunk) {
                    if tx.send(StreamChunk::Payload(frame)).await.is_err() {
                        return;
                    }
                }
            }
            for frame in translator.finish() {
                if tx.send(StreamChunk::Payload(frame)).await.is_err() {
                    return;
                }
            }
            reporter.publish_success();
        });

        Ok(rx)
    }

    async fn refresh(
        &self,
        _ctx: &ExecContext,
        account: &Account,
    ) -> Result<Account, ExecuteError> {
        let Some(driver) = &self.refresh_driver else {
            return Ok(account.clone());
        };
        if !matches!(account.credential, Credential::OAuth(_)) {
            return Ok(account.clone());
        }
        let client = llmux_auth::refresh_http_client();
        let credential = driver.refresh(account, &client).await?;
        let mut updated = account.clone();
        updated.apply_refreshed(credential);
        Ok(updated)
    }
}
