//! Executor for the Kiro / AWS CodeWhisperer back-end.

mod request;
pub mod wire;

pub use request::resolve_model_alias;

use std::io::Read;
use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use llmux_auth::constants::{interpolate_region, DEFAULT_REGION};
use llmux_auth::{Account, Credential, KiroConstants, KiroCredential, KiroRefreshDriver, RefreshDriver};
use llmux_protocol::claude;
use llmux_translate::{translate_non_stream, translate_request, Dialect, StreamTranslator};

use crate::error::ExecuteError;
use crate::http::client_for;
use crate::tokens::{estimate_input_tokens, estimate_output_tokens};
use crate::usage::UsageReporter;
use crate::{ExecContext, ExecRequest, Executor, EventStream, StreamChunk, STREAM_CHANNEL_CAPACITY};

use wire::{EventRecognizer, WireEvent};

#[derive(Default)]
pub struct KiroExecutor {
    constants: KiroConstants,
    refresh_driver: KiroRefreshDriver,
}

impl KiroExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitute the URL table, e.g. to point at a scripted upstream.
    pub fn with_constants(constants: KiroConstants) -> Self {
        Self {
            refresh_driver: KiroRefreshDriver::with_constants(constants.clone()),
            constants,
        }
    }

    fn base_url(&self, region: &str, model: &str) -> String {
        // Amazon Q models use the SendMessageStreaming endpoint.
        if model.starts_with("amazonq") {
            interpolate_region(self.constants.amazon_q_url, region)
        } else {
            interpolate_region(self.constants.base_url, region)
        }
    }

    fn apply_headers(
        &self,
        builder: reqwest::RequestBuilder,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        let mac_hash = mac_address_sha256();
        let version = self.constants.version;
        builder
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("amz-sdk-request", "attempt=1; max=1")
            .header("x-amzn-kiro-agent-mode", "vibe")
            .header(
                "x-amz-user-agent",
                format!("aws-sdk-js/1.0.0 KiroIDE-{version}-{mac_hash}"),
            )
            .header(
                "User-Agent",
                format!(
                    "aws-sdk-js/1.0.0 ua/2.1 os/darwin lang/js md/nodejs#22.21.1 \
                     api/codewhispererruntime#1.0.0 m/N,E KiroIDE-{version}-{mac_hash}"
                ),
            )
            .header("amz-sdk-invocation-id", Uuid::new_v4().to_string())
    }

    async fn send_once(
        &self,
        ctx: &ExecContext,
        client: &reqwest::Client,
        url: &str,
        body: &[u8],
        account: &Account,
        access_token: &str,
    ) -> Result<reqwest::Response, ExecuteError> {
        let builder = self.apply_headers(client.post(url).body(body.to_vec()), access_token);
        let request = builder.build()?;
        let headers: Vec<(String, String)> = request
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        ctx.traffic.record_request(
            url,
            "POST",
            &headers,
            body,
            self.identifier(),
            &account.id,
        );
        let response = client.execute(request).await?;
        let response_headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        ctx.traffic
            .record_response(response.status().as_u16(), &response_headers);
        Ok(response)
    }

    /// Send the translated request. A 403 triggers one inline refresh and one
    /// retry with a body rebuilt from the canonical form; any further 403 is
    /// surfaced. 429 and 5xx surface immediately.
    async fn send_with_auth_retry(
        &self,
        ctx: &ExecContext,
        client: &reqwest::Client,
        claude_req: &claude::MessagesRequest,
        upstream_model: &str,
        account: &Account,
    ) -> Result<(reqwest::Response, Option<Account>), ExecuteError> {
        let credential = kiro_credential(account)?;
        let region = credential.region.as_deref().unwrap_or(DEFAULT_REGION);
        let url = self.base_url(region, upstream_model);

        let body = serde_json::to_vec(&request::build_request(
            claude_req,
            upstream_model,
            credential,
        ))
        .map_err(|err| ExecuteError::Decode(err.to_string()))?;

        let response = self
            .send_once(ctx, client, &url, &body, account, &credential.access_token)
            .await?;
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok((response, None));
        }

        let error_body = response.bytes().await.unwrap_or_default();
        ctx.traffic.append_chunk(&error_body);
        debug!(status, body = %String::from_utf8_lossy(&error_body), "kiro request error");

        if status == 403 && !credential.refresh_token.is_empty() {
            info!("kiro upstream returned 403; refreshing token and retrying once");
            let refreshed = self.refresh(ctx, account).await?;
            // Surface the rotated tokens even if the retry fails below.
            if let Some(updates) = &ctx.account_updates {
                let _ = updates.send(refreshed.clone());
            }
            let refreshed_credential = kiro_credential(&refreshed)?;
            let retry_body = serde_json::to_vec(&request::build_request(
                claude_req,
                upstream_model,
                refreshed_credential,
            ))
            .map_err(|err| ExecuteError::Decode(err.to_string()))?;
            let retry = self
                .send_once(
                    ctx,
                    client,
                    &url,
                    &retry_body,
                    &refreshed,
                    &refreshed_credential.access_token,
                )
                .await?;
            let retry_status = retry.status().as_u16();
            if (200..300).contains(&retry_status) {
                info!("kiro retry after token refresh succeeded");
                return Ok((retry, Some(refreshed)));
            }
            let retry_error = retry.bytes().await.unwrap_or_default();
            warn!(status = retry_status, "kiro retry after token refresh failed");
            return Err(ExecuteError::upstream(retry_status, &retry_error));
        }

        if status == 429 {
            warn!("kiro upstream rate limited");
        } else if (500..600).contains(&status) {
            warn!(status, "kiro upstream server error");
        }
        Err(ExecuteError::upstream(status, &error_body))
    }

    /// Build the synthetic Claude-shaped response from a parsed body.
    fn synthesize_response(
        &self,
        data: &[u8],
        model: &str,
        input_tokens: u32,
    ) -> serde_json::Value {
        let mut recognizer = EventRecognizer::new();
        let mut text = String::new();
        for event in recognizer.push(data) {
            if let WireEvent::Content(content) = event {
                text.push_str(&content);
            }
        }
        let output_tokens = estimate_output_tokens(&text);
        json!({
            "id": format!("msg_{}", Uuid::new_v4()),
            "type": "message",
            "role": "assistant",
            "model": model,
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
            "content": [{"type": "text", "text": text}],
        })
    }
}

#[async_trait]
impl Executor for KiroExecutor {
    fn identifier(&self) -> &'static str {
        "kiro"
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        account: &Account,
        request: ExecRequest,
    ) -> Result<Bytes, ExecuteError> {
        let reporter = UsageReporter::new(ctx, self.identifier(), &request.model, &account.id);

        let result = self.execute_inner(ctx, account, &request).await;
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

        let from = request.source_dialect;
        let claude_body = translate_request(
            from,
            Dialect::Claude,
            &request.model,
            &request.payload,
            true,
        )?;
        let claude_req: claude::MessagesRequest = serde_json::from_slice(&claude_body)
            .map_err(|err| ExecuteError::Decode(err.to_string()))?;
        let upstream_model = request.upstream_model().to_string();
        let input_tokens = estimate_input_tokens(&claude_req);

        let client = client_for(ctx.outbound_proxy.as_deref())?;
        let send_result = self
            .send_with_auth_retry(ctx, &client, &claude_req, &upstream_model, account)
            .await;
        let (response, _updated) = match send_result {
            Ok(value) => value,
            Err(err) => {
                reporter.publish_failure(&err.to_string());
                return Err(err);
            }
        };

        let encoding = response
            .headers()
            .get("content-encoding")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(STREAM_CHANNEL_CAPACITY);
        let ctx = ctx.clone();
        let model = request.model.clone();

        tokio::spawn(async move {
            let mut translator = StreamTranslator::new(Dialect::Claude, from, &model);
            let mut decoder = match BodyDecoder::new(encoding.as_deref()) {
                Ok(decoder) => decoder,
                Err(err) => {
                    reporter.publish_failure(&err.to_string());
                    let _ = tx.send(StreamChunk::Error(err)).await;
                    return;
                }
            };
            let mut recognizer = EventRecognizer::new();
            let message_id = format!("msg_{}", Uuid::new_v4());

            let mut emitter = FrameEmitter {
                tx: &tx,
                translator: &mut translator,
            };

            // Handshake: message_start, then the text block at index 0.
            let start = claude::StreamEvent::MessageStart {
                message: claude::MessageStart {
                    id: message_id,
                    kind: "message".to_string(),
                    role: "assistant".to_string(),
                    model: model.clone(),
                    content: Vec::new(),
                    usage: claude::Usage {
                        input_tokens,
                        output_tokens: 0,
                    },
                },
            };
            if !emitter.emit(&start).await {
                return;
            }
            let block_start = claude::StreamEvent::ContentBlockStart {
                index: 0,
                content_block: claude::StreamContentBlock::Text {
                    text: String::new(),
                },
            };
            if !emitter.emit(&block_start).await {
                return;
            }

            let mut total_content = String::new();
            let mut tool_input = String::new();
            let mut last_content = String::new();
            let mut block_index = 0usize;
            let mut tool_open = false;

            let mut byte_stream = response.bytes_stream();
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        ctx.traffic.record_error(&err.to_string());
                        reporter.publish_failure(&err.to_string());
                        let _ = tx.send(StreamChunk::Error(ExecuteError::Transport(err))).await;
                        return;
                    }
                };
                ctx.traffic.append_chunk(&chunk);
                let decoded = match decoder.push(&chunk) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        reporter.publish_failure(&err.to_string());
                        let _ = tx.send(StreamChunk::Error(err)).await;
                        return;
                    }
                };

                for event in recognizer.push(&decoded) {
                    let emitted = match event {
                        WireEvent::Content(text) => {
                            // The upstream sometimes retransmits the tail chunk.
                            if text.is_empty() || text == last_content {
                                continue;
                            }
                            last_content = text.clone();
                            total_content.push_str(&text);
                            emitter
                                .emit(&claude::StreamEvent::ContentBlockDelta {
                                    index: block_index,
                                    delta: claude::ContentDelta::TextDelta { text },
                                })
                                .await
                        }
                        WireEvent::ToolUse {
                            name,
                            tool_use_id,
                            input,
                            stop,
                        } => {
                            let mut ok = true;
                            if !tool_open {
                                if block_index == 0 && !total_content.is_empty() {
                                    ok = emitter
                                        .emit(&claude::StreamEvent::ContentBlockStop { index: 0 })
                                        .await;
                                    block_index = 1;
                                }
                                if ok {
                                    tool_open = true;
                                    ok = emitter
                                        .emit(&claude::StreamEvent::ContentBlockStart {
                                            index: block_index,
                                            content_block: claude::StreamContentBlock::ToolUse {
                                                id: tool_use_id,
                                                name,
                                                input: json!({}),
                                            },
                                        })
                                        .await;
                                }
                            }
                            if ok && !input.is_empty() {
                                tool_input.push_str(&input);
                                ok = emitter
                                    .emit(&claude::StreamEvent::ContentBlockDelta {
                                        index: block_index,
                                        delta: claude::ContentDelta::InputJsonDelta {
                                            partial_json: input,
                                        },
                                    })
                                    .await;
                            }
                            if ok && stop {
                                ok = emitter
                                    .emit(&claude::StreamEvent::ContentBlockStop {
                                        index: block_index,
                                    })
                                    .await;
                                block_index += 1;
                                tool_open = false;
                            }
                            ok
                        }
                        WireEvent::ToolInput(input) => {
                            tool_input.push_str(&input);
                            emitter
                                .emit(&claude::StreamEvent::ContentBlockDelta {
                                    index: block_index,
                                    delta: claude::ContentDelta::InputJsonDelta {
                                        partial_json: input,
                                    },
                                })
                                .await
                        }
                        WireEvent::ToolStop => {
                            if tool_open {
                                let ok = emitter
                                    .emit(&claude::StreamEvent::ContentBlockStop {
                                        index: block_index,
                                    })
                                    .await;
                                block_index += 1;
                                tool_open = false;
                                ok
                            } else {
                                true
                            }
                        }
                    };
                    if !emitted {
                        return;
                    }
                }
            }

            // EOF cleanup: close whatever is still open.
            if tool_open {
                if !emitter
                    .emit(&claude::StreamEvent::ContentBlockStop { index: block_index })
                    .await
                {
                    return;
                }
                block_index += 1;
            }
            if block_index == 0
                && !emitter
                    .emit(&claude::StreamEvent::ContentBlockStop { index: 0 })
                    .await
            {
                return;
            }

            let stop_reason = if block_index > 0 {
                claude::StopReason::ToolUse
            } else {
                claude::StopReason::EndTurn
            };
            let output_tokens =
                estimate_output_tokens(&format!("{total_content}{tool_input}"));
            let delta = claude::StreamEvent::MessageDelta {
                delta: claude::MessageDeltaBody {
                    stop_reason: Some(stop_reason),
                    stop_sequence: None,
                },
                usage: Some(claude::DeltaUsage { output_tokens }),
            };
            if !emitter.emit(&delta).await {
                return;
            }
            if !emitter.emit(&claude::StreamEvent::MessageStop).await {
                return;
            }
            for frame in emitter.translator.finish() {
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
        let credential = kiro_credential(account)?;
        if credential.refresh_token.is_empty() {
            return Ok(account.clone());
        }
        let client = llmux_auth::refresh_http_client();
        let refreshed = self.refresh_driver.refresh(account, &client).await?;
        let mut updated = account.clone();
        updated.apply_refreshed(refreshed);
        Ok(updated)
    }
}

impl KiroExecutor {
    async fn execute_inner(
        &self,
        ctx: &ExecContext,
        account: &Account,
        request: &ExecRequest,
    ) -> Result<Bytes, ExecuteError> {
        let from = request.source_dialect;
        let claude_body = translate_request(
            from,
            Dialect::Claude,
            &request.model,
            &request.payload,
            true,
        )?;
        let claude_req: claude::MessagesRequest = serde_json::from_slice(&claude_body)
            .map_err(|err| ExecuteError::Decode(err.to_string()))?;
        let upstream_model = request.upstream_model();
        let input_tokens = estimate_input_tokens(&claude_req);

        let client = client_for(ctx.outbound_proxy.as_deref())?;
        let (response, _updated) = self
            .send_with_auth_retry(ctx, &client, &claude_req, upstream_model, account)
            .await?;

        let encoding = response
            .headers()
            .get("content-encoding")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let raw = response.bytes().await?;
        let data = decode_full_body(&raw, encoding.as_deref())?;
        ctx.traffic.append_chunk(&data);

        let claude_response = self.synthesize_response(&data, &request.model, input_tokens);
        let rendered = serde_json::to_vec(&claude_response)
            .map_err(|err| ExecuteError::Decode(err.to_string()))?;
        let out = translate_non_stream(Dialect::Claude, from, &request.model, &rendered)?;
        Ok(Bytes::from(out))
    }
}

/// Sends translated frames downstream; a closed receiver aborts the stream.
struct FrameEmitter<'a> {
    tx: &'a tokio::sync::mpsc::Sender<StreamChunk>,
    translator: &'a mut StreamTranslator,
}

impl FrameEmitter<'_> {
    async fn emit(&mut self, event: &claude::StreamEvent) -> bool {
        let frames = self.translator.push(event.to_sse().as_bytes());
        for frame in frames {
            if self.tx.send(StreamChunk::Payload(frame)).await.is_err() {
                return false;
            }
        }
        true
    }
}

fn kiro_credential(account: &Account) -> Result<&KiroCredential, ExecuteError> {
    match &account.credential {
        Credential::Kiro(credential) => {
            if credential.access_token.is_empty() && credential.refresh_token.is_empty() {
                Err(ExecuteError::MissingCredential("access_token"))
            } else {
                Ok(credential)
            }
        }
        _ => Err(ExecuteError::MissingCredential("kiro credential")),
    }
}

fn mac_address_sha256() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| {
        let mac = mac_address::get_mac_address()
            .ok()
            .flatten()
            .map(|mac| mac.to_string().to_ascii_lowercase())
            .filter(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00")
            .unwrap_or_else(|| "00:00:00:00:00:00".to_string());
        let digest = Sha256::digest(mac.as_bytes());
        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    })
}

/// Streaming Content-Encoding handling: plain, gzip or deflate.
enum BodyDecoder {
    Plain,
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Deflate(flate2::write::ZlibDecoder<Vec<u8>>),
}

impl BodyDecoder {
    fn new(encoding: Option<&str>) -> Result<Self, ExecuteError> {
        match encoding.map(str::trim) {
            None | Some("") | Some("identity") => Ok(BodyDecoder::Plain),
            Some("gzip") => Ok(BodyDecoder::Gzip(flate2::write::GzDecoder::new(Vec::new()))),
            Some("deflate") => Ok(BodyDecoder::Deflate(flate2::write::ZlibDecoder::new(
                Vec::new(),
            ))),
            Some(other) => Err(ExecuteError::Decode(format!(
                "unsupported content-encoding: {other}"
            ))),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>, ExecuteError> {
        use std::io::Write;
        match self {
            BodyDecoder::Plain => Ok(chunk.to_vec()),
            BodyDecoder::Gzip(decoder) => {
                decoder
                    .write_all(chunk)
                    .and_then(|_| decoder.flush())
                    .map_err(|err| ExecuteError::Decode(err.to_string()))?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            BodyDecoder::Deflate(decoder) => {
                decoder
                    .write_all(chunk)
                    .and_then(|_| decoder.flush())
                    .map_err(|err| ExecuteError::Decode(err.to_string()))?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }
}

fn decode_full_body(data: &[u8], encoding: Option<&str>) -> Result<Vec<u8>, ExecuteError> {
    match encoding.map(str::trim) {
        None | Some("") | Some("identity") => Ok(data.to_vec()),
        Some("gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|err| ExecuteError::Decode(err.to_string()))?;
            Ok(out)
        }
        Some("deflate") => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|err| ExecuteError::Decode(err.to_string()))?;
            Ok(out)
        }
        Some(other) => Err(ExecuteError::Decode(format!(
            "unsupported content-encoding: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_switches_on_amazonq_prefix() {
        let exec = KiroExecutor::new();
        assert_eq!(
            exec.base_url("us-east-1", "claude-sonnet-4-5"),
            "https://codewhisperer.us-east-1.amazonaws.com/generateAssistantResponse"
        );
        assert_eq!(
            exec.base_url("eu-west-1", "amazonq-pro"),
            "https://codewhisperer.eu-west-1.amazonaws.com/SendMessageStreaming"
        );
    }

    #[test]
    fn mac_hash_is_stable_hex() {
        let first = mac_address_sha256();
        let second = mac_address_sha256();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn synthesized_response_concatenates_text_events() {
        let exec = KiroExecutor::new();
        let mut data = Vec::new();
        data.extend_from_slice(br#"{"content":"Hello"}"#);
        data.extend_from_slice(&[0u8, 1, 2]);
        data.extend_from_slice(br#"{"content":"."}"#);
        let value = exec.synthesize_response(&data, "claude-sonnet-4-5", 7);
        assert_eq!(value["content"][0]["text"], "Hello.");
        assert_eq!(value["stop_reason"], "end_turn");
        assert_eq!(value["usage"]["input_tokens"], 7);
        assert_eq!(value["model"], "claude-sonnet-4-5");
        assert!(value["id"].as_str().unwrap().starts_with("msg_"));
    }

    #[test]
    fn gzip_round_trip_decodes() {
        use std::io::Write;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(br#"{"content":"ok"}"#).unwrap();
        let compressed = encoder.finish().unwrap();
        let decoded = decode_full_body(&compressed, Some("gzip")).unwrap();
        assert_eq!(decoded, br#"{"content":"ok"}"#);
    }

    #[test]
    fn unknown_encoding_is_a_decode_error() {
        assert!(matches!(
            decode_full_body(b"x", Some("br")),
            Err(ExecuteError::Decode(_))
        ));
    }

    #[test]
    fn missing_tokens_fail_credential_extraction() {
        let account = Account::new(
            "kiro-us-east-1.json",
            llmux_auth::ProviderKind::Kiro,
            Credential::Kiro(KiroCredential::default()),
        );
        assert!(matches!(
            kiro_credential(&account),
            Err(ExecuteError::MissingCredential(_))
        ));
    }
}
