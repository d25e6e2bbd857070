//! Provider executors.
//!
//! An executor adapts the internal request shape to one provider's wire
//! protocol: request serialization, streaming event parsing, and
//! failure-driven token refresh with a single transparent retry. Executors
//! are stateless beyond their constants; everything per-request arrives as
//! arguments.

pub mod error;
pub mod http;
pub mod kiro;
pub mod sse_exec;
pub mod tokens;
pub mod traffic;
pub mod usage;

pub use error::ExecuteError;
pub use kiro::KiroExecutor;
pub use sse_exec::{SseExecutor, SseProvider};
pub use traffic::{NoopTrafficSink, SharedTrafficSink, TrafficSink};
pub use usage::{QuotaSnapshot, UsageEvent, UsageOutcome, UsageReporter};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use llmux_auth::Account;
use llmux_translate::Dialect;

/// Metadata key carrying the user-facing model name before aliasing.
pub const META_ORIGINAL_MODEL: &str = "original_model";

/// One inbound request, immutable during execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub source_dialect: Dialect,
    pub model: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
}

impl ExecRequest {
    pub fn new(source_dialect: Dialect, model: impl Into<String>, payload: Bytes) -> Self {
        Self {
            source_dialect,
            model: model.into(),
            payload,
            metadata: HashMap::new(),
        }
    }

    /// The model identifier to send upstream; falls back to the request model.
    pub fn upstream_model(&self) -> &str {
        self.metadata
            .get(META_ORIGINAL_MODEL)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.model)
    }
}

/// One translated frame of a streamed response, or a terminal error.
#[derive(Debug)]
pub enum StreamChunk {
    Payload(Bytes),
    Error(ExecuteError),
}

/// Per-request execution context supplied by the host.
#[derive(Clone)]
pub struct ExecContext {
    pub traffic: SharedTrafficSink,
    pub outbound_proxy: Option<String>,
    pub usage: Option<tokio::sync::mpsc::UnboundedSender<UsageEvent>>,
    /// Accounts rotated by an inline 403 refresh are surfaced here so the
    /// host can persist them.
    pub account_updates: Option<tokio::sync::mpsc::UnboundedSender<Account>>,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            traffic: Arc::new(NoopTrafficSink),
            outbound_proxy: None,
            usage: None,
            account_updates: None,
        }
    }
}

/// Streamed responses are delivered through a bounded channel; a slow
/// consumer back-pressures the upstream reader. Dropping the receiver
/// cancels the stream task.
pub type EventStream = tokio::sync::mpsc::Receiver<StreamChunk>;

pub(crate) const STREAM_CHANNEL_CAPACITY: usize = 32;

#[async_trait]
pub trait Executor: Send + Sync {
    fn identifier(&self) -> &'static str;

    async fn execute(
        &self,
        ctx: &ExecContext,
        account: &Account,
        request: ExecRequest,
    ) -> Result<Bytes, ExecuteError>;

    async fn execute_stream(
        &self,
        ctx: &ExecContext,
        account: &Account,
        request: ExecRequest,
    ) -> Result<EventStream, ExecuteError>;

    async fn count_tokens(
        &self,
        _ctx: &ExecContext,
        _account: &Account,
        _request: ExecRequest,
    ) -> Result<Bytes, ExecuteError> {
        Err(ExecuteError::Unsupported("count_tokens"))
    }

    /// Exchange the account's refresh token for new token material.
    async fn refresh(
        &self,
        ctx: &ExecContext,
        account: &Account,
    ) -> Result<Account, ExecuteError>;
}
