//! OpenAI-compatible SSE executor behavior against a scripted upstream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;

use llmux_auth::{Account, Credential, OAuthTokenCredential, ProviderKind};
use llmux_executor::sse_exec::{SseExecutor, SseProvider};
use llmux_executor::{ExecContext, ExecRequest, Executor, StreamChunk};
use llmux_protocol::SseParser;
use llmux_translate::Dialect;

#[derive(Default)]
struct Upstream {
    calls: AtomicU32,
    refreshes: AtomicU32,
    deny_first: std::sync::atomic::AtomicBool,
    last_authorization: Mutex<String>,
}

fn sse_body() -> String {
    let chunk = |json: serde_json::Value| format!("data: {json}\n\n");
    let mut body = String::new();
    body.push_str(&chunk(serde_json::json!({
        "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "qwen3-coder-plus",
        "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}]
    })));
    body.push_str(&chunk(serde_json::json!({
        "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "qwen3-coder-plus",
        "choices": [{"index": 0, "delta": {"content": "Hel"}, "finish_reason": null}]
    })));
    body.push_str(&chunk(serde_json::json!({
        "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "qwen3-coder-plus",
        "choices": [{"index": 0, "delta": {"content": "lo."}, "finish_reason": "stop"}]
    })));
    body.push_str("data: [DONE]\n\n");
    body
}

async fn chat_handler(
    State(upstream): State<Arc<Upstream>>,
    headers: HeaderMap,
) -> (StatusCode, Vec<u8>) {
    upstream.calls.fetch_add(1, Ordering::SeqCst);
    *upstream.last_authorization.lock().unwrap() = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if upstream.deny_first.swap(false, Ordering::SeqCst) {
        return (StatusCode::FORBIDDEN, b"token expired".to_vec());
    }
    (StatusCode::OK, sse_body().into_bytes())
}

async fn token_handler(State(upstream): State<Arc<Upstream>>) -> (StatusCode, Vec<u8>) {
    upstream.refreshes.fetch_add(1, Ordering::SeqCst);
    let body = serde_json::json!({
        "access_token": "T2",
        "refresh_token": "R2",
        "expires_in": 3600
    });
    (StatusCode::OK, serde_json::to_vec(&body).unwrap())
}

async fn spawn_upstream(upstream: Arc<Upstream>) -> SocketAddr {
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_handler))
        .route("/oauth/token", post(token_handler))
        .with_state(upstream);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn provider_at(addr: SocketAddr) -> SseProvider {
    SseProvider {
        base_url: format!("http://{addr}/v1"),
        token_url: Some(format!("http://{addr}/oauth/token")),
        ..SseProvider::qwen()
    }
}

fn oauth_account() -> Account {
    Account::new(
        "qwen-1.json",
        ProviderKind::Qwen,
        Credential::OAuth(OAuthTokenCredential {
            access_token: "T1".to_string(),
            refresh_token: "R1".to_string(),
            ..OAuthTokenCredential::default()
        }),
    )
}

fn claude_request() -> ExecRequest {
    ExecRequest::new(
        Dialect::Claude,
        "qwen3-coder-plus",
        Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "model": "qwen3-coder-plus",
                "max_tokens": 128,
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .unwrap(),
        ),
    )
}

#[tokio::test]
async fn openai_stream_is_reassembled_as_claude_sse() {
    let upstream = Arc::new(Upstream::default());
    let addr = spawn_upstream(upstream.clone()).await;
    let exec = SseExecutor::new(provider_at(addr));
    let account = oauth_account();

    let mut rx = exec
        .execute_stream(&ExecContext::default(), &account, claude_request())
        .await
        .unwrap();

    let mut parser = SseParser::new();
    let mut names = Vec::new();
    let mut text = String::new();
    while let Some(chunk) = rx.recv().await {
        let StreamChunk::Payload(bytes) = chunk else {
            panic!("unexpected stream error");
        };
        for frame in parser.push_bytes(&bytes) {
            if let Some(name) = frame.event.clone() {
                names.push(name);
            }
            if let Ok(event) =
                serde_json::from_str::<llmux_protocol::claude::StreamEvent>(&frame.data)
            {
                if let llmux_protocol::claude::StreamEvent::ContentBlockDelta {
                    delta: llmux_protocol::claude::ContentDelta::TextDelta { text: delta },
                    ..
                } = event
                {
                    text.push_str(&delta);
                }
            }
        }
    }

    assert_eq!(text, "Hello.");
    assert_eq!(names.first().map(String::as_str), Some("message_start"));
    assert_eq!(names.last().map(String::as_str), Some("message_stop"));
    assert!(names.iter().any(|name| name == "content_block_delta"));
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn oauth_refresh_retry_on_403() {
    let upstream = Arc::new(Upstream::default());
    upstream.deny_first.store(true, Ordering::SeqCst);
    let addr = spawn_upstream(upstream.clone()).await;
    let exec = SseExecutor::new(provider_at(addr));
    let account = oauth_account();

    let (updates_tx, mut updates_rx) = tokio::sync::mpsc::unbounded_channel();
    let ctx = ExecContext {
        account_updates: Some(updates_tx),
        ..ExecContext::default()
    };

    let rx = exec.execute_stream(&ctx, &account, claude_request()).await.unwrap();
    drop(rx);

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    assert_eq!(upstream.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(
        upstream.last_authorization.lock().unwrap().as_str(),
        "Bearer T2"
    );
    let updated = updates_rx.try_recv().unwrap();
    assert_eq!(updated.access_token(), "T2");
}

async fn nonstream_chat_handler() -> (StatusCode, Vec<u8>) {
    let body = serde_json::json!({
        "id": "c2", "object": "chat.completion", "created": 2,
        "model": "qwen3-coder-plus",
        "choices": [{"index": 0,
                     "message": {"role": "assistant", "content": "Hello."},
                     "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    });
    (StatusCode::OK, serde_json::to_vec(&body).unwrap())
}

#[tokio::test]
async fn non_stream_response_translates_back_to_source() {
    // Non-stream path replies with a plain chat completion.
    let app = Router::new().route("/v1/chat/completions", post(nonstream_chat_handler));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr2 = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let exec = SseExecutor::new(provider_at(addr2));
    let account = oauth_account();
    let out = exec
        .execute(&ExecContext::default(), &account, claude_request())
        .await
        .unwrap();

    let response: llmux_protocol::claude::MessagesResponse = serde_json::from_slice(&out).unwrap();
    assert_eq!(response.role, "assistant");
    assert!(matches!(
        &response.content[0],
        llmux_protocol::claude::ContentBlock::Text { text } if text == "Hello."
    ));
    assert_eq!(response.usage.input_tokens, 3);
    assert_eq!(response.usage.output_tokens, 2);
}
