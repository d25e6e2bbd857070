//! Wire DTOs for the dialects llmux translates between.
//!
//! This crate intentionally does **not** depend on any HTTP client or server.
//! It only defines the serde shapes of the four public dialects plus the SSE
//! line protocol used by the streaming ones.

pub mod claude;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod sse;

pub use sse::{SseEvent, SseParser};
