//! Best-effort host callbacks for request/response recording.
//!
//! The management surface observes upstream traffic through these hooks; a
//! host that does not care installs the no-op sink.

use std::sync::Arc;

pub type Headers = Vec<(String, String)>;

pub trait TrafficSink: Send + Sync {
    fn record_request(
        &self,
        _url: &str,
        _method: &str,
        _headers: &Headers,
        _body: &[u8],
        _provider: &str,
        _account: &str,
    ) {
    }

    fn record_response(&self, _status: u16, _headers: &Headers) {}

    fn append_chunk(&self, _chunk: &[u8]) {}

    fn record_error(&self, _error: &str) {}
}

pub struct NoopTrafficSink;

impl TrafficSink for NoopTrafficSink {}

pub type SharedTrafficSink = Arc<dyn TrafficSink>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        chunks: AtomicUsize,
    }

    impl TrafficSink for CountingSink {
        fn append_chunk(&self, _chunk: &[u8]) {
            self.chunks.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn default_methods_are_no_ops() {
        let sink = CountingSink::default();
        sink.record_request("u", "POST", &Vec::new(), b"", "kiro", "a");
        sink.record_response(200, &Vec::new());
        sink.append_chunk(b"x");
        sink.record_error("boom");
        assert_eq!(sink.chunks.load(Ordering::Relaxed), 1);
    }
}
