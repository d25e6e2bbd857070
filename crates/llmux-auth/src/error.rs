use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// No eligible account for the requested provider.
    #[error("no account available for provider {0}")]
    NoAccount(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("token refresh failed with status {status}: {body}")]
    RefreshFailed { status: u16, body: String },

    #[error("refresh transport error: {0}")]
    RefreshTransport(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("credential serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl AuthError {
    /// Trim an upstream error body down to a loggable excerpt.
    pub fn refresh_failed(status: u16, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let excerpt: String = text.chars().take(512).collect();
        AuthError::RefreshFailed {
            status,
            body: excerpt,
        }
    }
}
