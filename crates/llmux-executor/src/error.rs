use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("missing credential field: {0}")]
    MissingCredential(&'static str),

    /// Non-2xx upstream response surfaced to the host. 403 is consumed
    /// internally by the refresh-retry path before this is returned.
    #[error("upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Decompression or parse failure on upstream data; host maps to 502.
    #[error("upstream decode error: {0}")]
    Decode(String),

    #[error("request canceled")]
    Canceled,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Translate(#[from] llmux_translate::TranslateError),

    #[error(transparent)]
    Auth(#[from] llmux_auth::AuthError),
}

impl ExecuteError {
    pub fn upstream(status: u16, body: &[u8]) -> Self {
        ExecuteError::Upstream {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ExecuteError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}
