use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("backend API error: status={status}, body={body}")]
    Api { status: u16, body: String },

    #[error("backend returned invalid response: {0}")]
    InvalidResponse(String),

    #[error("remote circuit open, retry in {retry_in_ms} ms")]
    CircuitOpen { retry_in_ms: u64 },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("generation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether one more HTTP try against the same endpoint could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Http(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            EngineError::Api { status, .. } => {
                matches!(*status, 408 | 429) || *status >= 500
            }
            _ => false,
        }
    }
}
