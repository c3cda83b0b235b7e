use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("partial failure sending to {target}: invalid recipients {invalid:?}")]
    PartialFailure { target: String, invalid: Vec<String> },

    #[error("upstream API error {errcode}: {errmsg}")]
    Upstream { errcode: i64, errmsg: String },

    #[error("request to {url} timed out after {ms}ms")]
    Timeout { url: String, ms: u64 },

    #[error("response body exceeded {max} bytes")]
    BodyTooLarge { max: u64 },

    #[error("http transport error: {0}")]
    Transport(String),

    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),

    #[error("ambiguous or unresolvable target: {0}")]
    UnresolvableTarget(String),
}

impl ClientError {
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::TokenRefresh(_) => "TOKEN_REFRESH_FAILED",
            ClientError::PartialFailure { .. } => "PARTIAL_FAILURE",
            ClientError::Upstream { .. } => "UPSTREAM_ERROR",
            ClientError::Timeout { .. } => "TIMEOUT",
            ClientError::BodyTooLarge { .. } => "BODY_TOO_LARGE",
            ClientError::Transport(_) => "TRANSPORT_ERROR",
            ClientError::InvalidResponse(_) => "INVALID_RESPONSE",
            ClientError::UnresolvableTarget(_) => "UNRESOLVABLE_TARGET",
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
