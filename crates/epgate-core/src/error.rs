use thiserror::Error;

/// Error taxonomy for the inbound reception & delivery fabric.
///
/// Each variant carries a short machine-readable `code()` used both in HTTP
/// error bodies and in log correlation.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("decrypt failed: {0}")]
    Decrypt(String),

    #[error("request body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("upstream API error {errcode}: {errmsg}")]
    Upstream { errcode: i64, errmsg: String },

    #[error("partial send failure: {0}")]
    PartialFailure(String),

    #[error("media too large: {size} bytes (max {max})")]
    MediaTooLarge { size: u64, max: u64 },

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("agent dispatch failed: {0}")]
    AgentDispatch(String),

    #[error("command not authorized: {reason}")]
    Unauthorized { reason: String },

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Short machine-readable error code, stable across versions.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::SignatureMismatch => "SIGNATURE_MISMATCH",
            GatewayError::Decrypt(_) => "DECRYPT_FAILED",
            GatewayError::BodyTooLarge { .. } => "BODY_TOO_LARGE",
            GatewayError::InvalidPayload(_) => "INVALID_PAYLOAD",
            GatewayError::Upstream { .. } => "UPSTREAM_ERROR",
            GatewayError::PartialFailure(_) => "PARTIAL_FAILURE",
            GatewayError::MediaTooLarge { .. } => "MEDIA_TOO_LARGE",
            GatewayError::TokenRefresh(_) => "TOKEN_REFRESH_FAILED",
            GatewayError::AgentDispatch(_) => "AGENT_DISPATCH_FAILED",
            GatewayError::Unauthorized { .. } => "UNAUTHORIZED",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
