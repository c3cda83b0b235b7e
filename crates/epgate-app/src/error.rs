use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("decrypt failed: {0}")]
    Decrypt(String),

    #[error("request body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("invalid xml payload: {0}")]
    InvalidPayload(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::SignatureMismatch => "SIGNATURE_MISMATCH",
            AppError::Decrypt(_) => "DECRYPT_FAILED",
            AppError::BodyTooLarge { .. } => "BODY_TOO_LARGE",
            AppError::InvalidPayload(_) => "INVALID_PAYLOAD",
        }
    }

    /// HTTP status this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::SignatureMismatch => 401,
            AppError::Decrypt(_) | AppError::BodyTooLarge { .. } | AppError::InvalidPayload(_) => 400,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
