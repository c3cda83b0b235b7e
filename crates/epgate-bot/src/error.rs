use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("decrypt failed: {0}")]
    Decrypt(String),

    #[error("request body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl BotError {
    pub fn code(&self) -> &'static str {
        match self {
            BotError::SignatureMismatch => "SIGNATURE_MISMATCH",
            BotError::Decrypt(_) => "DECRYPT_FAILED",
            BotError::BodyTooLarge { .. } => "BODY_TOO_LARGE",
            BotError::InvalidPayload(_) => "INVALID_PAYLOAD",
        }
    }

    /// HTTP status this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            BotError::SignatureMismatch => 401,
            BotError::Decrypt(_) | BotError::BodyTooLarge { .. } | BotError::InvalidPayload(_) => 400,
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
