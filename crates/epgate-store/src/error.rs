use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no stream found for id {0}")]
    UnknownStream(String),

    #[error("no active-reply url registered for stream {0}")]
    NoActiveReplyUrl(String),

    #[error("active-reply url dispatch failed: {0}")]
    ActiveReplyDispatch(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::UnknownStream(_) => "UNKNOWN_STREAM",
            StoreError::NoActiveReplyUrl(_) => "NO_ACTIVE_REPLY_URL",
            StoreError::ActiveReplyDispatch(_) => "ACTIVE_REPLY_DISPATCH_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
