use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("invalid encoding aes key: {0}")]
    InvalidKey(String),

    #[error("ciphertext is not a multiple of the block size")]
    UnalignedCiphertext,

    #[error("padding is invalid or missing")]
    BadPadding,

    #[error("decoded plaintext is shorter than the fixed header")]
    ShortPlaintext,

    #[error("receiver id embedded in plaintext does not match the configured corp id")]
    ReceiverIdMismatch,

    #[error("base64 decode failed: {0}")]
    Base64(String),
}

impl CryptoError {
    pub fn code(&self) -> &'static str {
        match self {
            CryptoError::SignatureMismatch => "SIGNATURE_MISMATCH",
            CryptoError::InvalidKey(_) => "INVALID_KEY",
            CryptoError::UnalignedCiphertext => "UNALIGNED_CIPHERTEXT",
            CryptoError::BadPadding => "BAD_PADDING",
            CryptoError::ShortPlaintext => "SHORT_PLAINTEXT",
            CryptoError::ReceiverIdMismatch => "RECEIVER_ID_MISMATCH",
            CryptoError::Base64(_) => "BASE64_DECODE_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
