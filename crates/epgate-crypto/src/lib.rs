pub mod cipher;
pub mod error;
pub mod signature;

pub use error::{CryptoError, Result};

/// Verifies the signature and decrypts an inbound envelope in one step —
/// the shape both the Bot and Application handlers need before they can
/// touch the plaintext payload.
pub fn open_envelope(
    encoding_aes_key: &str,
    token: &str,
    receiver_id: &str,
    timestamp: &str,
    nonce: &str,
    msg_signature: &str,
    encrypt_b64: &str,
) -> Result<Vec<u8>> {
    if !signature::verify(token, timestamp, nonce, encrypt_b64, msg_signature) {
        return Err(CryptoError::SignatureMismatch);
    }
    cipher::decrypt(encoding_aes_key, receiver_id, encrypt_b64)
}

/// Encrypts and signs an outbound reply envelope.
pub fn seal_envelope(
    encoding_aes_key: &str,
    token: &str,
    receiver_id: &str,
    timestamp: &str,
    nonce: &str,
    msg: &[u8],
) -> Result<(String, String)> {
    let encrypt_b64 = cipher::encrypt(encoding_aes_key, receiver_id, msg)?;
    let sig = signature::compute(token, timestamp, nonce, &encrypt_b64);
    Ok((encrypt_b64, sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "jWmYm7qr5nMoAEWo9FjciXYzjxM4OmKrPG1PGIoQJSv";

    #[test]
    fn open_envelope_round_trips_with_seal_envelope() {
        let msg = br#"{"msgtype":"text","text":{"content":"hi"}}"#;
        let (encrypt_b64, sig) =
            seal_envelope(TEST_KEY, "tok", "corp1", "1690000000", "noncexyz", msg).unwrap();

        let opened = open_envelope(TEST_KEY, "tok", "corp1", "1690000000", "noncexyz", &sig, &encrypt_b64)
            .unwrap();
        assert_eq!(opened, msg);
    }

    #[test]
    fn open_envelope_rejects_bad_signature() {
        let msg = b"payload";
        let (encrypt_b64, _sig) =
            seal_envelope(TEST_KEY, "tok", "corp1", "1690000000", "noncexyz", msg).unwrap();

        let err = open_envelope(
            TEST_KEY,
            "tok",
            "corp1",
            "1690000000",
            "noncexyz",
            "0000000000000000000000000000000000000000",
            &encrypt_b64,
        )
        .unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_MISMATCH");
    }
}
