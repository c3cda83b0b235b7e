//! Sorted-SHA1 signature used to authenticate both inbound channels'
//! envelopes: `sha1(sort_lex([token, timestamp, nonce, encrypt]).join(""))`,
//! hex-encoded, compared in constant time.

use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// Computes the signature over the four lexically-sorted fields.
pub fn compute(token: &str, timestamp: &str, nonce: &str, encrypt: &str) -> String {
    let mut parts = [token, timestamp, nonce, encrypt];
    parts.sort_unstable();

    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Verifies `signature` against the recomputed value in constant time, so a
/// timing side-channel can't be used to guess the signature byte-by-byte.
pub fn verify(token: &str, timestamp: &str, nonce: &str, encrypt: &str, signature: &str) -> bool {
    let expected = compute(token, timestamp, nonce, encrypt);
    if expected.len() != signature.len() {
        return false;
    }
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_is_order_independent_in_inputs() {
        let a = compute("tok", "1234", "nonce1", "cipher");
        let b = compute("cipher", "tok", "1234", "nonce1");
        assert_eq!(a, b, "signature only depends on the set of fields, not call order");
    }

    #[test]
    fn verify_accepts_matching_signature() {
        let sig = compute("tok", "1234", "nonce1", "cipher");
        assert!(verify("tok", "1234", "nonce1", "cipher", &sig));
    }

    #[test]
    fn verify_rejects_tampered_field() {
        let sig = compute("tok", "1234", "nonce1", "cipher");
        assert!(!verify("tok", "1234", "nonce1", "tampered", &sig));
    }

    #[test]
    fn verify_rejects_wrong_length_signature() {
        assert!(!verify("tok", "1234", "nonce1", "cipher", "deadbeef"));
    }
}
